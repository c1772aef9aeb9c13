//! Stream logic behind each remote call, independent of the transport.
//!
//! Each service reads inbound messages from an `mpsc::Receiver` and writes
//! replies to an `mpsc::Sender`. A transport drops its sender half when the
//! peer disconnects, which the services observe as end of input or a
//! closed output.

pub mod scheduler;
pub mod worker;

pub use scheduler::SchedulerService;
pub use worker::WorkerService;
