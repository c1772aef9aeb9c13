//! Scheduling and task delivery engine for buildq.
//!
//! Builds own their tasks and a [`unicast::Unicast`] queue of runnable
//! tasks. The [`PriorityScheduler`] pairs available workers with ready
//! builds; workers then pull the tasks through [`Executor`]s.

pub mod broadcast;
pub mod build;
pub mod config;
pub mod executor;
pub mod metrics;
pub mod priority;
pub mod queue;
pub mod scheduler;
mod sync;
pub mod task;
pub mod unicast;
pub mod worker;

pub use build::{Build, BuildUpdateObserver};
pub use config::SchedulerConfig;
pub use executor::Executor;
pub use priority::PriorityScheduler;
pub use scheduler::{BuildInfo, Scheduler, SchedulerObserver, Statistics, TaskInfo, WorkerInfo};
pub use task::{Task, TaskUpdateObserver};
pub use worker::Worker;
