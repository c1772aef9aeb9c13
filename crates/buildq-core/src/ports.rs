//! Port traits for external collaborators.
//!
//! The scheduler only needs to append and read task logs; storage,
//! retention and presentation live behind these traits.

use crate::protocol::LogLine;
use crate::Result;

/// Sink for the log lines of one task instance.
pub trait LogWriter: Send {
    fn write_line(&mut self, line: &LogLine) -> Result<()>;

    /// Flush and release the writer. Further writes fail.
    fn close(&mut self) -> Result<()>;
}

/// Sequential reader over the log of one task instance.
pub trait LogReader: Send {
    /// Next line, or `None` at end of log.
    fn read_line(&mut self) -> Result<Option<LogLine>>;

    fn close(&mut self);
}

impl std::fmt::Debug for dyn LogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader").finish_non_exhaustive()
    }
}

/// Append/read log store keyed by task instance id.
pub trait LogStash: Send + Sync {
    fn append(&self, instance: &str) -> Result<Box<dyn LogWriter>>;

    /// Fails with `NotFound` if nothing was ever written for `instance`.
    fn read(&self, instance: &str) -> Result<Box<dyn LogReader>>;
}
