//! In-memory log store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::ports::{LogReader, LogStash, LogWriter};
use crate::protocol::LogLine;
use crate::{Error, Result};

/// Default capacity in lines across all logs.
pub const DEFAULT_MAX_LINES: usize = 1_000_000;

#[derive(Default)]
struct Store {
    logs: HashMap<String, Vec<LogLine>>,
    // Instances in first-write order, oldest first.
    order: VecDeque<String>,
    // Open writers per instance. Logs listed here are never evicted.
    writers: HashMap<String, usize>,
    lines: usize,
}

impl Store {
    fn release(&mut self, instance: &str) {
        if let Some(count) = self.writers.get_mut(instance) {
            *count -= 1;
            if *count == 0 {
                self.writers.remove(instance);
            }
        }
    }

    /// Drop whole logs oldest-first, skipping open ones, until at most
    /// `max_lines` remain or only open logs are left.
    fn evict(&mut self, max_lines: usize) {
        while self.lines > max_lines {
            let Some(pos) = self
                .order
                .iter()
                .position(|instance| !self.writers.contains_key(instance))
            else {
                break;
            };
            if let Some(oldest) = self.order.remove(pos)
                && let Some(evicted) = self.logs.remove(&oldest)
            {
                self.lines -= evicted.len();
            }
        }
    }
}

/// Log store bounded by a total line count. Whole logs are evicted
/// oldest-first once the bound is exceeded; logs with an open writer are
/// kept.
pub struct MemoryLogStash {
    store: Arc<Mutex<Store>>,
    max_lines: usize,
}

impl MemoryLogStash {
    pub fn new(max_lines: usize) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            max_lines: max_lines.max(1),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.store).map(|s| s.logs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryLogStash {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

fn lock(store: &Mutex<Store>) -> Result<MutexGuard<'_, Store>> {
    store
        .lock()
        .map_err(|_| Error::Internal("log store lock poisoned".to_string()))
}

impl LogStash for MemoryLogStash {
    fn append(&self, instance: &str) -> Result<Box<dyn LogWriter>> {
        let mut store = lock(&self.store)?;
        if !store.logs.contains_key(instance) {
            store.logs.insert(instance.to_string(), Vec::new());
            store.order.push_back(instance.to_string());
        }
        *store.writers.entry(instance.to_string()).or_default() += 1;
        Ok(Box::new(MemoryLogWriter {
            store: Arc::clone(&self.store),
            instance: instance.to_string(),
            max_lines: self.max_lines,
            closed: false,
        }))
    }

    fn read(&self, instance: &str) -> Result<Box<dyn LogReader>> {
        let store = lock(&self.store)?;
        let lines = store
            .logs
            .get(instance)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("log {instance}")))?;
        Ok(Box::new(MemoryLogReader {
            lines: lines.into(),
        }))
    }
}

struct MemoryLogWriter {
    store: Arc<Mutex<Store>>,
    instance: String,
    max_lines: usize,
    closed: bool,
}

impl LogWriter for MemoryLogWriter {
    fn write_line(&mut self, line: &LogLine) -> Result<()> {
        if self.closed {
            return Err(Error::Internal(format!(
                "write to closed log {}",
                self.instance
            )));
        }

        let mut store = lock(&self.store)?;
        store
            .logs
            .entry(self.instance.clone())
            .or_default()
            .push(line.clone());
        store.lines += 1;
        store.evict(self.max_lines);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            let mut store = lock(&self.store)?;
            store.release(&self.instance);
            store.evict(self.max_lines);
        }
        Ok(())
    }
}

impl Drop for MemoryLogWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct MemoryLogReader {
    lines: VecDeque<LogLine>,
}

impl LogReader for MemoryLogReader {
    fn read_line(&mut self) -> Result<Option<LogLine>> {
        Ok(self.lines.pop_front())
    }

    fn close(&mut self) {
        self.lines.clear();
    }
}
