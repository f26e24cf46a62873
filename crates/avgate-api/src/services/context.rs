//! Per-request bookkeeping: phase tracking, metrics, prioritized cleanup,
//! and the resource registry.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), anyhow::Error>> + Send>;

struct CleanupTask {
    priority: u8,
    name: &'static str,
    action: CleanupAction,
}

/// What a tracked resource is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Socket,
    TempFile,
}

struct ResourceEntry {
    kind: ResourceKind,
    label: String,
    created_at: Instant,
    last_access: Instant,
    size: u64,
    released: bool,
}

/// Per-request registry of allocated resources. Exists so cleanup can
/// verify it visited everything, and to feed the terminal log line.
#[derive(Default)]
pub struct ResourceTracker {
    entries: Vec<ResourceEntry>,
    peak_memory: u64,
}

impl ResourceTracker {
    pub fn register(&mut self, kind: ResourceKind, label: impl Into<String>, size: u64) -> usize {
        let now = Instant::now();
        self.entries.push(ResourceEntry {
            kind,
            label: label.into(),
            created_at: now,
            last_access: now,
            size,
            released: false,
        });
        self.entries.len() - 1
    }

    pub fn touch(&mut self, id: usize, size: u64) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_access = Instant::now();
            entry.size = size;
            if entry.kind == ResourceKind::Buffer {
                self.peak_memory = self.peak_memory.max(size);
            }
        }
    }

    pub fn release(&mut self, id: usize) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.released = true;
        }
    }

    pub fn release_all(&mut self) {
        for entry in &mut self.entries {
            entry.released = true;
        }
    }

    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.released).count()
    }

    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }

    /// Final sweep: logs anything cleanup missed, then drops every entry.
    pub fn drop_entries(&mut self) {
        for entry in self.entries.iter().filter(|e| !e.released) {
            tracing::warn!(
                label = %entry.label,
                kind = ?entry.kind,
                size = entry.size,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                idle_ms = entry.last_access.elapsed().as_millis() as u64,
                "Resource not released before final sweep"
            );
        }
        self.release_all();
    }
}

/// Context for one request's trip through the phase machine.
///
/// The tracker is shared so cleanup tasks registered against it stay
/// callable after the pipeline has returned.
pub struct RequestContext {
    pub request_id: String,
    pub phase: &'static str,
    started: Instant,
    pub bytes_processed: u64,
    pub operations: u64,
    pub tracker: std::sync::Arc<std::sync::Mutex<ResourceTracker>>,
    cleanup: Vec<CleanupTask>,
}

impl RequestContext {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            phase: "init",
            started: Instant::now(),
            bytes_processed: 0,
            operations: 0,
            tracker: std::sync::Arc::new(std::sync::Mutex::new(ResourceTracker::default())),
            cleanup: Vec::new(),
        }
    }

    pub fn peak_memory(&self) -> u64 {
        self.tracker
            .lock()
            .map(|t| t.peak_memory())
            .unwrap_or_default()
    }

    pub fn enter_phase(&mut self, phase: &'static str) {
        self.phase = phase;
        tracing::debug!(request_id = %self.request_id, phase, "Entering phase");
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Absolute deadline for the whole request.
    pub fn deadline_exceeded(&self, budget: Duration) -> bool {
        self.elapsed() >= budget
    }

    /// Registers a cleanup task. Tasks run on every terminal outcome in
    /// descending priority order.
    pub fn add_cleanup<F, Fut>(&mut self, priority: u8, name: &'static str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.cleanup.push(CleanupTask {
            priority,
            name,
            action: Box::new(move || Box::pin(action())),
        });
    }

    /// Runs all registered cleanup tasks, highest priority first. Each
    /// task is isolated: a failure is logged and the rest still run.
    pub async fn run_cleanup(&mut self) {
        let mut tasks = std::mem::take(&mut self.cleanup);
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));

        for task in tasks {
            if let Err(e) = (task.action)().await {
                tracing::warn!(
                    request_id = %self.request_id,
                    task = task.name,
                    error = %e,
                    "Cleanup task failed"
                );
            }
        }
    }
}
