//! Task lifecycle as seen by the shuffle code.

use crate::memory::MemoryPool;
use crate::metrics::TaskMetrics;
use log::info;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_TASK_ATTEMPT_ID: AtomicU64 = AtomicU64::new(0);

/// Per-attempt state shared by a task and everything it drives.
///
/// Cancellation is asynchronous: any thread holding the context can call
/// [`kill`](Self::kill), and the read pipeline observes it on its next step.
#[derive(Debug)]
pub struct TaskContext {
    stage_id: u32,
    partition_id: usize,
    attempt_number: u32,
    task_attempt_id: u64,
    kill_reason: Mutex<Option<String>>,
    interrupted: AtomicBool,
    completed: AtomicBool,
    metrics: TaskMetrics,
    memory_pool: Arc<MemoryPool>,
}

impl TaskContext {
    pub fn new(
        stage_id: u32,
        partition_id: usize,
        attempt_number: u32,
        memory_pool: Arc<MemoryPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stage_id,
            partition_id,
            attempt_number,
            task_attempt_id: NEXT_TASK_ATTEMPT_ID.fetch_add(1, Ordering::Relaxed),
            kill_reason: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            metrics: TaskMetrics::default(),
            memory_pool,
        })
    }

    /// A context with an unbounded memory pool.
    pub fn standalone(partition_id: usize) -> Arc<Self> {
        Self::new(0, partition_id, 0, Arc::new(MemoryPool::unbounded()))
    }

    pub fn stage_id(&self) -> u32 {
        self.stage_id
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub fn task_attempt_id(&self) -> u64 {
        self.task_attempt_id
    }

    pub fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }

    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory_pool
    }

    /// Mark the task for cancellation. The first reason wins.
    pub fn kill(&self, reason: impl Into<String>) {
        let mut guard = self.kill_reason.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let reason = reason.into();
            info!("Killing task {} (partition {}): {reason}", self.task_attempt_id, self.partition_id);
            *guard = Some(reason);
        }
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn kill_reason(&self) -> Option<String> {
        self.kill_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark the task finished and return its execution memory to the pool.
    pub fn mark_completed(&self) {
        if !self.completed.swap(true, Ordering::AcqRel) {
            self.memory_pool.release_all(self.task_attempt_id);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_kill_reason_wins() {
        let ctx = TaskContext::standalone(0);
        assert!(!ctx.is_interrupted());
        ctx.kill("speculative copy finished");
        ctx.kill("stage cancelled");
        assert!(ctx.is_interrupted());
        assert_eq!(ctx.kill_reason().as_deref(), Some("speculative copy finished"));
    }

    #[test]
    fn completion_releases_task_memory() {
        let pool = Arc::new(MemoryPool::new(1024));
        let ctx = TaskContext::new(1, 0, 0, Arc::clone(&pool));
        pool.acquire(ctx.task_attempt_id(), 512);
        ctx.mark_completed();
        assert!(ctx.is_completed());
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn attempt_ids_are_unique() {
        let a = TaskContext::standalone(0);
        let b = TaskContext::standalone(0);
        assert_ne!(a.task_attempt_id(), b.task_attempt_id());
    }
}
