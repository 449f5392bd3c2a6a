//! Priority queue - fast lane for high-stakes work
//!
//! Tasks are ordered by `(priority, submitted_at)` and executed under
//! per-priority semaphores so background work can never starve the fast
//! lane. Completed tasks keep their result in a bounded table for status
//! lookup by task id.

use chrono::{DateTime, Utc};
use nexus_common::{ErrorCode, NexusConfig, NexusError, Priority, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, info, warn};

type TaskFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'static>>;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
struct TaskRecord {
    task_id: String,
    priority: Priority,
    submitted_at: DateTime<Utc>,
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

struct QueuedTask {
    priority: Priority,
    submitted_at: DateTime<Utc>,
    seq: u64,
    task_id: String,
    future: TaskFuture,
    completion: Option<oneshot::Sender<std::result::Result<serde_json::Value, String>>>,
}

impl QueuedTask {
    fn key(&self) -> (Priority, DateTime<Utc>, u64) {
        (self.priority, self.submitted_at, self.seq)
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap pops the max; invert so the most urgent task pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct QueueStats {
    total_submitted: u64,
    total_completed: u64,
    total_failed: u64,
    by_priority: HashMap<&'static str, u64>,
}

struct QueueShared {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    notify: Notify,
    seq: Mutex<u64>,
    semaphores: HashMap<Priority, Arc<Semaphore>>,
    running: Mutex<HashMap<String, TaskRecord>>,
    completed: Mutex<HashMap<String, TaskRecord>>,
    stats: Mutex<QueueStats>,
    completed_retention: usize,
}

/// Async priority queue with per-priority concurrency caps.
pub struct PriorityQueue {
    shared: Arc<QueueShared>,
    processor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PriorityQueue {
    pub fn new(config: &NexusConfig) -> Self {
        let semaphores = Priority::all()
            .into_iter()
            .map(|p| (p, Arc::new(Semaphore::new(config.concurrency_for(p)))))
            .collect();

        info!("PriorityQueue initialized");

        PriorityQueue {
            shared: Arc::new(QueueShared {
                heap: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                seq: Mutex::new(0),
                semaphores,
                running: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
                stats: Mutex::new(QueueStats::default()),
                completed_retention: config.queue.completed_retention,
            }),
            processor: Mutex::new(None),
        }
    }

    /// Start the background processor.
    pub fn start(&self) {
        let mut processor = self.processor.lock();
        if processor.is_some() {
            return;
        }

        let shared = self.shared.clone();
        *processor = Some(tokio::spawn(async move {
            loop {
                let task = shared.heap.lock().pop();
                match task {
                    Some(task) => QueueShared::dispatch(&shared, task),
                    None => shared.notify.notified().await,
                }
            }
        }));
        info!("PriorityQueue processor started");
    }

    /// Stop the background processor. Queued tasks stay queued.
    pub fn stop(&self) {
        if let Some(handle) = self.processor.lock().take() {
            handle.abort();
            info!("PriorityQueue processor stopped");
        }
    }

    /// Enqueue a task and return its id.
    pub fn submit<F>(&self, future: F, priority: Priority) -> String
    where
        F: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.enqueue(Box::pin(future), priority, None)
    }

    /// Enqueue a task and wait up to `timeout` for its result.
    ///
    /// Expiry returns a timeout error but does not cancel the task; its
    /// result, if it arrives, is still cached for retrieval by task id.
    pub async fn submit_and_wait<F>(
        &self,
        future: F,
        priority: Priority,
        timeout: Duration,
    ) -> Result<serde_json::Value>
    where
        F: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task_id = self.enqueue(Box::pin(future), priority, Some(tx));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(NexusError::new(
                ErrorCode::CalculationError,
                error,
                "priority_queue",
            )),
            Ok(Err(_)) => Err(NexusError::new(
                ErrorCode::ServiceUnavailable,
                "task executor dropped before completion",
                "priority_queue",
            )),
            Err(_) => Err(NexusError::new(
                ErrorCode::SimulationTimeout,
                format!("task {task_id} timed out after {:?}", timeout),
                "priority_queue",
            )),
        }
    }

    /// Run a task immediately, bypassing the queue but still respecting the
    /// priority's concurrency cap.
    pub async fn execute_immediate<F>(
        &self,
        future: F,
        priority: Priority,
    ) -> Result<serde_json::Value>
    where
        F: Future<Output = Result<serde_json::Value>> + Send,
    {
        let semaphore = self.shared.semaphores[&priority].clone();
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| {
                NexusError::new(
                    ErrorCode::ServiceUnavailable,
                    "queue semaphore closed",
                    "priority_queue",
                )
            })?;
        future.await
    }

    fn enqueue(
        &self,
        future: TaskFuture,
        priority: Priority,
        completion: Option<oneshot::Sender<std::result::Result<serde_json::Value, String>>>,
    ) -> String {
        let task_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let seq = {
            let mut seq = self.shared.seq.lock();
            *seq += 1;
            *seq
        };

        {
            let mut stats = self.shared.stats.lock();
            stats.total_submitted += 1;
            *stats.by_priority.entry(priority.as_str()).or_insert(0) += 1;
        }

        self.shared.heap.lock().push(QueuedTask {
            priority,
            submitted_at: Utc::now(),
            seq,
            task_id: task_id.clone(),
            future,
            completion,
        });
        self.shared.notify.notify_one();

        debug!(task_id, priority = priority.as_str(), "Task submitted");
        task_id
    }

    /// Status of a task by id, whether running or completed.
    pub fn task_status(&self, task_id: &str) -> Option<serde_json::Value> {
        if let Some(record) = self.shared.running.lock().get(task_id) {
            return Some(serde_json::json!({
                "task_id": record.task_id,
                "status": record.status,
                "priority": record.priority,
                "submitted_at": record.submitted_at,
            }));
        }
        self.shared.completed.lock().get(task_id).map(|record| {
            serde_json::json!({
                "task_id": record.task_id,
                "status": record.status,
                "priority": record.priority,
                "submitted_at": record.submitted_at,
                "result_available": record.result.is_some(),
                "error": record.error,
            })
        })
    }

    pub fn queue_depth(&self) -> serde_json::Value {
        serde_json::json!({
            "total_pending": self.shared.heap.lock().len(),
            "running": self.shared.running.lock().len(),
            "completed": self.shared.completed.lock().len(),
        })
    }

    pub fn stats(&self) -> serde_json::Value {
        let stats = self.shared.stats.lock();
        serde_json::json!({
            "total_submitted": stats.total_submitted,
            "total_completed": stats.total_completed,
            "total_failed": stats.total_failed,
            "by_priority": stats.by_priority,
            "queue_depth": self.queue_depth(),
            "success_rate": stats.total_completed as f64
                / stats.total_submitted.max(1) as f64 * 100.0,
        })
    }

    pub fn clear_completed(&self) {
        self.shared.completed.lock().clear();
    }
}

impl QueueShared {
    fn dispatch(shared: &Arc<QueueShared>, mut task: QueuedTask) {
        let semaphore = shared.semaphores[&task.priority].clone();
        let shared = shared.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let record = TaskRecord {
                task_id: task.task_id.clone(),
                priority: task.priority,
                submitted_at: task.submitted_at,
                status: TaskStatus::Running,
                result: None,
                error: None,
            };
            shared.running.lock().insert(task.task_id.clone(), record.clone());

            let outcome = task.future.await;

            let mut record = record;
            match &outcome {
                Ok(value) => {
                    record.status = TaskStatus::Completed;
                    record.result = Some(value.clone());
                    shared.stats.lock().total_completed += 1;
                    debug!(task_id = %task.task_id, "Task completed");
                }
                Err(e) => {
                    record.status = TaskStatus::Failed;
                    record.error = Some(e.to_string());
                    shared.stats.lock().total_failed += 1;
                    warn!(task_id = %task.task_id, error = %e, "Task failed");
                }
            }

            if let Some(tx) = task.completion.take() {
                let _ = tx.send(outcome.map_err(|e| e.to_string()));
            }

            shared.running.lock().remove(&task.task_id);
            let mut completed = shared.completed.lock();
            completed.insert(task.task_id.clone(), record);

            // Bounded history: past the cap, drop the oldest half.
            if completed.len() > shared.completed_retention {
                let mut by_age: Vec<(String, DateTime<Utc>)> = completed
                    .iter()
                    .map(|(id, r)| (id.clone(), r.submitted_at))
                    .collect();
                by_age.sort_by_key(|(_, at)| *at);
                let evict = completed.len() - shared.completed_retention / 2;
                for (id, _) in by_age.into_iter().take(evict) {
                    completed.remove(&id);
                }
            }
        });
    }
}

impl Drop for PriorityQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
