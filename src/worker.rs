//! Bounded-concurrency task dispatch. A fixed set of worker tasks, each with
//! its own plugin-VM instance; submissions above the aggregate in-flight
//! budget queue FIFO on a fair semaphore.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::WorkerError;
use crate::metrics_consts::{
    PLUGIN_ERRORS, WORKER_CRASHES, WORKER_TASKS_QUEUED, WORKER_TASK_DURATION,
};
use crate::plugin::{record_plugin_log_entry, EventTransformer, EventTransformerFactory,
    PluginLogEntry};
use crate::producer::MessageProducer;
use crate::types::PluginEvent;

/// The worker task protocol.
pub enum Task {
    ProcessEvent { event: PluginEvent },
    ProcessEvents { events: Vec<PluginEvent> },
}

/// `ProcessEvents` returns a same-length array with `None` for drops.
#[derive(Debug)]
pub enum TaskResult {
    Event(Option<PluginEvent>),
    Events(Vec<Option<PluginEvent>>),
}

struct Job {
    task: Task,
    reply: oneshot::Sender<Result<TaskResult, WorkerError>>,
}

pub struct WorkerPool {
    senders: std::sync::Mutex<Vec<mpsc::UnboundedSender<Job>>>,
    in_flight: Vec<Arc<AtomicUsize>>,
    budget: Arc<Semaphore>,
    shutting_down: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        factory: Arc<dyn EventTransformerFactory>,
        producer: Option<Arc<dyn MessageProducer>>,
        config: &Config,
    ) -> Self {
        let mut senders = Vec::with_capacity(config.worker_concurrency);
        let mut in_flight = Vec::with_capacity(config.worker_concurrency);
        let mut handles = Vec::with_capacity(config.worker_concurrency);

        for worker_id in 0..config.worker_concurrency {
            let (tx, rx) = mpsc::unbounded_channel();
            let counter = Arc::new(AtomicUsize::new(0));
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                rx,
                factory.clone(),
                producer.clone(),
                config.plugin_log_entries_topic.clone(),
                Duration::from_millis(config.plugin_timeout_ms),
            )));
            senders.push(tx);
            in_flight.push(counter);
        }

        Self {
            senders: std::sync::Mutex::new(senders),
            in_flight,
            budget: Arc::new(Semaphore::new(
                config.worker_concurrency * config.tasks_per_worker,
            )),
            shutting_down: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(handles),
        }
    }

    /// Submit a task. Resolves when the task completes on some worker, fails
    /// with `WorkerCrashed` if that worker dies mid-task, and queues FIFO
    /// when the pool is saturated.
    pub async fn run_task(&self, task: Task) -> Result<TaskResult, WorkerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(WorkerError::ShuttingDown);
        }
        metrics::counter!(WORKER_TASKS_QUEUED).increment(1);

        let _permit = self
            .budget
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::ShuttingDown)?;

        let worker = self.least_loaded_worker();
        let _in_flight = InFlightGuard::increment(self.in_flight[worker].clone());
        let timer = std::time::Instant::now();

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let senders = self.senders.lock().expect("worker pool lock poisoned");
            let Some(sender) = senders.get(worker) else {
                return Err(WorkerError::ShuttingDown);
            };
            sender
                .send(Job {
                    task,
                    reply: reply_tx,
                })
                .map_err(|_| WorkerError::WorkerCrashed)?;
        }

        // A dropped reply sender means the worker exited with our job on it.
        let result = reply_rx.await.map_err(|_| WorkerError::WorkerCrashed)?;
        metrics::histogram!(WORKER_TASK_DURATION).record(timer.elapsed().as_millis() as f64);
        result
    }

    /// Stop intake, let queued and in-flight tasks run to completion, then
    /// join the workers.
    pub async fn destroy(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.budget.close();

        // Dropping the senders closes the queues; workers drain and exit.
        self.senders
            .lock()
            .expect("worker pool lock poisoned")
            .clear();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!("worker exited uncleanly during shutdown: {e}");
            }
        }
        info!("worker pool drained and stopped");
    }

    fn least_loaded_worker(&self) -> usize {
        self.in_flight
            .iter()
            .enumerate()
            .min_by_key(|(_, counter)| counter.load(Ordering::Relaxed))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn increment(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn worker_loop(
    worker_id: usize,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    factory: Arc<dyn EventTransformerFactory>,
    producer: Option<Arc<dyn MessageProducer>>,
    plugin_log_topic: String,
    plugin_timeout: Duration,
) {
    // Each worker owns its VM; a crash rebuilds it below.
    let mut transformer = factory.create();
    let instance_id = Uuid::now_v7();

    while let Some(job) = jobs.recv().await {
        let ran = std::panic::AssertUnwindSafe(run_job(
            &mut transformer,
            job.task,
            producer.as_ref(),
            &plugin_log_topic,
            plugin_timeout,
            instance_id,
        ))
        .catch_unwind()
        .await;

        match ran {
            Ok(result) => {
                let _ = job.reply.send(Ok(result));
            }
            Err(_) => {
                metrics::counter!(WORKER_CRASHES).increment(1);
                error!(worker_id = worker_id, "worker VM panicked, restarting it");
                let _ = job.reply.send(Err(WorkerError::WorkerCrashed));
                transformer = factory.create();
            }
        }
    }
}

async fn run_job(
    transformer: &mut Box<dyn EventTransformer>,
    task: Task,
    producer: Option<&Arc<dyn MessageProducer>>,
    plugin_log_topic: &str,
    plugin_timeout: Duration,
    instance_id: Uuid,
) -> TaskResult {
    match task {
        Task::ProcessEvent { event } => TaskResult::Event(
            transform_one(
                transformer,
                event,
                producer,
                plugin_log_topic,
                plugin_timeout,
                instance_id,
            )
            .await,
        ),
        Task::ProcessEvents { events } => {
            let mut results = Vec::with_capacity(events.len());
            for event in events {
                results.push(
                    transform_one(
                        transformer,
                        event,
                        producer,
                        plugin_log_topic,
                        plugin_timeout,
                        instance_id,
                    )
                    .await,
                );
            }
            TaskResult::Events(results)
        }
    }
}

/// Run the VM on one event. Plugin failures and timeouts are reported and the
/// event continues untransformed; only a `None` from the VM drops it.
async fn transform_one(
    transformer: &mut Box<dyn EventTransformer>,
    event: PluginEvent,
    producer: Option<&Arc<dyn MessageProducer>>,
    plugin_log_topic: &str,
    plugin_timeout: Duration,
    instance_id: Uuid,
) -> Option<PluginEvent> {
    let team_id = event.team_id;
    let fallback = event.clone();

    let failure = match tokio::time::timeout(plugin_timeout, transformer.transform(event)).await {
        Ok(Ok(result)) => return result,
        Ok(Err(plugin_error)) => plugin_error.to_string(),
        Err(_) => format!("plugin timed out after {}ms", plugin_timeout.as_millis()),
    };

    metrics::counter!(PLUGIN_ERRORS).increment(1);
    record_plugin_log_entry(
        producer,
        plugin_log_topic,
        PluginLogEntry::error(team_id, instance_id, failure),
    )
    .await;
    Some(fallback)
}
