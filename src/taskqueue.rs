//! Single-consumer task queue for lifecycle operations
//!
//! All lifecycle transitions (start/stop of subsystems, config swap,
//! dispatcher retries) are funneled through one of these so they never
//! interleave: a single worker task drains the queue in FIFO order and
//! runs one handler at a time. An optional alarm fires a callback when a
//! task overruns its deadline, without killing the task.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

const DEFAULT_CAPACITY: usize = 8;

/// Result delivered for every task, to the sync caller or via the handle
pub type TaskResult = anyhow::Result<()>;

/// Handler invoked by the worker for a matching subject
pub type Handler<S, A> = Arc<dyn Fn(Task<S, A>) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Callback fired when a task runs longer than the alarm duration
pub type AlarmHandler<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Callback receiving the recent-task ring when capacity is exhausted
pub type Debugger<S> = Arc<dyn Fn(Vec<(S, u8)>) + Send + Sync>;

/// Errors surfaced by the queue itself (handler errors travel in [`TaskResult`])
#[derive(Debug)]
pub enum TaskQueueError {
    /// The bounded queue is full
    Capacity(usize),

    /// No handler is registered for the pushed subject
    Undefined(String),
}

impl fmt::Display for TaskQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskQueueError::Capacity(cap) => {
                write!(f, "task queue: capacity is exhausted: {}", cap)
            }
            TaskQueueError::Undefined(subj) => write!(f, "task queue: undefined: {}", subj),
        }
    }
}

impl std::error::Error for TaskQueueError {}

/// A queued unit of work, consumed exactly once by the worker
#[derive(Debug)]
pub struct Task<S, A> {
    pub subject: S,
    pub args: A,
    pub idx: u8,
}

/// Handle returned by [`TaskQueue::push_async`] for observing completion
#[derive(Debug)]
pub struct TaskHandle<S> {
    pub subject: S,
    pub idx: u8,
    done: oneshot::Receiver<TaskResult>,
}

impl<S> TaskHandle<S> {
    /// Wait for the task to complete and return its result
    pub async fn done(self) -> TaskResult {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("task dropped before completion")),
        }
    }
}

struct QueuedTask<S, A> {
    task: Task<S, A>,
    done: oneshot::Sender<TaskResult>,
}

/// Builder for [`TaskQueue`]
pub struct TaskQueueBuilder<S, A> {
    capacity: usize,
    alarm: Option<(Duration, AlarmHandler<S>)>,
    debugger: Option<Debugger<S>>,
    handlers: HashMap<S, Handler<S, A>>,
}

impl<S, A> TaskQueueBuilder<S, A>
where
    S: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    A: Send + 'static,
{
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Fire `handler` if a task has not completed within `after`
    pub fn alarm(mut self, after: Duration, handler: AlarmHandler<S>) -> Self {
        self.alarm = Some((after, handler));
        self
    }

    pub fn debugger(mut self, debugger: Debugger<S>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    pub fn handler(mut self, subject: S, handler: Handler<S, A>) -> Self {
        self.handlers.insert(subject, handler);
        self
    }

    /// Spawn the worker and return the queue
    pub fn build(self) -> TaskQueue<S, A> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let handlers = Arc::new(self.handlers);
        tokio::spawn(run_worker(rx, Arc::clone(&handlers), self.alarm));

        TaskQueue {
            tx,
            handlers,
            idx: AtomicU8::new(0),
            capacity: self.capacity,
            ring: Mutex::new(VecDeque::with_capacity(self.capacity)),
            debugger: self.debugger,
        }
    }
}

/// Capacity-bounded, single-consumer executor for named tasks
pub struct TaskQueue<S, A> {
    tx: mpsc::Sender<QueuedTask<S, A>>,
    handlers: Arc<HashMap<S, Handler<S, A>>>,
    idx: AtomicU8,
    capacity: usize,
    ring: Mutex<VecDeque<(S, u8)>>,
    debugger: Option<Debugger<S>>,
}

impl<S, A> TaskQueue<S, A>
where
    S: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    A: Send + 'static,
{
    pub fn builder() -> TaskQueueBuilder<S, A> {
        TaskQueueBuilder {
            capacity: DEFAULT_CAPACITY,
            alarm: None,
            debugger: None,
            handlers: HashMap::new(),
        }
    }

    /// Enqueue a task and return immediately with a completion handle
    pub fn push_async(&self, subject: S, args: A) -> Result<TaskHandle<S>, TaskQueueError> {
        if !self.handlers.contains_key(&subject) {
            return Err(TaskQueueError::Undefined(format!("{subject:?}")));
        }

        let idx = self.idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedTask {
            task: Task {
                subject: subject.clone(),
                args,
                idx,
            },
            done: done_tx,
        };

        match self.tx.try_send(queued) {
            Ok(()) => {
                let mut ring = self.ring.lock().unwrap();
                if ring.len() == self.capacity {
                    ring.pop_front();
                }
                ring.push_back((subject.clone(), idx));
                Ok(TaskHandle {
                    subject,
                    idx,
                    done: done_rx,
                })
            }
            Err(_) => {
                if let Some(debugger) = &self.debugger {
                    let last_tasks = self.ring.lock().unwrap().iter().cloned().collect();
                    debugger(last_tasks);
                }
                Err(TaskQueueError::Capacity(self.capacity))
            }
        }
    }

    /// Enqueue a task and wait for its handler to complete
    pub async fn push_sync(&self, subject: S, args: A) -> TaskResult {
        self.push_async(subject, args)?.done().await
    }
}

async fn run_worker<S, A>(
    mut rx: mpsc::Receiver<QueuedTask<S, A>>,
    handlers: Arc<HashMap<S, Handler<S, A>>>,
    alarm: Option<(Duration, AlarmHandler<S>)>,
) where
    S: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    A: Send + 'static,
{
    while let Some(QueuedTask { task, done }) = rx.recv().await {
        let subject = task.subject.clone();
        // push_async validates the subject, so the lookup cannot miss
        let Some(handler) = handlers.get(&subject) else {
            warn!(subject = ?subject, "no handler for queued task");
            let _ = done.send(Err(TaskQueueError::Undefined(format!("{subject:?}")).into()));
            continue;
        };

        let fut = handler(task);
        let result = match &alarm {
            Some((after, on_alarm)) => {
                run_with_alarm(fut, *after, on_alarm.as_ref(), &subject).await
            }
            None => fut.await,
        };

        let _ = done.send(result);
    }
}

async fn run_with_alarm<S>(
    fut: BoxFuture<'_, TaskResult>,
    after: Duration,
    on_alarm: &(dyn Fn(&S) + Send + Sync),
    subject: &S,
) -> TaskResult {
    tokio::pin!(fut);
    let sleep = tokio::time::sleep(after);
    tokio::pin!(sleep);
    let mut fired = false;

    loop {
        tokio::select! {
            result = &mut fut => return result,
            _ = &mut sleep, if !fired => {
                fired = true;
                on_alarm(subject);
            }
        }
    }
}
