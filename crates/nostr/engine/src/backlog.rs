//! Request correlation.
//!
//! A [`Backlog`] pairs each outbound request with exactly one terminal
//! callback: a response when ingest reports the request's subscription as
//! imported, or a timeout from the periodic sweep. The registry lives on one
//! task and every input (registration, import notices, sweeps) reaches it as
//! a message, so the two outcomes can never both fire.

use crate::config::BacklogConfig;
use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::subscription::generate_prefixed_id;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, trace};

type RequestFn = Box<dyn FnOnce(&str) + Send>;
type ResponseFn = Box<dyn FnOnce(TaskResponse) + Send>;
type TimeoutFn = Box<dyn FnOnce(&str) + Send>;

/// What a response callback receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    pub subscription_id: String,
    /// The imported event, for priority tasks
    pub event: Option<Event>,
}

/// Terminal outcome of a correlated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Response(TaskResponse),
    TimedOut { subscription_id: String },
}

/// Identifies a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub id: u64,
    pub subscription_id: String,
}

/// A request to correlate, built before submission.
pub struct ReqTask {
    subscription_id: Option<String>,
    prefix: Option<String>,
    priority: bool,
    timeout: Option<Duration>,
    debounce: Option<Duration>,
    request: RequestFn,
    on_response: Option<ResponseFn>,
    on_timeout: Option<TimeoutFn>,
}

impl ReqTask {
    /// `request` receives the subscription id and usually sends a REQ through the pool.
    pub fn new(request: impl FnOnce(&str) + Send + 'static) -> Self {
        Self {
            subscription_id: None,
            prefix: None,
            priority: false,
            timeout: None,
            debounce: None,
            request: Box::new(request),
            on_response: None,
            on_timeout: None,
        }
    }

    /// Use this id instead of generating one.
    pub fn with_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = Some(id.into());
        self
    }

    /// Prefix for the generated id.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Route through the priority lane and answer per event.
    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn on_response(mut self, f: impl FnOnce(TaskResponse) + Send + 'static) -> Self {
        self.on_response = Some(Box::new(f));
        self
    }

    pub fn on_timeout(mut self, f: impl FnOnce(&str) + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(f));
        self
    }

    fn resolve_id(&mut self) -> String {
        match self.subscription_id.take() {
            Some(id) if self.priority => {
                if id.starts_with(crate::importer::PRIORITY_PREFIX) {
                    id
                } else {
                    format!("{}{}", crate::importer::PRIORITY_PREFIX, id)
                }
            }
            Some(id) => id,
            None => generate_prefixed_id(self.prefix.as_deref(), self.priority),
        }
    }
}

struct PendingTask {
    subscription_id: String,
    priority: bool,
    created_at: Instant,
    timeout: Duration,
    debounce: Duration,
    /// Set by the first matching import; the sweep leaves the task alone afterwards
    skip_timeout: bool,
    completed: bool,
    respond_at: Option<Instant>,
    on_response: Option<ResponseFn>,
    on_timeout: Option<TimeoutFn>,
}

impl PendingTask {
    fn respond(&mut self, event: Option<Event>) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Some(f) = self.on_response.take() {
            f(TaskResponse {
                subscription_id: self.subscription_id.clone(),
                event,
            });
        }
    }

    fn time_out(&mut self) {
        if self.completed || self.skip_timeout {
            return;
        }
        self.completed = true;
        if let Some(f) = self.on_timeout.take() {
            f(&self.subscription_id);
        }
    }
}

enum Command {
    Register(u64, PendingTask),
    Imported(HashSet<String>),
    PriorityEvent {
        subscription_id: String,
        event: Event,
    },
    SubscriptionFailed(String),
    Cancel(u64),
    Clear,
    Pending(oneshot::Sender<usize>),
}

/// Handle to the correlator task. Cheap to clone.
#[derive(Clone)]
pub struct Backlog {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    config: BacklogConfig,
}

impl Backlog {
    /// Spawn the registry task.
    pub fn spawn(config: BacklogConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, config.sweep_interval));
        let backlog = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            config,
        };
        (backlog, handle)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| ClientError::ChannelClosed("backlog"))
    }

    /// Register the task, then run its request.
    pub fn submit(&self, mut task: ReqTask) -> Result<TaskHandle> {
        let subscription_id = task.resolve_id();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let pending = PendingTask {
            subscription_id: subscription_id.clone(),
            priority: task.priority,
            created_at: Instant::now(),
            timeout: task.timeout.unwrap_or(self.config.default_timeout),
            debounce: task.debounce.unwrap_or(self.config.default_debounce),
            skip_timeout: false,
            completed: false,
            respond_at: None,
            on_response: task.on_response,
            on_timeout: task.on_timeout,
        };
        self.command(Command::Register(id, pending))?;

        debug!("Submitted task {} for {}", id, subscription_id);
        (task.request)(&subscription_id);
        Ok(TaskHandle {
            id,
            subscription_id,
        })
    }

    /// Submit and wait for the outcome. Callbacks already on `task` still run first.
    pub async fn request(&self, mut task: ReqTask) -> Result<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let user_response = task.on_response.take();
        let response_slot = Arc::clone(&slot);
        task.on_response = Some(Box::new(move |response: TaskResponse| {
            if let Some(f) = user_response {
                f(response.clone());
            }
            if let Some(tx) = response_slot.lock().take() {
                let _ = tx.send(TaskOutcome::Response(response));
            }
        }));

        let user_timeout = task.on_timeout.take();
        task.on_timeout = Some(Box::new(move |subscription_id: &str| {
            if let Some(f) = user_timeout {
                f(subscription_id);
            }
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(TaskOutcome::TimedOut {
                    subscription_id: subscription_id.to_string(),
                });
            }
        }));

        self.submit(task)?;
        rx.await.map_err(|_| ClientError::ChannelClosed("backlog task"))
    }

    /// Drop a task without running either callback.
    pub fn cancel(&self, handle: &TaskHandle) -> Result<()> {
        self.command(Command::Cancel(handle.id))
    }

    /// Drop every task without running callbacks.
    pub fn clear(&self) -> Result<()> {
        self.command(Command::Clear)
    }

    /// Number of registered tasks.
    pub async fn pending(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Pending(tx))?;
        rx.await.map_err(|_| ClientError::ChannelClosed("backlog"))
    }

    pub(crate) fn imported(&self, subscription_ids: HashSet<String>) {
        let _ = self.command(Command::Imported(subscription_ids));
    }

    pub(crate) fn priority_event(&self, subscription_id: String, event: Event) {
        let _ = self.command(Command::PriorityEvent {
            subscription_id,
            event,
        });
    }

    /// Every relay refused the subscription; its tasks time out now.
    pub(crate) fn subscription_failed(&self, subscription_id: String) {
        let _ = self.command(Command::SubscriptionFailed(subscription_id));
    }
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<u64, PendingTask>,
}

impl Registry {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(id, task) => {
                self.tasks.insert(id, task);
            }
            Command::Imported(subscription_ids) => self.process(&subscription_ids),
            Command::PriorityEvent {
                subscription_id,
                event,
            } => {
                let ids: Vec<u64> = self
                    .tasks
                    .iter()
                    .filter(|(_, t)| t.priority && t.subscription_id == subscription_id)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    if let Some(mut task) = self.tasks.remove(&id) {
                        task.respond(Some(event.clone()));
                    }
                }
            }
            Command::SubscriptionFailed(subscription_id) => {
                let ids: Vec<u64> = self
                    .tasks
                    .iter()
                    .filter(|(_, t)| t.subscription_id == subscription_id && !t.skip_timeout)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    if let Some(mut task) = self.tasks.remove(&id) {
                        debug!("All relays closed {}, timing out", subscription_id);
                        task.time_out();
                    }
                }
            }
            Command::Cancel(id) => {
                self.tasks.remove(&id);
            }
            Command::Clear => self.tasks.clear(),
            Command::Pending(reply) => {
                let _ = reply.send(self.tasks.len());
            }
        }
    }

    /// Arm the response of every normal task named in `subscription_ids`.
    fn process(&mut self, subscription_ids: &HashSet<String>) {
        let now = Instant::now();
        for task in self.tasks.values_mut() {
            if task.priority || task.completed || !subscription_ids.contains(&task.subscription_id) {
                continue;
            }
            task.skip_timeout = true;
            task.respond_at = Some(now + task.debounce);
            trace!("Task for {} answers at {:?}", task.subscription_id, task.respond_at);
        }
    }

    fn next_response_at(&self) -> Option<Instant> {
        self.tasks.values().filter_map(|t| t.respond_at).min()
    }

    fn fire_due(&mut self, now: Instant) {
        let due: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.respond_at.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(mut task) = self.tasks.remove(&id) {
                task.respond(None);
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| {
                !t.completed && !t.skip_timeout && now.duration_since(t.created_at) >= t.timeout
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut task) = self.tasks.remove(&id) {
                debug!("Task for {} timed out", task.subscription_id);
                task.time_out();
            }
        }
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, sweep_interval: Duration) {
    let mut registry = Registry::default();
    let mut sweep = interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let wake = registry.next_response_at();
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => registry.handle(command),
                None => break,
            },
            _ = sweep.tick() => registry.sweep(Instant::now()),
            _ = wait_until(wake) => registry.fire_due(Instant::now()),
        }
    }
}
