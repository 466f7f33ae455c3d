//! Background polling of subscribed measurements
//!
//! Any number of subscribers may ask for the same measurement; the scheduler
//! issues one request per subscribed command per cycle and hands the cached
//! answer to every callback registered for it. With no subscribers the task
//! parks on a [`Notify`] until the next `subscribe` or until shutdown.
//!
//! Callbacks run on the scheduler task, after the registry lock has been
//! released, so they may subscribe or unsubscribe. They must not block: a
//! slow callback delays the next cycle for every subscriber.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{MeterError, MeterResult};
use crate::link::{GateMode, InstrumentLink};
use crate::protocol::Command;

/// Receives `(command, value)` once per cycle; `NaN` when the read failed.
pub type SubscriberCallback = Arc<dyn Fn(Command, f64) -> anyhow::Result<()> + Send + Sync>;

/// Cache lookup result for a command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cached {
    /// Nobody polls this command
    NotSubscribed,
    /// Subscribed, but the first cycle has not run yet
    Pending,
    /// Last answer, `NaN` if it failed
    Value(f64),
}

#[derive(Default)]
struct Registry {
    subscribers: BTreeMap<Command, BTreeMap<usize, Option<SubscriberCallback>>>,
    answers: BTreeMap<Command, Option<f64>>,
    identifiers: BTreeSet<usize>,
}

/// Subscription registry, answer cache and the polling loop.
pub struct PollingScheduler {
    link: Arc<InstrumentLink>,
    registry: Mutex<Registry>,
    wake: Notify,
    capacity: usize,
}

impl PollingScheduler {
    /// Scheduler over `link`, sized by its `max_subscribers`.
    pub fn new(link: Arc<InstrumentLink>) -> Self {
        let capacity = link.timing().max_subscribers;
        Self {
            link,
            registry: Mutex::new(Registry::default()),
            wake: Notify::new(),
            capacity,
        }
    }

    /// Request/response link.
    pub fn link(&self) -> &Arc<InstrumentLink> {
        &self.link
    }

    /// Maximum concurrent subscriptions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Register interest in `command` and return the subscription identifier.
    ///
    /// The identifier is the smallest one not in use.
    ///
    /// # Errors
    ///
    /// [`MeterError::CapacityExceeded`] when every identifier is taken.
    pub fn subscribe(
        &self,
        command: Command,
        callback: Option<SubscriberCallback>,
    ) -> MeterResult<usize> {
        let id = {
            let mut registry = self.lock();
            let Some(id) = (0..self.capacity).find(|id| !registry.identifiers.contains(id)) else {
                drop(registry);
                let err = MeterError::CapacityExceeded(self.capacity);
                self.link.status().error(&err.to_string());
                return Err(err);
            };
            registry.identifiers.insert(id);
            registry.answers.entry(command).or_insert(None);
            registry
                .subscribers
                .entry(command)
                .or_default()
                .insert(id, callback);
            id
        };

        self.wake.notify_one();
        info!("New subscription ({}) to {}", id, command);
        Ok(id)
    }

    /// Release a subscription. The cache entry of its command goes away
    /// together with the last subscriber.
    ///
    /// # Errors
    ///
    /// [`MeterError::UnknownIdentifier`] if `id` is not allocated.
    pub fn unsubscribe(&self, id: usize) -> MeterResult<()> {
        let mut registry = self.lock();
        if !registry.identifiers.remove(&id) {
            drop(registry);
            let err = MeterError::UnknownIdentifier(id);
            self.link.status().error(&err.to_string());
            return Err(err);
        }

        let mut emptied = None;
        for (command, subscribers) in registry.subscribers.iter_mut() {
            if subscribers.remove(&id).is_some() {
                if subscribers.is_empty() {
                    emptied = Some(*command);
                }
                break;
            }
        }
        if let Some(command) = emptied {
            registry.subscribers.remove(&command);
            registry.answers.remove(&command);
            debug!(%command, "Last subscriber gone, dropping cached answer");
        }
        drop(registry);

        info!("Unsubscription for {}", id);
        Ok(())
    }

    /// Drop every subscription and cached answer.
    pub fn unsubscribe_all(&self) {
        let mut registry = self.lock();
        let count = registry.identifiers.len();
        registry.identifiers.clear();
        registry.subscribers.clear();
        registry.answers.clear();
        if count > 0 {
            info!("Unsubscribed all {} subscriptions", count);
        }
    }

    /// Identifiers in use, ascending.
    pub fn identifiers(&self) -> Vec<usize> {
        self.lock().identifiers.iter().copied().collect()
    }

    /// Commands polled each cycle.
    pub fn subscribed_commands(&self) -> Vec<Command> {
        self.lock().answers.keys().copied().collect()
    }

    /// Cached answer for `command`.
    pub fn cached(&self, command: Command) -> Cached {
        match self.lock().answers.get(&command) {
            None => Cached::NotSubscribed,
            Some(None) => Cached::Pending,
            Some(Some(value)) => Cached::Value(*value),
        }
    }

    pub(crate) fn store(&self, command: Command, value: f64) {
        // The entry may have been unsubscribed while the read was in flight
        if let Some(slot) = self.lock().answers.get_mut(&command) {
            *slot = Some(value);
        }
    }

    // ========================================================================
    // Polling loop
    // ========================================================================

    /// Spawn [`PollingScheduler::run`] on the runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Poll until the link signals shutdown.
    pub async fn run(&self) {
        info!(channel = %self.link.describe(), "Polling loop started");

        if self.link.pause(self.link.timing().reconnect_delay()).await {
            while !self.link.is_shutdown() {
                let commands = self.subscribed_commands();
                if commands.is_empty() {
                    debug!("No one subscribed, passive sleep");
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = self.link.shutdown_requested() => break,
                    }
                    continue;
                }
                self.cycle(&commands).await;
            }
        }

        info!(channel = %self.link.describe(), "Polling loop ended");
    }

    /// One pass over `commands`, then dispatch.
    async fn cycle(&self, commands: &[Command]) {
        let started = Instant::now();

        for &command in commands {
            if self.link.is_shutdown() {
                return;
            }
            let value = match self.link.send_and_receive(command, GateMode::Blocking).await {
                Ok(value) => value,
                Err(e) if e.is_link_failure() => self.recover(command, e).await,
                Err(e) => {
                    warn!(%command, "{}", e);
                    f64::NAN
                }
            };
            self.store(command, value);
        }

        if self.link.is_shutdown() {
            return;
        }
        self.dispatch();

        // Keep a closed or failing line from turning the loop into a spin
        let floor = self
            .link
            .timing()
            .min_read_spacing()
            .max(self.link.timing().answer_sleep());
        let elapsed = started.elapsed();
        if elapsed < floor {
            self.link.pause(floor - elapsed).await;
        }
    }

    /// Reconnect state machine after a failed read of `command`.
    async fn recover(&self, command: Command, err: MeterError) -> f64 {
        warn!(%command, "{}", err);

        if self.link.reconnects_exhausted() {
            self.link.status().error(&format!(
                "reach {} consecutive reconnections failed: no more tries (review and Init())",
                self.link.failed_reconnections()
            ));
            return f64::NAN;
        }
        if !self.link.reconnect_due() {
            return f64::NAN;
        }

        if !self.link.reconnect().await {
            if !self.link.is_shutdown() {
                self.link.record_failed_reconnection();
            }
            return f64::NAN;
        }

        match self.link.send_and_receive(command, GateMode::Blocking).await {
            Ok(value) => {
                self.link.reset_failed_reconnections();
                self.link.status().info("Connected to the instrument.");
                value
            }
            Err(e) => {
                let failed = self.link.record_failed_reconnection();
                warn!(%command, failed, "Read after reconnect failed: {}", e);
                f64::NAN
            }
        }
    }

    /// Hand every subscribed command's cached value to its callbacks.
    fn dispatch(&self) {
        let batches: Vec<(Command, f64, Vec<(usize, SubscriberCallback)>)> = {
            let registry = self.lock();
            registry
                .subscribers
                .iter()
                .filter_map(|(command, subscribers)| {
                    let value = (*registry.answers.get(command)?).unwrap_or(f64::NAN);
                    let callbacks = subscribers
                        .iter()
                        .filter_map(|(id, cb)| cb.as_ref().map(|cb| (*id, Arc::clone(cb))))
                        .collect();
                    Some((*command, value, callbacks))
                })
                .collect()
        };

        for (command, value, callbacks) in batches {
            for (id, callback) in callbacks {
                match catch_unwind(AssertUnwindSafe(|| callback(command, value))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(%command, "Callback exception for id {}: {:#}", id, e),
                    Err(_) => error!(%command, "Callback panicked for id {}", id),
                }
            }
        }
    }
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("link", &self.link)
            .field("identifiers", &self.identifiers())
            .field("capacity", &self.capacity)
            .finish()
    }
}
