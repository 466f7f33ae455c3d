//! Meter facade
//!
//! [`InfinityMeter`] is what a device server holds: one link, one scheduler
//! and the handle of the polling task. Direct reads of a subscribed
//! measurement are served from the poller's cache; unsubscribed ones go to
//! the line without waiting for it.
//!
//! Always tear down with `close().await` before dropping an open meter: it
//! returns only once the polling task has exited. `Drop` cannot await, so
//! dropping an open meter only signals shutdown and aborts the task without
//! waiting for it to finish.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{self, ProxyResolver, Transport};
use crate::config::MeterConfig;
use crate::error::MeterResult;
use crate::link::{GateMode, InstrumentLink, LinkState};
use crate::protocol::Command;
use crate::scheduler::{Cached, PollingScheduler, SubscriberCallback};
use crate::status::StatusNotifier;

/// Newport INFS/Omega strain-gauge meter.
pub struct InfinityMeter {
    config: MeterConfig,
    link: Arc<InstrumentLink>,
    scheduler: Arc<PollingScheduler>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl InfinityMeter {
    /// Build the transport for `config.channel` and wrap it.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the channel cannot be
    /// mapped to a transport.
    pub async fn connect(
        config: MeterConfig,
        resolver: &dyn ProxyResolver,
        status: StatusNotifier,
    ) -> MeterResult<Self> {
        config.validate()?;
        let transport = match adapters::connect(&config, resolver).await {
            Ok(transport) => transport,
            Err(e) => {
                status.error(&format!(
                    "Failed to build line manager for {}: {}",
                    config.channel, e
                ));
                return Err(e);
            }
        };
        Ok(Self::with_transport(config, transport, status))
    }

    /// Wrap an already built transport.
    pub fn with_transport(
        config: MeterConfig,
        transport: Box<dyn Transport>,
        status: StatusNotifier,
    ) -> Self {
        let link = Arc::new(InstrumentLink::new(
            transport,
            config.address.clone(),
            config.timing.clone(),
            status,
        ));
        let scheduler = Arc::new(PollingScheduler::new(Arc::clone(&link)));
        Self {
            config,
            link,
            scheduler,
            poller: Mutex::new(None),
        }
    }

    /// Configuration the meter was built with.
    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Request/response link.
    pub fn link(&self) -> &Arc<InstrumentLink> {
        &self.link
    }

    /// Subscription poller.
    pub fn scheduler(&self) -> &Arc<PollingScheduler> {
        &self.scheduler
    }

    /// Measurements to expose: the configured ones, or all four.
    pub fn measures(&self) -> Vec<Command> {
        if self.config.measures.is_empty() {
            Command::ALL.to_vec()
        } else {
            self.config.measures.clone()
        }
    }

    /// Whether the line goes through a proxy device.
    pub fn uses_proxy(&self) -> bool {
        self.link.uses_proxy()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the line and start the polling task.
    pub async fn open(&self) -> bool {
        if self.is_polling() {
            self.link
                .status()
                .error("Avoiding an Open try! The polling task is still alive.");
            return false;
        }
        if !self.link.open().await {
            return false;
        }

        let handle = self.scheduler.spawn();
        *self.poller.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("{} opened", self);
        true
    }

    /// Stop polling, release the line and drop all subscriptions.
    ///
    /// Returns once the polling task has exited.
    pub async fn close(&self) -> bool {
        let closed = self.link.close().await;

        let handle = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            debug!("Waiting monitor task to finish");
            if let Err(e) = handle.await {
                error!("Polling task ended abnormally: {}", e);
            }
        }

        self.scheduler.unsubscribe_all();
        info!("{} closed", self);
        closed
    }

    /// Live state of the line.
    pub async fn is_open(&self) -> bool {
        self.link.is_open().await
    }

    /// Whether the polling task is running.
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Current value of `command`.
    ///
    /// Subscribed commands answer from the cache (`NaN` until the first
    /// cycle). Others issue a non-blocking request: `NaN` if the line is
    /// busy.
    ///
    /// # Errors
    ///
    /// Propagates no-answer, transport and hard decode failures of the
    /// direct request.
    pub async fn get_value(&self, command: Command) -> MeterResult<f64> {
        match self.scheduler.cached(command) {
            Cached::Value(value) => Ok(value),
            Cached::Pending => {
                warn!("There are subscriptors for {}, but nothing read yet!", command);
                self.scheduler.store(command, f64::NAN);
                Ok(f64::NAN)
            }
            Cached::NotSubscribed => {
                debug!("No subscriptor for {}, force send&receive.", command);
                self.link
                    .send_and_receive(command, GateMode::NonBlocking)
                    .await
            }
        }
    }

    /// [`InfinityMeter::get_value`] by measurement name or wire code.
    pub async fn get_value_by_name(&self, name: &str) -> MeterResult<f64> {
        self.get_value(name.parse()?).await
    }

    /// Unfiltered reading (`X01`).
    pub async fn get_unfiltered_value(&self) -> MeterResult<f64> {
        self.get_value(Command::Unfiltered).await
    }

    /// Peak reading (`X02`).
    pub async fn get_peak_value(&self) -> MeterResult<f64> {
        self.get_value(Command::Peak).await
    }

    /// Valley reading (`X03`).
    pub async fn get_valley_value(&self) -> MeterResult<f64> {
        self.get_value(Command::Valley).await
    }

    /// Filtered reading (`X04`).
    pub async fn get_filtered_value(&self) -> MeterResult<f64> {
        self.get_value(Command::Filtered).await
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// See [`PollingScheduler::subscribe`].
    pub fn subscribe(
        &self,
        command: Command,
        callback: Option<SubscriberCallback>,
    ) -> MeterResult<usize> {
        self.scheduler.subscribe(command, callback)
    }

    /// See [`PollingScheduler::unsubscribe`].
    pub fn unsubscribe(&self, id: usize) -> MeterResult<()> {
        self.scheduler.unsubscribe(id)
    }

    /// Drop every subscription.
    pub fn unsubscribe_all(&self) {
        self.scheduler.unsubscribe_all();
    }
}

impl fmt::Display for InfinityMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfinityMeter({})", self.link.describe())
    }
}

impl fmt::Debug for InfinityMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfinityMeter")
            .field("link", &self.link)
            .field("polling", &self.is_polling())
            .finish()
    }
}

/// Best effort: prefer [`InfinityMeter::close`], which waits for the poller.
impl Drop for InfinityMeter {
    fn drop(&mut self) {
        self.link.signal_shutdown();
        self.scheduler.unsubscribe_all();
        let handle = self
            .poller
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if !handle.is_finished() {
                debug!("Deleting {} with its polling task alive", self);
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockTransport, NoProxies};
    use crate::error::MeterError;
    use crate::status::{StatusLevel, StatusLog};
    use tracing_test::traced_test;

    fn meter(mock: &MockTransport, log: &StatusLog) -> InfinityMeter {
        let mut config = MeterConfig::for_channel("mock", "01");
        config.timing.min_read_spacing_ms = 0;
        config.timing.reconnect_delay_ms = 100;
        InfinityMeter::with_transport(config, Box::new(mock.clone()), log.notifier())
    }

    #[tokio::test]
    async fn test_display_names_the_channel() {
        let config = MeterConfig::for_channel("/dev/ttyS0", "01");
        let meter = InfinityMeter::connect(config, &NoProxies, StatusNotifier::silent())
            .await
            .unwrap();
        assert_eq!(meter.to_string(), "InfinityMeter(/dev/ttyS0 (19200,7,1,O))");
        assert!(!meter.uses_proxy());
        assert_eq!(meter.measures(), Command::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_channel() {
        let log = StatusLog::new();
        let config = MeterConfig::for_channel("lab/serial/01", "01");
        let result = InfinityMeter::connect(config, &NoProxies, log.notifier()).await;
        assert!(matches!(result, Err(MeterError::UnsupportedChannel(_))));
        assert!(log.contains(StatusLevel::Error, "Failed to build line manager"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_close_lifecycle() {
        let mock = MockTransport::new().with_responder("01");
        let log = StatusLog::new();
        let meter = meter(&mock, &log);

        assert!(meter.open().await);
        assert!(meter.is_polling());
        assert!(meter.is_open().await);
        assert_eq!(meter.state(), LinkState::Open);

        assert!(meter.close().await);
        assert!(!meter.is_polling());
        assert_eq!(meter.state(), LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_does_not_start_polling() {
        let mock = MockTransport::new();
        mock.fail_next_opens(1);
        let log = StatusLog::new();
        let meter = meter(&mock, &log);

        assert!(!meter.open().await);
        assert!(!meter.is_polling());
        assert!(log.contains(StatusLevel::Error, "Open() to the instrument has failed."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_open_refused_while_polling() {
        let mock = MockTransport::new();
        let log = StatusLog::new();
        let meter = meter(&mock, &log);

        assert!(meter.open().await);
        assert!(!meter.open().await);
        assert!(log.contains(StatusLevel::Error, "Avoiding an Open try!"));
        meter.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_value_and_pending_subscription() {
        let mock = MockTransport::new().with_responder("01");
        mock.set_value(Command::Peak, 2.5);
        let log = StatusLog::new();
        let meter = meter(&mock, &log);
        meter.link().open().await;

        assert_eq!(meter.get_peak_value().await.unwrap(), 2.5);
        assert_eq!(mock.write_count(), 1);

        meter.subscribe(Command::Peak, None).unwrap();
        assert!(meter.get_peak_value().await.unwrap().is_nan());
        assert_eq!(mock.write_count(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_pending_warning_logged_once() {
        let log = StatusLog::new();
        let meter = meter(&MockTransport::new(), &log);
        meter.subscribe(Command::Valley, None).unwrap();

        assert!(meter.get_valley_value().await.unwrap().is_nan());
        assert!(matches!(
            meter.scheduler().cached(Command::Valley),
            Cached::Value(v) if v.is_nan()
        ));
        assert!(meter.get_valley_value().await.unwrap().is_nan());

        logs_assert(|lines: &[&str]| {
            let warnings = lines
                .iter()
                .filter(|line| line.contains("nothing read yet"))
                .count();
            if warnings == 1 {
                Ok(())
            } else {
                Err(format!("expected one warning, got {warnings}"))
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_signals_shutdown_to_the_poller() {
        let mock = MockTransport::new().with_responder("01");
        let log = StatusLog::new();
        let meter = meter(&mock, &log);
        assert!(meter.open().await);
        meter.subscribe(Command::Peak, None).unwrap();
        let link = Arc::clone(meter.link());
        let scheduler = Arc::clone(meter.scheduler());

        drop(meter);
        assert!(link.is_shutdown());
        assert!(scheduler.identifiers().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_measure_name() {
        let log = StatusLog::new();
        let meter = meter(&MockTransport::new(), &log);
        let err = meter.get_value_by_name("Temperature").await.unwrap_err();
        assert!(matches!(err, MeterError::UnrecognizedCommand(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_subscriptions() {
        let mock = MockTransport::new().with_responder("01");
        let log = StatusLog::new();
        let meter = meter(&mock, &log);
        meter.open().await;
        meter.subscribe(Command::Valley, None).unwrap();

        meter.close().await;
        assert!(meter.scheduler().identifiers().is_empty());
    }
}
