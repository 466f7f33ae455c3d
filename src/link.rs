//! Request/response engine for one meter
//!
//! The instrument is strictly half-duplex: one question, one answer. The
//! [`InstrumentLink`] owns the transport behind a single async mutex (the
//! gate); holding the guard *is* holding the line, and it is released on
//! every exit path when the guard drops.
//!
//! Within the gate each cycle:
//! 1. waits out the minimum spacing since the previous request,
//! 2. discards stale input,
//! 3. writes the framed command,
//! 4. polls for the answer with a growing backoff,
//! 5. decodes it (outside the gate).
//!
//! A shutdown signal raised by [`InstrumentLink::close`] interrupts every
//! sleep so that waiting callers drain promptly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapters::Transport;
use crate::config::TimingConfig;
use crate::error::{MeterError, MeterResult, TransportError};
use crate::protocol::{decode, Command};
use crate::status::StatusNotifier;

/// How a caller acquires the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Wait for the line
    Blocking,
    /// Give up with `NaN` if the line is busy
    NonBlocking,
}

/// Connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not opened, or closed
    Closed,
    /// Line open and answering
    Open,
    /// Consecutive failed readings reached the reconnect threshold
    Faulted,
}

/// Serialized access to one meter over one transport.
pub struct InstrumentLink {
    address: String,
    timing: TimingConfig,
    description: String,
    uses_proxy: bool,
    gate: Mutex<Box<dyn Transport>>,
    last_request: std::sync::Mutex<Option<Instant>>,
    failed_readings: AtomicU32,
    failed_reconnections: AtomicU32,
    state: std::sync::Mutex<LinkState>,
    status: StatusNotifier,
    shutdown: watch::Sender<bool>,
}

impl InstrumentLink {
    /// Wrap `transport`; the link starts closed.
    pub fn new(
        transport: Box<dyn Transport>,
        address: impl Into<String>,
        timing: TimingConfig,
        status: StatusNotifier,
    ) -> Self {
        let description = transport.describe();
        let uses_proxy = transport.uses_proxy();
        let (shutdown, _) = watch::channel(false);
        Self {
            address: address.into(),
            timing,
            description,
            uses_proxy,
            gate: Mutex::new(transport),
            last_request: std::sync::Mutex::new(None),
            failed_readings: AtomicU32::new(0),
            failed_reconnections: AtomicU32::new(0),
            state: std::sync::Mutex::new(LinkState::Closed),
            status,
            shutdown,
        }
    }

    /// Bus address of the meter.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Timing constants in use.
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Description of the underlying transport.
    pub fn describe(&self) -> &str {
        &self.description
    }

    /// Whether the transport goes through a proxy device.
    pub fn uses_proxy(&self) -> bool {
        self.uses_proxy
    }

    /// Status notification channel.
    pub fn status(&self) -> &StatusNotifier {
        &self.status
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LinkState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            debug!(from = ?*current, to = ?state, "Link state change");
            *current = state;
        }
    }

    /// Consecutive cycles that ended without an answer.
    pub fn failed_readings(&self) -> u32 {
        self.failed_readings.load(Ordering::SeqCst)
    }

    /// Consecutive reconnections that did not bring the meter back.
    pub fn failed_reconnections(&self) -> u32 {
        self.failed_reconnections.load(Ordering::SeqCst)
    }

    /// Count one more failed reconnection and return the new total.
    pub fn record_failed_reconnection(&self) -> u32 {
        self.failed_reconnections.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Clear the failed reconnection count.
    pub fn reset_failed_reconnections(&self) {
        self.failed_reconnections.store(0, Ordering::SeqCst);
    }

    /// Failed readings crossed the threshold.
    pub fn reconnect_due(&self) -> bool {
        self.failed_readings() >= self.timing.reconnect_threshold
    }

    /// Failed reconnections reached their limit; only an explicit open helps.
    pub fn reconnects_exhausted(&self) -> bool {
        self.failed_reconnections() >= self.timing.reconnect_limit
    }

    // ========================================================================
    // Shutdown signal
    // ========================================================================

    /// Interrupt every pending sleep and stop the poller.
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the shutdown signal is raised.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless shutdown is signalled first.
    ///
    /// Returns `false` when interrupted.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown_requested() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the transport and clear the shutdown signal and failure counters.
    pub async fn open(&self) -> bool {
        self.shutdown.send_replace(false);
        let mut transport = self.gate.lock().await;
        if transport.open().await {
            self.failed_readings.store(0, Ordering::SeqCst);
            self.reset_failed_reconnections();
            self.set_state(LinkState::Open);
            info!(channel = %self.description, "Link opened");
            true
        } else {
            self.status.error("Open() to the instrument has failed.");
            false
        }
    }

    /// Raise the shutdown signal, then release the transport once the
    /// current cycle (if any) has drained.
    pub async fn close(&self) -> bool {
        self.signal_shutdown();
        let mut transport = self.gate.lock().await;
        let closed = transport.close().await;
        self.set_state(LinkState::Closed);
        info!(channel = %self.description, "Link closed");
        closed
    }

    /// Live state of the transport; waits for the gate.
    pub async fn is_open(&self) -> bool {
        self.gate.lock().await.is_open().await
    }

    // ========================================================================
    // Request/response
    // ========================================================================

    async fn acquire(&self, mode: GateMode) -> Option<MutexGuard<'_, Box<dyn Transport>>> {
        match mode {
            GateMode::Blocking => Some(self.gate.lock().await),
            GateMode::NonBlocking => self.gate.try_lock().ok(),
        }
    }

    async fn wait_spacing(&self) -> bool {
        let last = *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(last) = last else {
            return true;
        };
        let elapsed = last.elapsed();
        let spacing = self.timing.min_read_spacing();
        if elapsed >= spacing {
            return true;
        }
        let left = spacing - elapsed;
        debug!(
            elapsed_ms = elapsed.as_millis() as u64,
            wait_ms = left.as_millis() as u64,
            "Not enough time between reads"
        );
        self.pause(left).await
    }

    fn stamp_request(&self) {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    fn record_failed_reading(&self) -> u32 {
        let failures = self.failed_readings.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.timing.reconnect_threshold && self.state() == LinkState::Open {
            self.set_state(LinkState::Faulted);
        }
        failures
    }

    /// Ask the meter for `command` and wait for its answer.
    ///
    /// Returns `NaN` without touching the line when the gate is busy in
    /// [`GateMode::NonBlocking`] mode, when shutdown is signalled, or when
    /// the transport of a link that is not [`LinkState::Faulted`] is closed. Soft decode failures also resolve to `NaN`
    /// and are pushed as a status warning.
    ///
    /// # Errors
    ///
    /// - [`MeterError::NoAnswer`] after every read attempt came back empty
    /// - [`MeterError::Transport`] if the command could not be written, or
    ///   the transport of a faulted link is closed (counted as a failed reading)
    /// - [`MeterError::Decode`] if the answer carries an unparsable value
    pub async fn send_and_receive(&self, command: Command, mode: GateMode) -> MeterResult<f64> {
        let wire_code = command.wire_code();
        debug!(%command, ?mode, "send_and_receive");

        let Some(mut transport) = self.acquire(mode).await else {
            debug!(%command, "Line busy, abort send_and_receive");
            return Ok(f64::NAN);
        };

        if self.is_shutdown() {
            debug!(%command, "Shutdown requested, abort send_and_receive");
            return Ok(f64::NAN);
        }
        if !transport.is_open().await {
            drop(transport);
            // A faulted link lost its line to a failed reopen: keep counting
            if self.state() == LinkState::Faulted {
                self.record_failed_reading();
                return Err(TransportError::NotOpen(self.description.clone()).into());
            }
            debug!(%command, "Link not available, abort send_and_receive");
            return Ok(f64::NAN);
        }

        if !self.wait_spacing().await {
            return Ok(f64::NAN);
        }
        self.stamp_request();

        if !transport.flush().await {
            self.status.error("Flush exception, check communications");
        }

        if let Err(e) = transport.write(&self.address, wire_code).await {
            drop(transport);
            self.record_failed_reading();
            self.status.error(&format!(
                "Cannot send '{}{}' to the instrument: {}",
                self.address, wire_code, e
            ));
            return Err(e.into());
        }

        let retries = self.timing.answer_retries;
        let mut answer = Vec::new();
        for attempt in 0..retries {
            let backoff = self.timing.backoff(attempt);
            debug!(attempt, backoff_ms = backoff.as_millis() as u64, "Waiting for answer");
            if !self.pause(backoff).await {
                debug!(%command, "Shutdown while waiting for the answer");
                return Ok(f64::NAN);
            }
            match transport.read().await {
                Ok(bytes) if !bytes.is_empty() => {
                    answer = bytes;
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!(attempt, "Read failed on {}: {}", self.description, e),
            }
        }
        drop(transport);

        if answer.is_empty() {
            let failures = self.record_failed_reading();
            error!(
                failures,
                "Too many ({}) null answers to '{}{}'", retries, self.address, wire_code
            );
            return Err(MeterError::NoAnswer {
                command,
                address: self.address.clone(),
                wire_code,
                attempts: retries,
            });
        }

        self.failed_readings.store(0, Ordering::SeqCst);
        match decode(&self.address, wire_code, &answer) {
            Ok(value) => {
                debug!(%command, value, "Decoded answer");
                Ok(value)
            }
            Err(e) if e.is_soft() => {
                self.status.warning(&e.to_string());
                Ok(f64::NAN)
            }
            Err(e) => {
                error!(%command, "{}", e);
                Err(e.into())
            }
        }
    }

    /// Close and reopen the transport after sustained failures.
    ///
    /// Never fails: the outcome is pushed as a status notification and can
    /// be read back with [`InstrumentLink::state`].
    pub async fn reconnect(&self) -> bool {
        self.status
            .error("Too many failed readings, review connection and call Init()");

        {
            let mut transport = self.gate.lock().await;
            transport.close().await;
        }

        if !self.pause(self.timing.reconnect_delay()).await {
            debug!("Shutdown during reconnect delay");
            return false;
        }
        self.failed_readings.store(0, Ordering::SeqCst);

        let reopened = {
            let mut transport = self.gate.lock().await;
            if self.is_shutdown() {
                debug!("Shutdown before reopening, reconnect abandoned");
                return false;
            }
            transport.open().await
        };

        if reopened {
            self.set_state(LinkState::Open);
            self.status.info("(re)Connected to the instrument.");
            info!(channel = %self.description, "reconnected");
        } else {
            self.set_state(LinkState::Faulted);
            self.status
                .error("Cannot be stablished communication with the instrument.");
        }
        reopened
    }
}

impl std::fmt::Debug for InstrumentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentLink")
            .field("channel", &self.description)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("failed_readings", &self.failed_readings())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use crate::status::{StatusLevel, StatusLog};

    fn fast_timing() -> TimingConfig {
        TimingConfig {
            min_read_spacing_ms: 0,
            answer_sleep_ms: 50,
            answer_retries: 5,
            reconnect_threshold: 2,
            reconnect_limit: 1,
            reconnect_delay_ms: 100,
            max_subscribers: 10,
        }
    }

    fn link_with(mock: &MockTransport, log: &StatusLog) -> InstrumentLink {
        InstrumentLink::new(Box::new(mock.clone()), "01", fast_timing(), log.notifier())
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_close_state() {
        let mock = MockTransport::new();
        let log = StatusLog::new();
        let link = link_with(&mock, &log);

        assert_eq!(link.state(), LinkState::Closed);
        assert!(link.open().await);
        assert_eq!(link.state(), LinkState::Open);
        assert!(link.is_open().await);

        assert!(link.close().await);
        assert_eq!(link.state(), LinkState::Closed);
        assert!(link.is_shutdown());
        assert!(!link.is_open().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_reported() {
        let mock = MockTransport::new();
        mock.fail_next_opens(1);
        let log = StatusLog::new();
        let link = link_with(&mock, &log);

        assert!(!link.open().await);
        assert_eq!(link.state(), LinkState::Closed);
        assert!(log.contains(StatusLevel::Error, "Open() to the instrument has failed."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip() {
        let mock = MockTransport::new().with_responder("01");
        mock.set_value(Command::Filtered, 1.5);
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;

        let value = link
            .send_and_receive(Command::Filtered, GateMode::Blocking)
            .await
            .unwrap();
        assert_eq!(value, 1.5);
        assert_eq!(mock.call_log(), vec!["open", "flush", "write:01X04", "read"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link_returns_nan_without_io() {
        let mock = MockTransport::new().with_responder("01");
        let log = StatusLog::new();
        let link = link_with(&mock, &log);

        let value = link
            .send_and_receive(Command::Peak, GateMode::Blocking)
            .await
            .unwrap();
        assert!(value.is_nan());
        assert_eq!(mock.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_blocking_gives_up_on_busy_gate() {
        let mock = MockTransport::new().with_responder("01");
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;

        let _held = link.gate.lock().await;
        let value = link
            .send_and_receive(Command::Unfiltered, GateMode::NonBlocking)
            .await
            .unwrap();
        assert!(value.is_nan());
        assert_eq!(mock.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_between_requests() {
        let mock = MockTransport::new().with_responder("01");
        let log = StatusLog::new();
        let timing = TimingConfig {
            min_read_spacing_ms: 500,
            ..fast_timing()
        };
        let link = InstrumentLink::new(Box::new(mock.clone()), "01", timing, log.notifier());
        link.open().await;

        link.send_and_receive(Command::Peak, GateMode::Blocking)
            .await
            .unwrap();
        link.send_and_receive(Command::Peak, GateMode::Blocking)
            .await
            .unwrap();

        let exchanges = mock.exchanges();
        assert_eq!(exchanges.len(), 2);
        let gap = exchanges[1].written_at - exchanges[0].written_at;
        assert!(gap >= Duration::from_millis(500), "gap was {gap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_decode_failure_is_nan_and_warning() {
        let mock = MockTransport::new();
        mock.push_answer("02X01123\r");
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;

        let value = link
            .send_and_receive(Command::Unfiltered, GateMode::Blocking)
            .await
            .unwrap();
        assert!(value.is_nan());
        assert!(log.contains(StatusLevel::Warning, "not from the expected address"));
        assert_eq!(link.failed_readings(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_value_is_hard_error() {
        let mock = MockTransport::new();
        mock.push_answer("01X01abc\r");
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;

        let result = link
            .send_and_receive(Command::Unfiltered, GateMode::Blocking)
            .await;
        assert!(matches!(result, Err(MeterError::Decode(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_counts_and_reports() {
        let mock = MockTransport::new().with_responder("01");
        mock.fail_next_writes(1);
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;

        let result = link.send_and_receive(Command::Peak, GateMode::Blocking).await;
        assert!(matches!(result, Err(MeterError::Transport(_))));
        assert_eq!(link.failed_readings(), 1);
        assert!(log.contains(StatusLevel::Error, "Cannot send '01X02'"));
        assert_eq!(mock.read_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_fault_counts_as_empty_attempt() {
        let mock = MockTransport::new();
        mock.push_fault();
        mock.push_answer("01X027.25\r");
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;

        let value = link
            .send_and_receive(Command::Peak, GateMode::Blocking)
            .await
            .unwrap();
        assert_eq!(value, 7.25);
        assert_eq!(mock.read_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulted_after_threshold() {
        let mock = MockTransport::new();
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;

        for _ in 0..2 {
            let result = link.send_and_receive(Command::Valley, GateMode::Blocking).await;
            assert!(matches!(result, Err(MeterError::NoAnswer { attempts: 5, .. })));
        }
        assert_eq!(link.failed_readings(), 2);
        assert!(link.reconnect_due());
        assert_eq!(link.state(), LinkState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success() {
        let mock = MockTransport::new();
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;
        link.send_and_receive(Command::Valley, GateMode::Blocking)
            .await
            .unwrap_err();

        assert!(link.reconnect().await);
        assert_eq!(link.failed_readings(), 0);
        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(mock.close_count(), 1);
        assert_eq!(mock.open_count(), 2);
        assert!(log.contains(StatusLevel::Error, "Too many failed readings"));
        assert!(log.contains(StatusLevel::Info, "(re)Connected to the instrument."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_failure_is_reported_not_raised() {
        let mock = MockTransport::new();
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;
        mock.fail_next_opens(1);

        assert!(!link.reconnect().await);
        assert_eq!(link.state(), LinkState::Faulted);
        assert!(log.contains(
            StatusLevel::Error,
            "Cannot be stablished communication with the instrument."
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_line_of_faulted_link_counts_as_failure() {
        let mock = MockTransport::new().with_responder("01");
        let log = StatusLog::new();
        let link = link_with(&mock, &log);
        link.open().await;
        mock.fail_next_opens(1);
        assert!(!link.reconnect().await);
        assert_eq!(link.failed_readings(), 0);

        let result = link.send_and_receive(Command::Peak, GateMode::Blocking).await;
        assert!(matches!(
            result,
            Err(MeterError::Transport(TransportError::NotOpen(_)))
        ));
        assert_eq!(link.failed_readings(), 1);
        assert_eq!(mock.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_prefers_raised_shutdown() {
        let log = StatusLog::new();
        let link = link_with(&MockTransport::new(), &log);
        assert!(link.pause(Duration::ZERO).await);

        link.signal_shutdown();
        assert!(!link.pause(Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_reconnect_keeps_line_closed() {
        let mock = MockTransport::new();
        let log = StatusLog::new();
        let link = std::sync::Arc::new(link_with(&mock, &log));
        link.open().await;

        let reconnecting = {
            let link = link.clone();
            tokio::spawn(async move { link.reconnect().await })
        };
        // Reconnect has closed the line and is waiting out its delay
        tokio::time::sleep(Duration::from_millis(10)).await;
        let held = link.gate.lock().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        link.signal_shutdown();
        drop(held);

        assert!(!reconnecting.await.unwrap());
        assert_eq!(mock.open_count(), 1);
        assert_eq!(mock.close_count(), 1);
        assert!(!link.is_open().await);
        assert!(!log.contains(StatusLevel::Info, "(re)Connected to the instrument."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_retry_loop() {
        let mock = MockTransport::new();
        let log = StatusLog::new();
        let link = std::sync::Arc::new(link_with(&mock, &log));
        link.open().await;

        let reader = {
            let link = link.clone();
            tokio::spawn(async move {
                link.send_and_receive(Command::Peak, GateMode::Blocking)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        link.close().await;

        let value = reader.await.unwrap().unwrap();
        assert!(value.is_nan());
        assert!(mock.read_count() < 5);
    }
}
