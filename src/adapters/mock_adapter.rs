//! Mock transport for testing
//!
//! Stands in for the meter without any hardware. It provides:
//! - A scripted answer queue (lines, silences, channel faults)
//! - A responder that answers every request like a healthy meter
//! - Open failure injection and simulated latency
//! - Call logging and request/answer interval recording for verification

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::Transport;
use crate::error::TransportError;
use crate::protocol::Command;

/// One scripted outcome of a `read` call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Raw bytes returned as-is
    Line(Vec<u8>),
    /// Read timeout: empty answer
    Silence,
    /// Channel fault
    Fault,
}

/// Time span of one request on the wire: from the write to the last read
/// before the next write.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Frame as written, without the leading `*`
    pub frame: String,
    /// When the frame was written
    pub written_at: Instant,
    /// Last read belonging to this exchange, if any
    pub last_read_at: Option<Instant>,
}

#[derive(Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    responder: Option<String>,
    values: BTreeMap<Command, f64>,
    pending: Option<(String, String)>,
    call_log: Vec<String>,
    exchanges: Vec<Exchange>,
    overlaps: u32,
    opens: u32,
    closes: u32,
    writes: u32,
    reads: u32,
    fail_writes: u32,
}

/// Scriptable in-memory transport
///
/// Clones share their state, so a test keeps one clone for inspection and
/// hands the other to the link.
///
/// # Example
///
/// ```
/// use infinity_meter::adapters::MockTransport;
/// use infinity_meter::protocol::Command;
///
/// let mock = MockTransport::new().with_responder("01");
/// mock.set_value(Command::Peak, 12.5);
/// assert_eq!(mock.write_count(), 0);
/// ```
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    open: Arc<AtomicBool>,
    failing_opens: Arc<AtomicU32>,
    latency: Duration,
    name: String,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Closed transport with an empty script; every read times out.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            open: Arc::new(AtomicBool::new(false)),
            failing_opens: Arc::new(AtomicU32::new(0)),
            latency: Duration::ZERO,
            name: "mock".to_string(),
        }
    }

    /// Answer each request once, as a meter at `address` would, when the
    /// script queue is empty.
    pub fn with_responder(self, address: &str) -> Self {
        self.lock().responder = Some(address.to_string());
        self
    }

    /// Simulated latency of every write and read
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Name reported by `describe`.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Value reported by the responder for `command` (default 0).
    pub fn set_value(&self, command: Command, value: f64) {
        self.lock().values.insert(command, value);
    }

    /// Queue raw answer bytes.
    pub fn push_answer(&self, answer: impl Into<Vec<u8>>) {
        self.lock().replies.push_back(MockReply::Line(answer.into()));
    }

    /// Queue `count` timed-out reads.
    pub fn push_silence(&self, count: usize) {
        let mut state = self.lock();
        state
            .replies
            .extend(std::iter::repeat(MockReply::Silence).take(count));
    }

    /// Queue a channel fault on read.
    pub fn push_fault(&self) {
        self.lock().replies.push_back(MockReply::Fault);
    }

    /// Make the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail with a timeout.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().fail_writes = count;
    }

    /// Force the line state, e.g. to simulate an unplugged cable.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Every call made on the transport, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Forget recorded calls.
    pub fn clear_log(&self) {
        self.lock().call_log.clear();
    }

    /// Open attempts, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    /// Close calls.
    pub fn close_count(&self) -> u32 {
        self.lock().closes
    }

    /// Frames written.
    pub fn write_count(&self) -> u32 {
        self.lock().writes
    }

    /// Read attempts.
    pub fn read_count(&self) -> u32 {
        self.lock().reads
    }

    /// Recorded request spans in write order.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.lock().exchanges.clone()
    }

    /// Writes issued while the previous request had not been read yet.
    pub fn overlaps(&self) -> u32 {
        self.lock().overlaps
    }

    fn log_call(&self, call: String) {
        self.lock().call_log.push(call);
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> bool {
        {
            let mut state = self.lock();
            state.opens += 1;
            state.call_log.push("open".to_string());
        }
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return false;
        }
        self.open.store(true, Ordering::SeqCst);
        true
    }

    async fn close(&mut self) -> bool {
        {
            let mut state = self.lock();
            state.closes += 1;
            state.call_log.push("close".to_string());
        }
        self.open.store(false, Ordering::SeqCst);
        true
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn flush(&mut self) -> bool {
        self.log_call("flush".to_string());
        true
    }

    async fn write(&mut self, address: &str, wire_code: &str) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen(self.name.clone()));
        }
        {
            let mut state = self.lock();
            let frame = format!("{address}{wire_code}");
            state.writes += 1;
            state.call_log.push(format!("write:{frame}"));

            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(TransportError::WriteTimeout(self.name.clone()));
            }

            if state
                .exchanges
                .last()
                .is_some_and(|e| e.last_read_at.is_none())
            {
                state.overlaps += 1;
            }
            state.exchanges.push(Exchange {
                frame,
                written_at: Instant::now(),
                last_read_at: None,
            });
            state.pending = Some((address.to_string(), wire_code.to_string()));
        }
        self.simulate_latency().await;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen(self.name.clone()));
        }
        self.simulate_latency().await;

        let mut state = self.lock();
        state.reads += 1;
        state.call_log.push("read".to_string());
        if let Some(exchange) = state.exchanges.last_mut() {
            exchange.last_read_at = Some(Instant::now());
        }

        match state.replies.pop_front() {
            Some(MockReply::Line(bytes)) => {
                state.pending = None;
                Ok(bytes)
            }
            Some(MockReply::Silence) => Ok(Vec::new()),
            Some(MockReply::Fault) => Err(TransportError::Io {
                channel: self.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "injected fault"),
            }),
            None => {
                let Some(responder) = state.responder.clone() else {
                    return Ok(Vec::new());
                };
                let Some((_, wire_code)) = state.pending.take() else {
                    return Ok(Vec::new());
                };
                let value = Command::ALL
                    .iter()
                    .find(|c| c.wire_code() == wire_code)
                    .and_then(|c| state.values.get(c).copied())
                    .unwrap_or(0.0);
                Ok(format!("{responder}{wire_code}{value}\r").into_bytes())
            }
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_open_close() {
        let mut mock = MockTransport::new();
        assert!(!mock.is_open().await);
        assert!(mock.open().await);
        assert!(mock.is_open().await);
        assert!(mock.close().await);
        assert!(!mock.is_open().await);
        assert_eq!(mock.open_count(), 1);
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_open_failure_injection() {
        let mut mock = MockTransport::new();
        mock.fail_next_opens(1);
        assert!(!mock.open().await);
        // Failure should be consumed
        assert!(mock.open().await);
    }

    #[tokio::test]
    async fn test_mock_transport_script_precedes_responder() {
        let mut mock = MockTransport::new().with_responder("01");
        mock.set_value(Command::Valley, -3.25);
        mock.push_silence(1);
        mock.push_answer("01X03?43\r");
        mock.open().await;

        mock.write("01", "X03").await.unwrap();
        assert!(mock.read().await.unwrap().is_empty());
        assert_eq!(mock.read().await.unwrap(), b"01X03?43\r".to_vec());
        assert!(mock.read().await.unwrap().is_empty());

        mock.write("01", "X03").await.unwrap();
        assert_eq!(mock.read().await.unwrap(), b"01X03-3.25\r".to_vec());
        assert!(mock.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mock_transport_detects_interleaved_writes() {
        let mut mock = MockTransport::new().with_responder("01");
        mock.open().await;

        mock.write("01", "X01").await.unwrap();
        mock.read().await.unwrap();
        assert_eq!(mock.overlaps(), 0);

        mock.write("01", "X02").await.unwrap();
        mock.write("01", "X03").await.unwrap();
        assert_eq!(mock.overlaps(), 1);
        assert_eq!(mock.exchanges().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_transport_call_logging() {
        let mut mock = MockTransport::new();
        mock.open().await;
        mock.flush().await;
        mock.write("", "X04").await.unwrap();
        mock.push_fault();
        assert!(mock.read().await.is_err());

        assert_eq!(mock.call_log(), vec!["open", "flush", "write:X04", "read"]);
        mock.clear_log();
        assert!(mock.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_mock_transport_rejects_io_when_closed() {
        let mut mock = MockTransport::new();
        assert!(matches!(
            mock.write("01", "X01").await,
            Err(TransportError::NotOpen(_))
        ));
        assert!(matches!(mock.read().await, Err(TransportError::NotOpen(_))));
    }
}
