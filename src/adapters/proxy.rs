//! Remote serial device transports
//!
//! The meter may sit behind a serial-line device server instead of a local
//! tty. Two device classes are in use and they expose different calls, so
//! each gets its own adapter. The RPC clients themselves are provided by the
//! host through [`SerialDeviceProxy`] and [`PySerialProxy`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

use super::Transport;
use crate::error::TransportError;
use crate::protocol::codec::encode;

/// Characters requested per `ReadNChar` call: one full reply line.
pub const READ_CHUNK: usize = 13;

/// Buffer selector of the byte-string device's `Flush` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    /// Receive buffer
    Input = 0,
    /// Transmit buffer
    Output = 1,
    /// Both buffers
    Both = 2,
}

/// State reported by the byte-array device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Port open
    On,
    /// Port closed
    Off,
    /// Device in fault
    Fault,
    /// State could not be read
    Unknown,
}

/// Client of a remote byte-string serial device.
#[async_trait]
pub trait SerialDeviceProxy: Send + Sync {
    /// Remote device name.
    fn name(&self) -> &str;
    /// Liveness check of the remote device.
    async fn ping(&self) -> anyhow::Result<()>;
    /// `WriteString`
    async fn write_string(&self, data: &str) -> anyhow::Result<()>;
    /// `ReadNChar`: up to `count` characters, empty when nothing arrived.
    async fn read_n_char(&self, count: usize) -> anyhow::Result<String>;
    /// `Flush`
    async fn flush(&self, target: FlushTarget) -> anyhow::Result<()>;
}

/// Client of a remote byte-array serial device.
#[async_trait]
pub trait PySerialProxy: Send + Sync {
    /// Remote device name.
    fn name(&self) -> &str;
    /// Port state of the remote device.
    async fn state(&self) -> anyhow::Result<ProxyState>;
    /// Open the remote port.
    async fn open(&self) -> anyhow::Result<()>;
    /// Close the remote port.
    async fn close(&self) -> anyhow::Result<()>;
    /// `write`
    async fn write(&self, data: Vec<u8>) -> anyhow::Result<()>;
    /// `readline`: empty when nothing arrived.
    async fn readline(&self) -> anyhow::Result<Vec<u8>>;
    /// `FlushInput`
    async fn flush_input(&self) -> anyhow::Result<()>;
}

fn proxy_error(device: &str, err: anyhow::Error) -> TransportError {
    TransportError::Proxy {
        device: device.to_string(),
        message: format!("{err:#}"),
    }
}

/// Transport over a byte-string serial device.
///
/// That device class manages its own port, so `open`/`close` only gate this
/// side; liveness comes from pinging the remote device.
pub struct ProxySerialTransport {
    proxy: Arc<dyn SerialDeviceProxy>,
    active: bool,
}

impl ProxySerialTransport {
    /// Wrap a resolved byte-string device.
    pub fn new(proxy: Arc<dyn SerialDeviceProxy>) -> Self {
        Self {
            proxy,
            active: false,
        }
    }
}

#[async_trait]
impl Transport for ProxySerialTransport {
    async fn open(&mut self) -> bool {
        match self.proxy.ping().await {
            Ok(()) => {
                self.active = true;
                true
            }
            Err(e) => {
                error!("Cannot open {} due to: {:#}", self.proxy.name(), e);
                false
            }
        }
    }

    async fn close(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    async fn is_open(&self) -> bool {
        self.active && self.proxy.ping().await.is_ok()
    }

    async fn flush(&mut self) -> bool {
        match self.proxy.flush(FlushTarget::Input).await {
            Ok(()) => true,
            Err(e) => {
                error!("Flush exception on {}: {:#}", self.proxy.name(), e);
                false
            }
        }
    }

    async fn write(&mut self, address: &str, wire_code: &str) -> Result<(), TransportError> {
        if !self.active {
            return Err(TransportError::NotOpen(self.proxy.name().to_string()));
        }
        let frame = String::from_utf8_lossy(&encode(address, wire_code)).into_owned();
        debug!("sending: {:?}", frame);
        self.proxy
            .write_string(&frame)
            .await
            .map_err(|e| proxy_error(self.proxy.name(), e))
    }

    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.active {
            return Err(TransportError::NotOpen(self.proxy.name().to_string()));
        }
        let answer = self
            .proxy
            .read_n_char(READ_CHUNK)
            .await
            .map_err(|e| proxy_error(self.proxy.name(), e))?;
        debug!("received {:?}", answer);
        Ok(answer.into_bytes())
    }

    fn describe(&self) -> String {
        self.proxy.name().to_string()
    }

    fn uses_proxy(&self) -> bool {
        true
    }
}

/// Transport over a byte-array serial device with its own open/close.
pub struct PySerialTransport {
    proxy: Arc<dyn PySerialProxy>,
}

impl PySerialTransport {
    /// Wrap a resolved byte-array device.
    pub fn new(proxy: Arc<dyn PySerialProxy>) -> Self {
        Self { proxy }
    }

    async fn state(&self) -> ProxyState {
        self.proxy.state().await.unwrap_or_else(|e| {
            error!("Cannot query state of {}: {:#}", self.proxy.name(), e);
            ProxyState::Unknown
        })
    }
}

#[async_trait]
impl Transport for PySerialTransport {
    async fn open(&mut self) -> bool {
        match self.state().await {
            ProxyState::On => true,
            ProxyState::Off => {
                if let Err(e) = self.proxy.open().await {
                    error!("Cannot open {} due to: {:#}", self.proxy.name(), e);
                    return false;
                }
                self.is_open().await
            }
            state => {
                error!("Cannot open {} in state {:?}", self.proxy.name(), state);
                false
            }
        }
    }

    async fn close(&mut self) -> bool {
        if self.state().await != ProxyState::On {
            return false;
        }
        if let Err(e) = self.proxy.close().await {
            error!("Cannot close {} due to: {:#}", self.proxy.name(), e);
            return false;
        }
        !self.is_open().await
    }

    async fn is_open(&self) -> bool {
        self.state().await == ProxyState::On
    }

    async fn flush(&mut self) -> bool {
        match self.proxy.flush_input().await {
            Ok(()) => true,
            Err(e) => {
                error!("Flush exception on {}: {:#}", self.proxy.name(), e);
                false
            }
        }
    }

    async fn write(&mut self, address: &str, wire_code: &str) -> Result<(), TransportError> {
        let frame = encode(address, wire_code);
        debug!("sending: {:?}", String::from_utf8_lossy(&frame));
        self.proxy
            .write(frame)
            .await
            .map_err(|e| proxy_error(self.proxy.name(), e))
    }

    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        let answer = self
            .proxy
            .readline()
            .await
            .map_err(|e| proxy_error(self.proxy.name(), e))?;
        debug!("received {:?}", String::from_utf8_lossy(&answer));
        Ok(answer)
    }

    fn describe(&self) -> String {
        self.proxy.name().to_string()
    }

    fn uses_proxy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSerialDevice {
        alive: bool,
        calls: Mutex<Vec<String>>,
        lines: Mutex<VecDeque<String>>,
    }

    impl FakeSerialDevice {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SerialDeviceProxy for FakeSerialDevice {
        fn name(&self) -> &str {
            "lab/serial/01"
        }
        async fn ping(&self) -> anyhow::Result<()> {
            if self.alive {
                Ok(())
            } else {
                Err(anyhow::anyhow!("device not exported"))
            }
        }
        async fn write_string(&self, data: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("WriteString {data:?}"));
            Ok(())
        }
        async fn read_n_char(&self, count: usize) -> anyhow::Result<String> {
            self.calls.lock().unwrap().push(format!("ReadNChar {count}"));
            Ok(self.lines.lock().unwrap().pop_front().unwrap_or_default())
        }
        async fn flush(&self, target: FlushTarget) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("Flush {}", target as u8));
            Ok(())
        }
    }

    struct FakePySerialDevice {
        state: Mutex<ProxyState>,
        written: Mutex<Vec<Vec<u8>>>,
        flushed_input: Mutex<u32>,
    }

    impl FakePySerialDevice {
        fn new(state: ProxyState) -> Self {
            Self {
                state: Mutex::new(state),
                written: Mutex::new(Vec::new()),
                flushed_input: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl PySerialProxy for FakePySerialDevice {
        fn name(&self) -> &str {
            "lab/pyserial/01"
        }
        async fn state(&self) -> anyhow::Result<ProxyState> {
            Ok(*self.state.lock().unwrap())
        }
        async fn open(&self) -> anyhow::Result<()> {
            *self.state.lock().unwrap() = ProxyState::On;
            Ok(())
        }
        async fn close(&self) -> anyhow::Result<()> {
            *self.state.lock().unwrap() = ProxyState::Off;
            Ok(())
        }
        async fn write(&self, data: Vec<u8>) -> anyhow::Result<()> {
            self.written.lock().unwrap().push(data);
            Ok(())
        }
        async fn readline(&self) -> anyhow::Result<Vec<u8>> {
            Ok(b"01X01123.5\r".to_vec())
        }
        async fn flush_input(&self) -> anyhow::Result<()> {
            *self.flushed_input.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_serial_proxy_round_trip() {
        let device = Arc::new(FakeSerialDevice {
            alive: true,
            ..Default::default()
        });
        device.lines.lock().unwrap().push_back("01X0242.0\r".to_string());
        let mut transport = ProxySerialTransport::new(device.clone());

        assert!(transport.open().await);
        assert!(transport.is_open().await);
        assert!(transport.flush().await);
        transport.write("01", "X02").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), b"01X0242.0\r".to_vec());
        assert!(transport.read().await.unwrap().is_empty());

        assert_eq!(
            device.calls(),
            vec![
                "Flush 0".to_string(),
                "WriteString \"*01X02\\r\"".to_string(),
                "ReadNChar 13".to_string(),
                "ReadNChar 13".to_string(),
            ]
        );
        assert!(transport.uses_proxy());
        assert!(transport.close().await);
        assert!(!transport.is_open().await);
    }

    #[tokio::test]
    async fn test_serial_proxy_unreachable() {
        let device = Arc::new(FakeSerialDevice::default());
        let mut transport = ProxySerialTransport::new(device);
        assert!(!transport.open().await);
        assert!(matches!(
            transport.write("01", "X01").await,
            Err(TransportError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_pyserial_open_close_follow_remote_state() {
        let device = Arc::new(FakePySerialDevice::new(ProxyState::Off));
        let mut transport = PySerialTransport::new(device.clone());

        assert!(!transport.is_open().await);
        assert!(transport.open().await);
        assert!(transport.open().await);
        assert!(transport.is_open().await);

        transport.write("01", "X01").await.unwrap();
        assert_eq!(device.written.lock().unwrap()[0], b"*01X01\r".to_vec());
        assert_eq!(transport.read().await.unwrap(), b"01X01123.5\r".to_vec());

        assert!(transport.flush().await);
        assert_eq!(*device.flushed_input.lock().unwrap(), 1);

        assert!(transport.close().await);
        assert!(!transport.close().await);
    }

    #[tokio::test]
    async fn test_pyserial_fault_state_refuses_open() {
        let device = Arc::new(FakePySerialDevice::new(ProxyState::Fault));
        let mut transport = PySerialTransport::new(device);
        assert!(!transport.open().await);
    }
}
