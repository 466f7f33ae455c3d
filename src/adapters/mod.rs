//! Transport adapters
//!
//! Three physically different byte channels behind one contract:
//!
//! - [`SerialTransport`]: a local tty opened through the `serialport` crate
//! - [`ProxySerialTransport`]: a remote serial device exposing
//!   `WriteString` / `ReadNChar` / `Flush`
//! - [`PySerialTransport`]: a remote byte-array serial device exposing
//!   `write` / `readline` / `FlushInput` plus an open/close/state query
//!
//! Upper layers only see [`Transport`], so they are channel-agnostic.

pub mod mock_adapter;
pub mod proxy;
pub mod serial_adapter;

pub use mock_adapter::MockTransport;
pub use proxy::{
    FlushTarget, ProxyState, PySerialProxy, PySerialTransport, ProxySerialTransport,
    SerialDeviceProxy,
};
pub use serial_adapter::SerialTransport;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::config::MeterConfig;
use crate::error::{MeterError, MeterResult, TransportError};

/// Uniform contract of every byte channel to the meter.
///
/// Timeouts while reading are *not* errors: `read` returns an empty buffer
/// and the caller decides whether to retry. An `Err` from `read` or `write`
/// means the channel itself failed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the channel. Safe to call when already open. On failure the
    /// cause is logged and `false` is returned with the state unchanged.
    async fn open(&mut self) -> bool;

    /// Release the channel. Safe to call when not open.
    async fn close(&mut self) -> bool;

    /// Live state of the channel.
    async fn is_open(&self) -> bool;

    /// Discard pending *input*. Pending output is never dropped, an
    /// interrupted command could leave the meter half way through a frame.
    async fn flush(&mut self) -> bool;

    /// Frame and send `*<address><wire code>\r`.
    async fn write(&mut self, address: &str, wire_code: &str) -> Result<(), TransportError>;

    /// Next line up to the terminator, or empty on timeout.
    async fn read(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Human readable description of the channel.
    fn describe(&self) -> String;

    /// Whether the bytes travel through a remote proxy device.
    fn uses_proxy(&self) -> bool {
        false
    }
}

/// A resolved remote serial device.
#[derive(Clone)]
pub enum ProxyHandle {
    /// Byte-string serial device class
    Serial(Arc<dyn SerialDeviceProxy>),
    /// Byte-array (pyserial based) device class
    PySerial(Arc<dyn PySerialProxy>),
}

/// Turns a remote device name into a proxy client.
///
/// The RPC client library lives outside this crate; the hosting server
/// provides an implementation.
#[async_trait]
pub trait ProxyResolver: Send + Sync {
    /// Client for the device called `name`.
    async fn resolve(&self, name: &str) -> MeterResult<ProxyHandle>;
}

/// Resolver for hosts without any proxy client: every name is unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxies;

#[async_trait]
impl ProxyResolver for NoProxies {
    async fn resolve(&self, name: &str) -> MeterResult<ProxyHandle> {
        Err(MeterError::UnsupportedChannel(name.to_string()))
    }
}

/// Whether `channel` names a local serial device rather than a proxy.
pub fn is_local_device(channel: &str) -> bool {
    channel.starts_with("/dev/")
        || channel
            .strip_prefix("COM")
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Build the transport for the configured channel.
pub async fn connect(
    config: &MeterConfig,
    resolver: &dyn ProxyResolver,
) -> MeterResult<Box<dyn Transport>> {
    if is_local_device(&config.channel) {
        debug!(channel = %config.channel, "Using direct serial line");
        return Ok(Box::new(SerialTransport::new(
            config.channel.clone(),
            config.serial.clone(),
        )));
    }

    debug!(channel = %config.channel, "Resolving proxy device");
    let transport: Box<dyn Transport> = match resolver.resolve(&config.channel).await? {
        ProxyHandle::Serial(proxy) => Box::new(ProxySerialTransport::new(proxy)),
        ProxyHandle::PySerial(proxy) => Box::new(PySerialTransport::new(proxy)),
    };
    Ok(transport)
}
