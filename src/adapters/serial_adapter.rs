//! Direct serial line transport
//!
//! Wraps the serialport crate and provides async I/O using Tokio's blocking
//! task executor for the synchronous serial operations. The meter expects
//! 7 data bits, odd parity, 1 stop bit and XON/XOFF by default.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

use super::Transport;
use crate::config::SerialSettings;
use crate::error::TransportError;
#[cfg(feature = "instrument_serial")]
use crate::protocol::codec::{encode, FRAME_END};

/// Longest reply accepted before a line is cut.
#[cfg(feature = "instrument_serial")]
const MAX_LINE_LEN: usize = 64;

/// Serial transport for a local tty device
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyS0", "COM3")
    port_name: String,

    /// Framing and timeouts
    settings: SerialSettings,

    /// The open port (behind Arc<Mutex> for the blocking executor)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,

    #[cfg(not(feature = "instrument_serial"))]
    port: Option<Arc<Mutex<()>>>,
}

impl SerialTransport {
    /// Create a closed transport for `port_name`.
    pub fn new(port_name: String, settings: SerialSettings) -> Self {
        Self {
            port_name,
            settings,
            port: None,
        }
    }

    /// Path of the tty.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[cfg(feature = "instrument_serial")]
fn data_bits(bits: u8) -> serialport::DataBits {
    match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}

#[cfg(feature = "instrument_serial")]
fn parity(parity: crate::config::SerialParity) -> serialport::Parity {
    match parity {
        crate::config::SerialParity::None => serialport::Parity::None,
        crate::config::SerialParity::Even => serialport::Parity::Even,
        crate::config::SerialParity::Odd => serialport::Parity::Odd,
    }
}

#[cfg(feature = "instrument_serial")]
fn io_error(channel: &str, source: std::io::Error) -> TransportError {
    if source.kind() == std::io::ErrorKind::TimedOut {
        TransportError::WriteTimeout(channel.to_string())
    } else {
        TransportError::Io {
            channel: channel.to_string(),
            source,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> bool {
        if self.port.is_some() {
            return true;
        }

        #[cfg(feature = "instrument_serial")]
        {
            let port_name = self.port_name.clone();
            let settings = self.settings.clone();

            let opened = tokio::task::spawn_blocking(move || {
                serialport::new(&port_name, settings.baud_rate)
                    .data_bits(data_bits(settings.data_bits))
                    .parity(parity(settings.parity))
                    .stop_bits(if settings.stop_bits == 2 {
                        serialport::StopBits::Two
                    } else {
                        serialport::StopBits::One
                    })
                    .flow_control(if settings.software_flow_control {
                        serialport::FlowControl::Software
                    } else {
                        serialport::FlowControl::None
                    })
                    .timeout(settings.io_timeout())
                    .open()
            })
            .await;

            match opened {
                Ok(Ok(port)) => {
                    self.port = Some(Arc::new(Mutex::new(port)));
                    debug!("Serial port '{}' opened", self.describe());
                    true
                }
                Ok(Err(e)) => {
                    error!("Cannot open {} due to: {}", self.port_name, e);
                    false
                }
                Err(e) => {
                    error!("Serial open task for {} failed: {}", self.port_name, e);
                    false
                }
            }
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            error!(
                "Cannot open {} due to: {}",
                self.port_name,
                TransportError::SerialFeatureDisabled
            );
            false
        }
    }

    async fn close(&mut self) -> bool {
        match self.port.take() {
            Some(_) => {
                debug!("Serial port '{}' closed", self.port_name);
                true
            }
            None => false,
        }
    }

    async fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            let Some(port) = self.port.as_ref() else {
                return false;
            };
            let port = Arc::clone(port);
            tokio::task::spawn_blocking(move || port.blocking_lock().bytes_to_read().is_ok())
                .await
                .unwrap_or(false)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            self.port.is_some()
        }
    }

    async fn flush(&mut self) -> bool {
        let Some(port) = self.port.as_ref() else {
            warn!("Flushing unexisting descriptor {}", self.port_name);
            return false;
        };

        #[cfg(feature = "instrument_serial")]
        {
            let port = Arc::clone(port);
            let result = tokio::task::spawn_blocking(move || {
                let port = port.blocking_lock();
                let pending = port.bytes_to_read()?;
                if pending != 0 {
                    debug!("flushing incoming {} bytes", pending);
                    port.clear(serialport::ClearBuffer::Input)?;
                }
                Ok::<(), serialport::Error>(())
            })
            .await;

            match result {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!("Flush exception on {}: {}", self.port_name, e);
                    false
                }
                Err(e) => {
                    error!("Flush task for {} failed: {}", self.port_name, e);
                    false
                }
            }
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = port;
            false
        }
    }

    async fn write(&mut self, address: &str, wire_code: &str) -> Result<(), TransportError> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| TransportError::NotOpen(self.port_name.clone()))?;

        #[cfg(feature = "instrument_serial")]
        {
            let frame = encode(address, wire_code);
            debug!("sending: {:?}", String::from_utf8_lossy(&frame));
            let port = Arc::clone(port);
            let channel = self.port_name.clone();

            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut port = port.blocking_lock();
                port.write_all(&frame).map_err(|e| io_error(&channel, e))?;
                port.flush().map_err(|e| io_error(&channel, e))
            })
            .await
            .map_err(|e| TransportError::Io {
                channel: self.port_name.clone(),
                source: std::io::Error::other(e),
            })?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (port, address, wire_code);
            Err(TransportError::SerialFeatureDisabled)
        }
    }

    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| TransportError::NotOpen(self.port_name.clone()))?;

        #[cfg(feature = "instrument_serial")]
        {
            let port = Arc::clone(port);
            let channel = self.port_name.clone();

            let answer = tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let mut port = port.blocking_lock();
                let mut line = Vec::new();
                let mut byte = [0u8; 1];

                while line.len() < MAX_LINE_LEN {
                    match port.read(&mut byte) {
                        Ok(0) => break,
                        Ok(_) => {
                            line.push(byte[0]);
                            if byte[0] == FRAME_END {
                                break;
                            }
                        }
                        // Port timeout: hand back whatever arrived, maybe nothing
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                        Err(source) => return Err(TransportError::Io { channel, source }),
                    }
                }
                Ok(line)
            })
            .await
            .map_err(|e| TransportError::Io {
                channel: self.port_name.clone(),
                source: std::io::Error::other(e),
            })??;

            debug!("received {:?}", String::from_utf8_lossy(&answer));
            Ok(answer)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = port;
            Err(TransportError::SerialFeatureDisabled)
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} ({},{},{},{})",
            self.port_name,
            self.settings.baud_rate,
            self.settings.data_bits,
            self.settings.stop_bits,
            self.settings.parity.letter()
        )
    }
}
