//! Serial link for Newport INFS/Omega strain-gauge meters.
//!
//! The meter speaks a half-duplex ASCII protocol, `*<address><code>\r` out
//! and `<address><code><value>\r` back, over a local serial line or through
//! a remote serial device server. This crate provides:
//!
//! - [`adapters`]: the byte channels behind one [`adapters::Transport`] trait
//! - [`protocol`]: commands, frame encoding and answer decoding
//! - [`link`]: the gated request/response engine with retries and reconnect
//! - [`scheduler`]: shared periodic polling for subscribers
//! - [`meter`]: the [`InfinityMeter`] facade a device server holds
//!
//! # Example
//!
//! ```no_run
//! use infinity_meter::{adapters::NoProxies, InfinityMeter, MeterConfig, StatusNotifier};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = MeterConfig::for_channel("/dev/ttyS0", "01");
//! let meter = InfinityMeter::connect(config, &NoProxies, StatusNotifier::silent()).await?;
//! if meter.open().await {
//!     println!("filtered: {}", meter.get_filtered_value().await?);
//!     meter.close().await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod meter;
pub mod protocol;
pub mod scheduler;
pub mod status;

pub use config::MeterConfig;
pub use error::{MeterError, MeterResult};
pub use link::{GateMode, InstrumentLink, LinkState};
pub use meter::InfinityMeter;
pub use protocol::Command;
pub use scheduler::{PollingScheduler, SubscriberCallback};
pub use status::{StatusLevel, StatusNotifier};
