//! Error types for the meter link.
//!
//! Three layers, three enums:
//!
//! - **`TransportError`**: raised at the adapter boundary. A read timeout is
//!   *not* an error there (it is an empty answer); these are the faults that
//!   mean the channel itself misbehaved.
//! - **`AnswerError`**: the classification of a reply that could not be turned
//!   into a number. All variants except [`AnswerError::Malformed`] are "soft":
//!   the caller sees `NaN` plus a status notification.
//! - **`MeterError`**: what crosses the public API. Only capacity/identifier
//!   problems, explicit no-answer failures, hard decode faults and
//!   configuration errors end up here.
//!
//! By using `#[from]`, lower layers convert into `MeterError` with `?`.

use thiserror::Error;

use crate::protocol::Command;

/// Convenience alias for results using the crate error type.
pub type MeterResult<T> = std::result::Result<T, MeterError>;

/// Faults of the underlying byte channel.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Read or write on a closed channel
    #[error("Channel {0} is not open")]
    NotOpen(String),

    /// The line did not accept the frame in time
    #[error("Timeout writing to {0}")]
    WriteTimeout(String),

    /// Operating system error on a local tty
    #[error("I/O error on {channel}: {source}")]
    Io {
        /// Port path
        channel: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Remote serial device call failed
    #[error("Proxy {device} failed: {message}")]
    Proxy {
        /// Remote device name
        device: String,
        /// Error reported by the proxy client
        message: String,
    },

    /// Built without the `instrument_serial` feature
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

/// Classification of an instrument reply that does not carry a value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnswerError {
    /// `?<code>` from the meter's error table
    #[error("Received an error {code}: {meaning}")]
    InstrumentError {
        /// Two character code after `?`
        code: String,
        /// Meaning of the code
        meaning: &'static str,
    },

    /// `?+999999` or `?-999999`
    #[error("Received an overflow answer: {0:?}")]
    Overflow(String),

    /// `?` followed by anything else
    #[error("Received an unknown error code: {0:?}")]
    UnknownErrorCode(String),

    /// Answer from another meter on the bus
    #[error("Answer {answer:?} is not from the expected address {address:?}")]
    AddressMismatch {
        /// Address the request went to
        address: String,
        /// Raw answer
        answer: String,
    },

    /// Answer to a different command, usually a stale one
    #[error("Answer {answer:?} is not for the question '*{expected}\\r'")]
    CommandMismatch {
        /// Address and wire code of the request
        expected: String,
        /// Raw answer
        answer: String,
    },

    /// Echo matches but the value does not parse
    #[error("Answer {answer:?} carries an unparsable value {value:?}")]
    Malformed {
        /// Raw answer
        answer: String,
        /// Text that failed to parse
        value: String,
    },
}

impl AnswerError {
    /// Soft answers resolve to `NaN`; only a malformed value is a hard fault.
    pub fn is_soft(&self) -> bool {
        !matches!(self, AnswerError::Malformed { .. })
    }
}

/// Primary error type of the crate.
#[derive(Error, Debug)]
pub enum MeterError {
    /// Every read attempt came back empty
    #[error("No answer received to '{address}{wire_code}' after {attempts} attempts ({command})")]
    NoAnswer {
        /// Command asked
        command: Command,
        /// Bus address asked
        address: String,
        /// Wire code sent
        wire_code: &'static str,
        /// Read attempts made
        attempts: u32,
    },

    /// Every subscription identifier is taken
    #[error("No more subscription slots available (maximum {0})")]
    CapacityExceeded(usize),

    /// Unsubscribe of an identifier not in use
    #[error("Not recognized subscription identifier {0}")]
    UnknownIdentifier(usize),

    /// Measurement name or wire code not known
    #[error("Unrecognized command {0:?}")]
    UnrecognizedCommand(String),

    /// Hard answer decode failure
    #[error("Answer decode failure: {0}")]
    Decode(#[from] AnswerError),

    /// Channel fault
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel is neither a local tty nor a resolvable proxy
    #[error("Unable to identify how to manage the channel {0:?}")]
    UnsupportedChannel(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl MeterError {
    /// Failures that count against the link and may warrant a reconnect.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, MeterError::NoAnswer { .. } | MeterError::Transport(_))
    }
}
