//! INFS/Omega ASCII protocol
//!
//! Requests are `*<address><wire code>\r`, replies are
//! `<address><wire code><value>\r` or `<address><wire code>?<code>\r`.
//! The instrument answers exactly one question at a time.

pub mod codec;

pub use codec::{decode, encode, error_meaning, ERROR_CODES, OVERFLOW_SENTINELS};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MeterError;

/// The four fixed measurements the meter can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Command {
    /// Raw reading (`X01`)
    #[serde(rename = "UnfilteredValue")]
    Unfiltered,
    /// Peak hold (`X02`)
    #[serde(rename = "PeakValue")]
    Peak,
    /// Valley hold (`X03`)
    #[serde(rename = "ValleyValue")]
    Valley,
    /// Filtered reading (`X04`)
    #[serde(rename = "FilteredValue")]
    Filtered,
}

impl Command {
    /// All commands in wire-code order.
    pub const ALL: [Command; 4] = [
        Command::Unfiltered,
        Command::Peak,
        Command::Valley,
        Command::Filtered,
    ];

    /// Three character code sent on the wire.
    pub fn wire_code(self) -> &'static str {
        match self {
            Command::Unfiltered => "X01",
            Command::Peak => "X02",
            Command::Valley => "X03",
            Command::Filtered => "X04",
        }
    }

    /// Measurement name as exposed to the device server.
    pub fn name(self) -> &'static str {
        match self {
            Command::Unfiltered => "UnfilteredValue",
            Command::Peak => "PeakValue",
            Command::Valley => "ValleyValue",
            Command::Filtered => "FilteredValue",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|cmd| cmd.name() == s || cmd.wire_code() == s)
            .ok_or_else(|| MeterError::UnrecognizedCommand(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        let codes: Vec<_> = Command::ALL.iter().map(|c| c.wire_code()).collect();
        assert_eq!(codes, vec!["X01", "X02", "X03", "X04"]);
    }

    #[test]
    fn test_parse_by_name_and_code() {
        assert_eq!("PeakValue".parse::<Command>().unwrap(), Command::Peak);
        assert_eq!("X04".parse::<Command>().unwrap(), Command::Filtered);
    }

    #[test]
    fn test_unrecognized_command() {
        let err = "Temperature".parse::<Command>().unwrap_err();
        assert!(matches!(err, MeterError::UnrecognizedCommand(ref s) if s == "Temperature"));
    }

    #[test]
    fn test_display_matches_attribute_name() {
        assert_eq!(Command::Valley.to_string(), "ValleyValue");
    }
}
