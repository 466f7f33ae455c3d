//! Frame encoding and answer decoding.

use crate::error::AnswerError;

/// Request start character.
pub const FRAME_START: u8 = b'*';
/// Request and reply terminator.
pub const FRAME_END: u8 = b'\r';

/// Two character error codes the meter may report after a `?`.
pub const ERROR_CODES: [(&str, &str); 7] = [
    ("43", "Command Error"),
    ("46", "Format Error"),
    ("48", "Checksum Error"),
    ("50", "Parity Error"),
    ("4C", "Calibration/Write Lockout Error"),
    ("45", "EEPROM Write Lockout Error"),
    ("56", "Serial Device Address Error"),
];

/// Values reported after a `?` when the measurement is out of range.
pub const OVERFLOW_SENTINELS: [i64; 2] = [999_999, -999_999];

/// Look up the human readable meaning of an instrument error code.
pub fn error_meaning(code: &str) -> Option<&'static str> {
    ERROR_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, meaning)| *meaning)
}

/// Build the request frame `*<address><wire code>\r`.
pub fn encode(address: &str, wire_code: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(address.len() + wire_code.len() + 2);
    frame.push(FRAME_START);
    frame.extend_from_slice(address.as_bytes());
    frame.extend_from_slice(wire_code.as_bytes());
    frame.push(FRAME_END);
    frame
}

/// Decode a raw reply to the request `address` + `wire_code`.
///
/// Checks are applied in order: error marker, address, command echo, value.
/// Everything except an unparsable value is a soft failure (see
/// [`AnswerError::is_soft`]).
pub fn decode(address: &str, wire_code: &str, raw: &[u8]) -> Result<f64, AnswerError> {
    let answer = String::from_utf8_lossy(raw);

    if answer.contains('?') {
        // e.g. "01X01?+999999\r" or "01?43\r"
        let code = answer.trim().rsplit('?').next().unwrap_or_default().trim();
        return Err(classify_error_code(code));
    }

    if !answer.starts_with(address) {
        return Err(AnswerError::AddressMismatch {
            address: address.to_string(),
            answer: answer.into_owned(),
        });
    }

    let expected = format!("{address}{wire_code}");
    let Some(value) = answer.strip_prefix(expected.as_str()) else {
        return Err(AnswerError::CommandMismatch {
            expected,
            answer: answer.into_owned(),
        });
    };

    let value = value.trim();
    value.parse::<f64>().map_err(|_| AnswerError::Malformed {
        answer: answer.to_string(),
        value: value.to_string(),
    })
}

fn classify_error_code(code: &str) -> AnswerError {
    if let Some(meaning) = error_meaning(code) {
        return AnswerError::InstrumentError {
            code: code.to_string(),
            meaning,
        };
    }
    match code.parse::<i64>() {
        Ok(n) if OVERFLOW_SENTINELS.contains(&n) => AnswerError::Overflow(code.to_string()),
        _ => AnswerError::UnknownErrorCode(code.to_string()),
    }
}
