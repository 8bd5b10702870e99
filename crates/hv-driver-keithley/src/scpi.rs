//! Reply parsing shared by the Keithley variants.
//!
//! Replies have already been through [`hv_core::transport::clean_response`]:
//! control characters removed, commas turned into spaces.

use hv_core::{HvError, HvResult};

/// Parse the leading number of a token, ignoring a unit/status suffix.
///
/// `"+1.234E-12NADC"` parses as `1.234e-12`.
pub fn leading_number(token: &str) -> Option<f64> {
    let end = token
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')))
        .unwrap_or(token.len());

    // The numeric prefix may still end in a dangling exponent marker.
    let mut candidate = &token[..end];
    while !candidate.is_empty() {
        if let Ok(v) = candidate.parse::<f64>() {
            return Some(v);
        }
        candidate = &candidate[..candidate.len() - 1];
    }
    None
}

/// Parse a number, naming the reply in the error.
pub fn number(token: &str, reply: &str) -> HvResult<f64> {
    leading_number(token)
        .filter(|v| v.is_finite())
        .ok_or_else(|| HvError::Measurement(format!("unparsable value '{token}' in '{reply}'")))
}

/// Status words are sent as floats (`+3.8410E+04`).
pub fn status_word(token: &str, reply: &str) -> HvResult<u32> {
    let value = number(token, reply)?;
    if value < 0.0 || value > f64::from(u32::MAX) {
        return Err(HvError::Measurement(format!(
            "status word '{token}' out of range in '{reply}'"
        )));
    }
    Ok(value as u32)
}

/// Interpret an `:OUTP?` reply. `None` when the reply is not an integer.
pub fn output_flag(reply: &str) -> Option<bool> {
    reply.trim().parse::<i64>().ok().map(|v| v != 0)
}
