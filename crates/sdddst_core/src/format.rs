//! Number formatting compatible with C `printf` conversions.
//!
//! Coordinate files, checkpoint names and the step log are consumed by
//! existing tooling that expects `%e`-style exponents (sign and at least
//! two digits), which Rust's `{:e}` does not produce.

fn non_finite(value: f64) -> Option<String> {
    if value.is_nan() {
        Some("nan".to_string())
    } else if value.is_infinite() {
        Some(if value > 0.0 { "inf" } else { "-inf" }.to_string())
    } else {
        None
    }
}

fn split_exponent(formatted: &str) -> (&str, i32) {
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => (mantissa, exponent.parse().unwrap_or(0)),
        None => (formatted, 0),
    }
}

fn c_exponent(exponent: i32) -> String {
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("e{sign}{:02}", exponent.abs())
}

fn strip_trailing_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Equivalent of `%.{precision}e`.
pub fn scientific(value: f64, precision: usize) -> String {
    if let Some(text) = non_finite(value) {
        return text;
    }
    let formatted = format!("{:.*e}", precision, value);
    let (mantissa, exponent) = split_exponent(&formatted);
    format!("{mantissa}{}", c_exponent(exponent))
}

/// Equivalent of `%.{precision}g`.
pub fn general(value: f64, precision: usize) -> String {
    if let Some(text) = non_finite(value) {
        return text;
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let precision = precision.max(1);
    let formatted = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = split_exponent(&formatted);
    if exponent < -4 || exponent >= precision as i32 {
        format!("{}{}", strip_trailing_zeros(mantissa), c_exponent(exponent))
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        strip_trailing_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}
