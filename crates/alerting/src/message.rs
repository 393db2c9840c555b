//! Alert Message Formatting

use threshold_monitor::BoundPair;

/// Render the alert text for an out-of-range reading.
///
/// Bounds are shown without decimals and the reading with two, both rounded
/// half-up from their shortest decimal form.
pub fn format_alert(bounds: &BoundPair, value: f64) -> String {
    format!(
        "Range between {} and {} expected.\nValue of {} detected.",
        format_decimal(bounds.low, 0),
        format_decimal(bounds.high, 0),
        format_decimal(value, 2),
    )
}

/// Fixed-point rendering with half-up rounding applied to the shortest
/// round-trip representation, so `57.345` becomes `57.35`.
fn format_decimal(value: f64, decimals: usize) -> String {
    if !value.is_finite() {
        return value.to_string();
    }

    let repr = value.abs().to_string();
    let (int_part, frac_part) = repr.split_once('.').unwrap_or((repr.as_str(), ""));

    let mut digits: Vec<u8> = int_part
        .bytes()
        .chain(frac_part.bytes().chain(std::iter::repeat(b'0')).take(decimals))
        .map(|b| b - b'0')
        .collect();

    let round_up = frac_part
        .as_bytes()
        .get(decimals)
        .is_some_and(|&digit| digit >= b'5');
    if round_up {
        let mut i = digits.len();
        loop {
            if i == 0 {
                digits.insert(0, 1);
                break;
            }
            i -= 1;
            if digits[i] == 9 {
                digits[i] = 0;
            } else {
                digits[i] += 1;
                break;
            }
        }
    }

    let point = digits.len() - decimals;
    let mut out = String::with_capacity(digits.len() + 2);
    if value.is_sign_negative() {
        out.push('-');
    }
    for (i, digit) in digits.iter().enumerate() {
        if i == point {
            out.push('.');
        }
        out.push(char::from(b'0' + digit));
    }
    out
}
