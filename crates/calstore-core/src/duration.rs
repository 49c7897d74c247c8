//! RFC 5545 duration text.
//!
//! Parsing is lenient: stores and clients write `P3600S`, `P1DT2H` without the `T`,
//! or mix weeks with other units. All of these are accepted.

use crate::error::CoreError;
use chrono::Duration;

pub fn parse_duration(text: &str) -> Result<Duration, CoreError> {
    let trimmed = text.trim();
    let malformed = |reason: &str| CoreError::malformed(trimmed, reason.to_string());

    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let rest = rest
        .strip_prefix('P')
        .or_else(|| rest.strip_prefix('p'))
        .ok_or_else(|| malformed("duration must start with P"))?;

    let mut seconds: i64 = 0;
    let mut number: Option<i64> = None;
    let mut units = 0;
    for c in rest.chars() {
        match c.to_ascii_uppercase() {
            digit @ '0'..='9' => {
                let value = number
                    .unwrap_or(0)
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(i64::from(digit as u8 - b'0')))
                    .ok_or_else(|| malformed("duration out of range"))?;
                number = Some(value);
            }
            'T' => {
                if number.is_some() {
                    return Err(malformed("number without unit"));
                }
            }
            unit @ ('W' | 'D' | 'H' | 'M' | 'S') => {
                let value = number.take().ok_or_else(|| malformed("unit without number"))?;
                let factor = match unit {
                    'W' => 7 * 86_400,
                    'D' => 86_400,
                    'H' => 3_600,
                    'M' => 60,
                    _ => 1,
                };
                seconds = value
                    .checked_mul(factor)
                    .and_then(|v| seconds.checked_add(v))
                    .ok_or_else(|| malformed("duration out of range"))?;
                units += 1;
            }
            _ => return Err(malformed("unexpected character")),
        }
    }
    if number.is_some() || units == 0 {
        return Err(malformed("incomplete duration"));
    }

    let duration =
        Duration::try_seconds(seconds).ok_or_else(|| malformed("duration out of range"))?;
    Ok(if negative { -duration } else { duration })
}

/// Formats a duration in canonical RFC 5545 form (`P1W`, `P1DT2H`, `-PT15M`, `PT0S`).
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let mut secs = total.unsigned_abs();

    if secs == 0 {
        return "PT0S".to_string();
    }
    if secs % (7 * 86_400) == 0 {
        return format!("{}P{}W", sign, secs / (7 * 86_400));
    }

    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3_600;
    secs %= 3_600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = format!("{}P", sign);
    if days > 0 {
        out.push_str(&format!("{}D", days));
    }
    if hours > 0 || minutes > 0 || secs > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes > 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if secs > 0 {
            out.push_str(&format!("{}S", secs));
        }
    }
    out
}
