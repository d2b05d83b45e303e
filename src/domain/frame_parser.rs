//! Scale Frame Parser
//!
//! Decodes one line of the scale's serial protocol into a [`WeightReading`].
//!
//! # Frame shapes
//!
//! ```text
//! Legacy:   <status>,<mode>,<padding><sign?><decimal><unit?>
//!           ST,GS,    12.34KG        ST = stable, US = unstable
//!           US,NT,+  0.500kg         GS = gross,  NT = net
//!
//! Generic:  <label?> <sign?><digits>[.<digits>] <unit?>
//!           W 45.23 kg
//!           Weight: -0.75lb
//!           wn0012.50kg              label glued to the number
//!           1.234                    no unit -> kg
//! ```
//!
//! Anything that does not yield a finite number is dropped here. Scales
//! routinely emit partial lines, identification banners and status frames
//! (`HC-05`, `OL,GS,------kg`, `BAT 85%`), so a failed parse is logged at
//! trace level and never reported upward.

use crate::domain::models::{WeightReading, WeightUnit};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
enum ParseError {
    #[error("empty frame")]
    Empty,
    #[error("no numeric value")]
    NoNumber,
    #[error("value is not finite")]
    NotFinite,
}

/// Decode a single frame. `None` means the frame carried no usable weight.
pub fn parse(frame: &str) -> Option<WeightReading> {
    match decode(frame) {
        Ok(reading) => Some(reading),
        Err(e) => {
            trace!(frame = %frame.escape_debug(), reason = %e, "Dropping frame");
            None
        }
    }
}

fn decode(frame: &str) -> Result<WeightReading, ParseError> {
    // STX/ETX and line terminators are framing noise
    let cleaned: String = frame.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(ParseError::Empty);
    }

    match split_legacy(cleaned) {
        Some(legacy) => {
            let (value, unit) = extract_value(legacy.body).ok_or(ParseError::NoNumber)?;
            let stable = legacy.status.eq_ignore_ascii_case("ST");
            build(value, unit, cleaned, stable)
        }
        // Generic frames carry no stability flag
        None => {
            let (value, unit) = extract_value(cleaned).ok_or(ParseError::NoNumber)?;
            build(value, unit, cleaned, true)
        }
    }
}

fn build(
    value: f64,
    unit: Option<WeightUnit>,
    raw: &str,
    stable: bool,
) -> Result<WeightReading, ParseError> {
    WeightReading::new(value, unit.unwrap_or(WeightUnit::Kilogram), raw, stable)
        .ok_or(ParseError::NotFinite)
}

struct LegacyFrame<'a> {
    status: &'a str,
    body: &'a str,
}

/// `XX,YY,<body>` where both leading tokens are two ASCII letters.
fn split_legacy(frame: &str) -> Option<LegacyFrame<'_>> {
    let mut parts = frame.splitn(3, ',');
    let status = parts.next()?.trim();
    let mode = parts.next()?.trim();
    let body = parts.next()?;

    let is_token = |t: &str| t.len() == 2 && t.chars().all(|c| c.is_ascii_alphabetic());
    (is_token(status) && is_token(mode)).then_some(LegacyFrame { status, body })
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | ':' | ';' | '=')
}

/// Find the first signed decimal that stands as its own token and read the
/// unit word right after it.
///
/// A number counts when it starts a token (or follows a sign that does).
/// A label glued in front (`GS12.34kg`) is accepted only under the stricter
/// rules of [`glued_label_value`], so identifiers such as `HC-05` or `BT04`
/// are skipped. A number glued to anything other than a unit word (`85%`,
/// `2024-01-01`) is skipped too.
fn extract_value(text: &str) -> Option<(f64, Option<WeightUnit>)> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut at_boundary = true;
    let mut sign: Option<bool> = None; // Some(true) = negative

    while i < chars.len() {
        let c = chars[i];

        if is_separator(c) {
            // a sign may be padded from its digits, nothing else
            if !c.is_whitespace() {
                sign = None;
            }
            at_boundary = true;
            i += 1;
            continue;
        }

        if at_boundary && sign.is_none() && (c == '+' || c == '-') {
            sign = Some(c == '-');
            i += 1;
            continue;
        }

        if at_boundary && starts_number(&chars, i) {
            let (end, magnitude, _) = read_number(&chars, i)?;
            i = end;
            if let Some(unit) = read_unit(&chars[i..]) {
                let value = if sign == Some(true) { -magnitude } else { magnitude };
                return Some((value, unit));
            }
        }

        if at_boundary && sign.is_none() && c.is_alphabetic() {
            if let Some(found) = glued_label_value(&chars, i) {
                return Some(found);
            }
        }

        // Part of a label or identifier: skip the rest of this token
        while i < chars.len() && !is_separator(chars[i]) {
            i += 1;
        }
        at_boundary = false;
        sign = None;
    }

    None
}

/// `wn0012.50kg`, `N+12.3`: letters run straight into a signed number.
/// Needs a decimal point or a known unit, which keeps `HC-05` an identifier.
fn glued_label_value(chars: &[char], start: usize) -> Option<(f64, Option<WeightUnit>)> {
    let mut i = start;
    while i < chars.len() && chars[i].is_alphabetic() {
        i += 1;
    }

    let negative = match chars.get(i) {
        Some('-') => {
            i += 1;
            true
        }
        Some('+') => {
            i += 1;
            false
        }
        _ => false,
    };
    if i >= chars.len() || !starts_number(chars, i) {
        return None;
    }

    let (end, magnitude, has_dot) = read_number(chars, i)?;
    let unit = match read_unit(&chars[end..])? {
        Some(unit) => Some(unit),
        None if has_dot => None,
        None => return None,
    };
    let value = if negative { -magnitude } else { magnitude };
    Some((value, unit))
}

/// Digits with at most one decimal point, starting at `start`.
/// Returns the end index, the value and whether a point was seen.
fn read_number(chars: &[char], start: usize) -> Option<(usize, f64, bool)> {
    let mut i = start;
    let mut seen_dot = false;
    while i < chars.len() && (chars[i].is_ascii_digit() || (chars[i] == '.' && !seen_dot)) {
        seen_dot |= chars[i] == '.';
        i += 1;
    }
    let digits: String = chars[start..i].iter().collect();
    let value = digits.parse().ok()?;
    Some((i, value, seen_dot))
}

fn starts_number(chars: &[char], i: usize) -> bool {
    match chars[i] {
        c if c.is_ascii_digit() => true,
        '.' => chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// Inspect what follows a number.
///
/// `Some(Some(unit))` / `Some(None)` when the number is well terminated
/// (with or without a recognised unit), `None` when the number is glued to
/// something that makes the token not a weight.
fn read_unit(tail: &[char]) -> Option<Option<WeightUnit>> {
    let mut i = 0;
    while i < tail.len() && tail[i].is_whitespace() {
        i += 1;
    }
    let glued = i == 0;

    let start = i;
    while i < tail.len() && tail[i].is_alphabetic() {
        i += 1;
    }
    let word: String = tail[start..i].iter().collect();

    if word.is_empty() {
        // "12.5", "12.5 ", "12.5,": fine. "85%", "12-3": not a weight.
        return match tail.get(start) {
            None => Some(None),
            Some(&c) if !glued || is_separator(c) => Some(None),
            Some(_) => None,
        };
    }

    // "12AB34" is an identifier, not a number with a unit
    if glued && tail.get(i).is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }

    // Unrecognised unit words fall back to kilograms
    Some(WeightUnit::from_token(&word))
}
