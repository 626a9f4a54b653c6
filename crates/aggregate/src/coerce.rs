//! Cross-backend type coercion for join-key comparison.
//!
//! Values from different backends are canonicalized into [`JoinKey`]s so
//! that hash joins compare them consistently: ObjectId-shaped strings and
//! ObjectIds meet as hex text, UUIDs as lowercase hyphenated text,
//! ISO-8601 strings and native datetimes as UTC instants, and numeric
//! strings as numbers. Floats land on a 1e-10 grid, approximating the
//! epsilon comparison documented for float/int promotion.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref INT_STRING: Regex = Regex::new(r"^-?\d+$").expect("int pattern compiles");
    static ref HEX24: Regex = Regex::new(r"^[0-9a-fA-F]{24}$").expect("hex pattern compiles");
}

/// Comparison tolerance for float/int promotion.
const EPSILON: f64 = 1e-10;

/// A canonical, hashable join key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JoinKey {
    Null,
    Bool(bool),
    Int(i64),
    /// A non-integral number, quantized to the 1e-10 comparison grid.
    Quantized(i128),
    /// A number outside the grid's range; raw bit pattern.
    Bits(u64),
    /// A point in time, as UTC microseconds.
    Instant(i64),
    Text(String),
    List(Vec<JoinKey>),
}

/// Canonicalizes `value` into a join key. `target` optionally forces the
/// coercion per a caller-supplied type mapping: one of `int`, `float`,
/// `str`, `bool`, `datetime`, or `date`.
pub fn join_key(value: &Value, target: Option<&str>) -> JoinKey {
    if let Some(target) = target {
        if let Some(key) = coerce_to_target(value, target) {
            return key;
        }
    }
    canonical(value)
}

fn coerce_to_target(value: &Value, target: &str) -> Option<JoinKey> {
    match target {
        "int" => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.round() as i64))
                .map(JoinKey::Int),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| JoinKey::Int(f.round() as i64)),
            _ => None,
        },
        "float" => match value {
            Value::Number(n) => n.as_f64().map(number_key),
            Value::String(s) => s.trim().parse::<f64>().ok().map(number_key),
            _ => None,
        },
        "str" => Some(JoinKey::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        "bool" => match value {
            Value::Bool(b) => Some(JoinKey::Bool(*b)),
            Value::String(s) => Some(JoinKey::Bool(matches!(
                s.to_ascii_lowercase().as_str(),
                "true" | "yes" | "1" | "t" | "y"
            ))),
            _ => None,
        },
        "datetime" | "date" => value.as_str().and_then(parse_instant).map(JoinKey::Instant),
        _ => None,
    }
}

fn canonical(value: &Value) -> JoinKey {
    match value {
        Value::Null => JoinKey::Null,
        Value::Bool(b) => JoinKey::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                JoinKey::Int(i)
            } else if let Some(f) = n.as_f64() {
                number_key(f)
            } else {
                JoinKey::Text(n.to_string())
            }
        }
        Value::String(s) => string_key(s),
        // A single-element list meets its scalar: the scalar side of a
        // list/scalar comparison is wrapped, which collapses here.
        Value::Array(items) if items.len() == 1 => canonical(&items[0]),
        Value::Array(items) => JoinKey::List(items.iter().map(canonical).collect()),
        Value::Object(_) => JoinKey::Text(value.to_string()),
    }
}

fn number_key(f: f64) -> JoinKey {
    if !f.is_finite() {
        return JoinKey::Bits(f.to_bits());
    }
    let rounded = f.round();
    if (f - rounded).abs() < EPSILON && rounded.abs() < i64::MAX as f64 {
        return JoinKey::Int(rounded as i64);
    }
    // Quantize to the 1e-10 grid while the product still fits.
    if f.abs() < 9.0e17 {
        JoinKey::Quantized((f / EPSILON).round() as i128)
    } else {
        JoinKey::Bits(f.to_bits())
    }
}

fn string_key(s: &str) -> JoinKey {
    if INT_STRING.is_match(s) {
        if let Ok(i) = s.parse::<i64>() {
            return JoinKey::Int(i);
        }
        return JoinKey::Text(s.to_string());
    }
    if HEX24.is_match(s) {
        // ObjectId-shaped: normalize to lowercase hex.
        return JoinKey::Text(s.to_ascii_lowercase());
    }
    if let Ok(uuid) = uuid::Uuid::parse_str(s) {
        return JoinKey::Text(uuid.hyphenated().to_string());
    }
    if let Some(micros) = parse_instant(s) {
        return JoinKey::Instant(micros);
    }
    JoinKey::Text(s.to_string())
}

/// Parses an ISO-8601 timestamp or date to UTC microseconds.
fn parse_instant(s: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc).timestamp_micros());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc().timestamp_micros());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc().timestamp_micros());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros());
    }
    None
}

/// Whether two values compare equal under the coercion rules, with
/// optional per-side target types from a type mapping.
pub fn values_equal(
    left: &Value,
    right: &Value,
    left_target: Option<&str>,
    right_target: Option<&str>,
) -> bool {
    join_key(left, left_target) == join_key(right, right_target)
}

/// A total order over JSON values: null < bool < number < string < array
/// < object, with deep lexicographic comparison inside arrays and
/// objects. Used for deterministic min/max and output ordering.
pub fn value_cmp(lhs: &Value, rhs: &Value) -> std::cmp::Ordering {
    use itertools::{EitherOrBoth, Itertools};
    use std::cmp::Ordering;

    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (lhs, rhs) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        }
        (Value::String(l), Value::String(r)) => l.cmp(r),
        (Value::Array(l), Value::Array(r)) => l
            .iter()
            .zip_longest(r)
            .map(|eob| match eob {
                EitherOrBoth::Both(l, r) => value_cmp(l, r),
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
        (Value::Object(l), Value::Object(r)) => l
            .iter()
            .zip_longest(r.iter())
            .map(|eob| match eob {
                EitherOrBoth::Both((lk, lv), (rk, rv)) => {
                    lk.cmp(rk).then_with(|| value_cmp(lv, rv))
                }
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
        (l, r) => rank(l).cmp(&rank(r)),
    }
}
