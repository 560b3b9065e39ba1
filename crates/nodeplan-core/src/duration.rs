//! Durations written as `30s`, `5m`, `1h30m` or `Never`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration {0:?}: expected e.g. \"30s\", \"5m\", \"1h30m\" or \"Never\"")]
pub struct DurationError(pub String);

/// A signed duration in whole seconds, or `Never`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NillableDuration {
    Never,
    Seconds(i64),
}

impl NillableDuration {
    pub fn as_secs(&self) -> Option<i64> {
        match self {
            NillableDuration::Never => None,
            NillableDuration::Seconds(s) => Some(*s),
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, NillableDuration::Seconds(s) if *s < 0)
    }
}

/// Parse a duration string into seconds. Units: `s`, `m`, `h`; a bare number
/// is seconds.
pub fn parse_duration_secs(input: &str) -> Result<i64, DurationError> {
    let err = || DurationError(input.to_string());
    let s = input.trim();
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if body.is_empty() {
        return Err(err());
    }
    if let Ok(secs) = body.parse::<i64>() {
        return Ok(if negative { -secs } else { secs });
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    for c in body.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return Err(err()),
        };
        let n: i64 = digits.parse().map_err(|_| err())?;
        total = n
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(err)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(err());
    }
    Ok(if negative { -total } else { total })
}

impl FromStr for NillableDuration {
    type Err = DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim() == "Never" {
            return Ok(NillableDuration::Never);
        }
        parse_duration_secs(s).map(NillableDuration::Seconds)
    }
}

impl fmt::Display for NillableDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NillableDuration::Never => f.write_str("Never"),
            NillableDuration::Seconds(s) => write!(f, "{s}s"),
        }
    }
}

impl Serialize for NillableDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NillableDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
