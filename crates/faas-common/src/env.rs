//! Helpers for environment-style configuration.

use std::time::Duration;

use crate::{FaasError, Result};

/// Parse `8`, `8s`, `500ms`, `2m` or `1h`. A bare number means seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Typed access to a key/value lookup such as `std::env::var`.
pub struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    pub fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    pub fn duration(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => parse_duration(&raw)
                .ok_or_else(|| FaasError::Config(format!("{key}: invalid duration '{raw}'"))),
        }
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| FaasError::Config(format!("{key}: invalid boolean '{raw}'"))),
        }
    }

    pub fn number<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| FaasError::Config(format!("{key}: invalid number '{raw}'"))),
        }
    }
}
