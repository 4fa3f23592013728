//! Human-readable durations: `250ms`, `30s`, `1m30s`, `2h`, or bare seconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use crate::error::ConfigError;

/// Longest duration accepted anywhere in the configuration (ten years).
pub const MAX: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Parse a duration string.
///
/// Accepts one or more `<number><unit>` groups (`ms`, `s`, `m`, `h`) or a bare
/// integer, which is taken as seconds. Anything above [`MAX`] is rejected.
pub fn parse(input: &str) -> Result<Duration, ConfigError> {
    parse_unbounded(input).and_then(|d| bounded(d, input))
}

fn bounded(duration: Duration, input: &str) -> Result<Duration, ConfigError> {
    if duration > MAX {
        return Err(ConfigError::InvalidDuration {
            value: input.to_owned(),
        });
    }
    Ok(duration)
}

fn parse_unbounded(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        value: input.to_owned(),
    };

    let text = input.trim();
    if text.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        let part = unit
            .checked_mul(u32::try_from(amount).map_err(|_| invalid())?)
            .ok_or_else(invalid)?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }
    Ok(total)
}

/// Format a duration in the shortest form [`parse`] reads back.
pub fn format(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_owned();
    }
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, ConfigError> {
        match self {
            RawDuration::Seconds(secs) => bounded(Duration::from_secs(secs), &secs.to_string()),
            RawDuration::Text(text) => parse(&text),
        }
    }
}

/// `#[serde(with = "tether_core::duration::serde_duration")]`
pub mod serde_duration {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

/// Optional variant of [`serde_duration`].
pub mod serde_opt_duration {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&format(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(RawDuration::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
