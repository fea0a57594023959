//! Rate policy expressions and TTL values.
//!
//! Policies are written as `"N/period"`:
//!
//! ```text
//! "100/hour"   100 requests per hour
//! "20/minute"  20 requests per minute
//! "5/second"   5 requests per second
//! "1000/day"   1000 requests per day
//! ```
//!
//! TTLs are integer seconds or a number with a unit suffix (`"30s"`, `"30m"`,
//! `"24h"`, `"7d"`, `"1.5h"`). Both parse eagerly so that a malformed value
//! fails when configuration is loaded rather than on the first request.

use crate::error::ConfigError;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// RATE UNIT
// ============================================================================

/// The period a rate policy is measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl RateUnit {
    /// Length of the period in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            RateUnit::Second => 1,
            RateUnit::Minute => 60,
            RateUnit::Hour => 3600,
            RateUnit::Day => 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateUnit::Second => "second",
            RateUnit::Minute => "minute",
            RateUnit::Hour => "hour",
            RateUnit::Day => "day",
        }
    }
}

impl fmt::Display for RateUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "second" => Ok(RateUnit::Second),
            "minute" => Ok(RateUnit::Minute),
            "hour" => Ok(RateUnit::Hour),
            "day" => Ok(RateUnit::Day),
            other => Err(ConfigError::InvalidRatePolicy {
                expression: s.to_string(),
                reason: format!("unknown unit '{}'", other),
            }),
        }
    }
}

// ============================================================================
// RATE POLICY
// ============================================================================

/// A parsed `N/period` quota. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RatePolicy {
    limit: u32,
    unit: RateUnit,
}

impl RatePolicy {
    /// Build a policy directly. `limit` must be positive.
    pub fn new(limit: u32, unit: RateUnit) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidRatePolicy {
                expression: format!("{}/{}", limit, unit),
                reason: "limit must be a positive integer".to_string(),
            });
        }
        Ok(Self { limit, unit })
    }

    /// Parse `"<positive-integer>/<second|minute|hour|day>"`.
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRatePolicy {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = expression.split('/');
        let (count, period) = match (parts.next(), parts.next(), parts.next()) {
            (Some(count), Some(period), None) => (count.trim(), period.trim()),
            _ => return Err(invalid("expected exactly one '/'")),
        };

        if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("limit must be a positive integer"));
        }
        let limit: u32 = count
            .parse()
            .map_err(|_| invalid("limit is out of range"))?;
        if limit == 0 {
            return Err(invalid("limit must be a positive integer"));
        }

        let unit = RateUnit::from_str(period).map_err(|_| {
            invalid(&format!("unknown unit '{}'", period.to_lowercase()))
        })?;

        Ok(Self { limit, unit })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn unit(&self) -> RateUnit {
        self.unit
    }

    pub fn window_secs(&self) -> u64 {
        self.unit.seconds()
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs())
    }
}

impl fmt::Display for RatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.limit, self.unit)
    }
}

impl FromStr for RatePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RatePolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RatePolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let expression = String::deserialize(deserializer)?;
        RatePolicy::parse(&expression).map_err(de::Error::custom)
    }
}

// ============================================================================
// TTL
// ============================================================================

/// Parse a TTL string: integer seconds or `<number><s|m|h|d>`.
pub fn parse_ttl(value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTtl {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let s = value.trim().to_lowercase();
    if s.is_empty() {
        return Err(invalid("empty value"));
    }

    let (number, factor) = match s.char_indices().last() {
        Some((idx, 's')) => (&s[..idx], 1u64),
        Some((idx, 'm')) => (&s[..idx], 60),
        Some((idx, 'h')) => (&s[..idx], 3600),
        Some((idx, 'd')) => (&s[..idx], 86_400),
        _ => (s.as_str(), 1),
    };

    let number = number.trim();
    let secs = if let Ok(whole) = number.parse::<u64>() {
        whole
            .checked_mul(factor)
            .ok_or_else(|| invalid("value is too large"))?
    } else {
        let fractional: f64 = number
            .parse()
            .map_err(|_| invalid("expected integer seconds or a number with s/m/h/d suffix"))?;
        if !fractional.is_finite() || fractional < 0.0 {
            return Err(invalid("must be a positive duration"));
        }
        let secs = fractional * factor as f64;
        if secs >= u64::MAX as f64 {
            return Err(invalid("value is too large"));
        }
        secs as u64
    };

    if secs == 0 {
        return Err(invalid("must be at least one second"));
    }
    Ok(Duration::from_secs(secs))
}

/// A positive TTL, deserialized from integer seconds or a duration string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ttl(pub(crate) Duration);

impl Ttl {
    pub fn from_secs(secs: u64) -> Result<Self, ConfigError> {
        if secs == 0 {
            return Err(ConfigError::InvalidTtl {
                value: "0".to_string(),
                reason: "must be at least one second".to_string(),
            });
        }
        Ok(Self(Duration::from_secs(secs)))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

impl FromStr for Ttl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_ttl(s).map(Ttl)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0.as_secs())
    }
}

impl From<Ttl> for Duration {
    fn from(ttl: Ttl) -> Self {
        ttl.0
    }
}

impl Serialize for Ttl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0.as_secs())
    }
}

impl<'de> Deserialize<'de> for Ttl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ttl::from_secs(secs).map_err(de::Error::custom),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
