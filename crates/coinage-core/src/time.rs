//! Absolute and relative time at microsecond resolution
//!
//! JSON forms follow the exchange API: `{"t_us": n}` or `"never"` for
//! timestamps, `{"d_us": n}` or `"forever"` for durations.

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Point in time, microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The end of time
    pub const NEVER: Timestamp = Timestamp(u64::MAX);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(MICROS_PER_SECOND))
    }

    /// Current wall-clock time, truncated to whole microseconds
    pub fn now() -> Self {
        let micros = chrono::Utc::now().timestamp_micros();
        Self(u64::try_from(micros).unwrap_or(0))
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    pub fn is_never(&self) -> bool {
        self.0 == u64::MAX
    }

    /// Add a duration; anything involving "forever" or overflowing is `NEVER`
    pub fn saturating_add(&self, rel: RelativeTime) -> Timestamp {
        if self.is_never() || rel.is_forever() {
            return Timestamp::NEVER;
        }
        Timestamp(self.0.checked_add(rel.0).unwrap_or(u64::MAX))
    }

    /// Subtract a duration, clamping at the epoch
    pub fn saturating_sub(&self, rel: RelativeTime) -> Timestamp {
        if self.is_never() {
            return Timestamp::NEVER;
        }
        Timestamp(self.0.saturating_sub(rel.0))
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return f.write_str("never");
        }
        let secs = (self.0 / MICROS_PER_SECOND) as i64;
        let nanos = ((self.0 % MICROS_PER_SECOND) * 1000) as u32;
        match chrono::DateTime::from_timestamp(secs, nanos) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// Duration in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RelativeTime(u64);

impl RelativeTime {
    pub const FOREVER: RelativeTime = RelativeTime(u64::MAX);
    pub const ZERO: RelativeTime = RelativeTime(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(MICROS_PER_SECOND))
    }

    pub const fn from_hours(hours: u64) -> Self {
        Self::from_secs(hours.saturating_mul(3600))
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    pub fn is_forever(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_never() {
            return serializer.serialize_str("never");
        }
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("t_us", &self.0)?;
        map.end()
    }
}

impl Serialize for RelativeTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_forever() {
            return serializer.serialize_str("forever");
        }
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("d_us", &self.0)?;
        map.end()
    }
}

struct MicrosVisitor {
    key: &'static str,
    infinite: &'static str,
}

impl<'de> Visitor<'de> for MicrosVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{\"{}\": <u64>}} or \"{}\"", self.key, self.infinite)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        if v == self.infinite {
            Ok(u64::MAX)
        } else {
            Err(E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<u64, A::Error> {
        let mut micros = None;
        while let Some(key) = map.next_key::<String>()? {
            if key == self.key {
                micros = Some(map.next_value::<u64>()?);
            } else {
                return Err(de::Error::unknown_field(&key, &[]));
            }
        }
        micros.ok_or_else(|| de::Error::missing_field(self.key))
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer
            .deserialize_any(MicrosVisitor {
                key: "t_us",
                infinite: "never",
            })
            .map(Timestamp)
    }
}

impl<'de> Deserialize<'de> for RelativeTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer
            .deserialize_any(MicrosVisitor {
                key: "d_us",
                infinite: "forever",
            })
            .map(RelativeTime)
    }
}
