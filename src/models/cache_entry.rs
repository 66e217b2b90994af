use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Read back from the ledger.
    Authoritative,
    /// Applied locally ahead of confirmation; never settlement truth.
    Optimistic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub written_at: DateTime<Utc>,
    pub provenance: Provenance,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, provenance: Provenance, ttl: Duration, written_at: DateTime<Utc>) -> Self {
        Self {
            value,
            written_at,
            provenance,
            ttl,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.written_at + self.ttl
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.written_at > self.ttl
    }

    pub fn is_authoritative(&self) -> bool {
        self.provenance == Provenance::Authoritative
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            value: f(self.value),
            written_at: self.written_at,
            provenance: self.provenance,
            ttl: self.ttl,
        }
    }
}

pub(crate) mod duration_ms {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        i64::deserialize(d).map(Duration::milliseconds)
    }
}
