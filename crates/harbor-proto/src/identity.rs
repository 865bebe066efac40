use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;
use thiserror::Error;

/// Relay-assigned identity of a connected endpoint.
///
/// Always positive. The relay hands them out sequentially starting at 1 and
/// never reissues one within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(NonZeroU64);

impl ClientId {
    pub const FIRST: ClientId = ClientId(NonZeroU64::MIN);

    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// The identity issued after this one, or `None` once the space is exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
#[error("invalid client id `{0}`")]
pub struct ParseClientIdError(String);

impl FromStr for ClientId {
    type Err = ParseClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .ok()
            .and_then(ClientId::new)
            .ok_or_else(|| ParseClientIdError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn zero_is_not_an_identity() {
        assert!(ClientId::new(0).is_none());
        assert_eq!(ClientId::new(7).map(ClientId::get), Some(7));
    }

    #[test_timeout::timeout]
    fn next_is_strictly_increasing() {
        let first = ClientId::FIRST;
        let second = first.next().expect("room for a second id");
        assert_eq!(first.get(), 1);
        assert!(second > first);
        assert!(ClientId::new(u64::MAX).and_then(ClientId::next).is_none());
    }

    #[test_timeout::timeout]
    fn serializes_as_bare_number() {
        let id = ClientId::new(42).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let parsed: ClientId = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, id);
        assert!(serde_json::from_str::<ClientId>("0").is_err());
    }

    #[test_timeout::timeout]
    fn parses_from_cli_text() {
        assert_eq!("3".parse::<ClientId>().unwrap().get(), 3);
        assert!("0".parse::<ClientId>().is_err());
        assert!("abc".parse::<ClientId>().is_err());
    }
}
