use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An opaque consistency token. Revisions are totally ordered; reads at a
/// later revision observe a superset of the writes visible at an earlier
/// one. The current backend encodes revisions as decimal integers, but
/// consumers only rely on comparison.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// The revision before any write.
    pub const ZERO: Revision = Revision(0);

    pub fn new(value: u64) -> Self {
        Revision(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(Revision)
            .map_err(|_| ModelError::MalformedRevision(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Revision::new(1) < Revision::new(2));
        assert_eq!(Revision::ZERO.next(), Revision::new(1));
    }

    #[test]
    fn test_parse_round_trip() {
        let rev: Revision = "42".parse().unwrap();
        assert_eq!(rev.to_string(), "42");
        assert!("not-a-revision".parse::<Revision>().is_err());
    }
}
