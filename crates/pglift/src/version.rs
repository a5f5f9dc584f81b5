use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Major versions this tool knows how to drive.
pub const SUPPORTED_VERSIONS: &[u16] = &[18, 17, 16, 15, 14, 13, 12, 11];

/// A PostgreSQL major version, e.g. `15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u16);

impl Version {
    pub fn new(major: u16) -> Result<Self, Error> {
        if SUPPORTED_VERSIONS.contains(&major) {
            Ok(Self(major))
        } else {
            Err(Error::InvalidVersion(format!(
                "unsupported PostgreSQL version {}",
                major
            )))
        }
    }

    pub fn major(&self) -> u16 {
        self.0
    }

    /// Every supported version, newest first.
    pub fn all() -> impl Iterator<Item = Version> {
        SUPPORTED_VERSIONS.iter().map(|v| Version(*v))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let major: u16 = s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidVersion(format!("invalid PostgreSQL version '{}'", s)))?;
        Version::new(major)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u16),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(major) => Version::new(major).map_err(serde::de::Error::custom),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
