//! Protocol version negotiation (`current:revision:age`)

use coinage_core::PROTOCOL_VERSION;

use crate::error::{ProtocolError, Result};

/// Parsed libtool-style version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub current: u32,
    pub revision: u32,
    pub age: u32,
}

impl ProtocolVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(ProtocolError::Malformed(format!("bad version '{}'", s)));
        }
        let num = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| ProtocolError::Malformed(format!("bad version '{}'", s)))
        };
        let version = Self {
            current: num(parts[0])?,
            revision: num(parts[1])?,
            age: num(parts[2])?,
        };
        if version.age > version.current {
            return Err(ProtocolError::Malformed(format!(
                "version age exceeds current in '{}'",
                s
            )));
        }
        Ok(version)
    }

    pub fn local() -> Self {
        // PROTOCOL_VERSION is a well-formed constant
        Self::parse(PROTOCOL_VERSION).unwrap_or(Self {
            current: 9,
            revision: 0,
            age: 0,
        })
    }
}

/// Result of comparing the exchange's version with ours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCompat {
    /// Same interface
    Match,
    /// Exchange is newer but still implements our interface
    ExchangeNewer,
    /// Exchange is older than anything we speak
    ExchangeOlder,
    /// Exchange is newer and dropped our interface
    Incompatible,
}

impl VersionCompat {
    pub fn is_compatible(self) -> bool {
        matches!(self, VersionCompat::Match | VersionCompat::ExchangeNewer)
    }
}

/// Compare a remote version string with the local one
pub fn check_version(remote: &str) -> Result<VersionCompat> {
    let remote = ProtocolVersion::parse(remote)?;
    let local = ProtocolVersion::local();
    Ok(compare(&local, &remote))
}

fn compare(local: &ProtocolVersion, remote: &ProtocolVersion) -> VersionCompat {
    if remote.current == local.current {
        VersionCompat::Match
    } else if remote.current > local.current {
        if remote.current - remote.age <= local.current {
            VersionCompat::ExchangeNewer
        } else {
            VersionCompat::Incompatible
        }
    } else if local.current - local.age <= remote.current {
        VersionCompat::Match
    } else {
        VersionCompat::ExchangeOlder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes() {
        assert_eq!(check_version("9:0:0").unwrap(), VersionCompat::Match);
        assert_eq!(check_version("9:3:0").unwrap(), VersionCompat::Match);
        assert_eq!(check_version("10:0:1").unwrap(), VersionCompat::ExchangeNewer);
        assert_eq!(check_version("11:0:1").unwrap(), VersionCompat::Incompatible);
        assert_eq!(check_version("8:0:0").unwrap(), VersionCompat::ExchangeOlder);
        assert!(!VersionCompat::ExchangeOlder.is_compatible());
    }

    #[test]
    fn test_malformed_versions() {
        assert!(check_version("9:0").is_err());
        assert!(check_version("a:b:c").is_err());
        assert!(check_version("1:0:2").is_err());
    }
}
