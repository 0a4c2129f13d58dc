//! Minimal parsing and ordering for tor version strings.
//!
//! The session needs just enough of tor's version-spec to decide whether
//! the connected tor is new enough for a handful of defaulted features;
//! richer version handling belongs to a dedicated helper, not here.

use std::fmt;
use std::str::FromStr;

/// The version of a tor daemon, as reported by `GETINFO version`.
///
/// Versions order by their four numeric components; a missing fourth
/// component counts as zero.  Status tags (the `-alpha` in `0.2.2.1-alpha`)
/// only break ties, with an untagged version sorting before any tagged
/// one.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct TorVersion {
    /// The major version number.
    major: u32,
    /// The minor version number.
    minor: u32,
    /// The micro version number.
    micro: u32,
    /// The patch level; zero when the version string omits it.
    patch: u32,
    /// The status tag, without its leading dash.
    status_tag: Option<String>,
}

/// A string did not parse as a tor version.
#[derive(Clone, Debug, thiserror::Error)]
#[error("Invalid tor version: {0:?}")]
#[non_exhaustive]
pub struct InvalidVersion(
    /// The string that would not parse.
    pub String,
);

impl TorVersion {
    /// Construct an untagged version from its numeric components.
    pub const fn new(major: u32, minor: u32, micro: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            micro,
            patch,
            status_tag: None,
        }
    }

    /// Return this version's status tag, if it has one.
    pub fn status_tag(&self) -> Option<&str> {
        self.status_tag.as_deref()
    }
}

impl FromStr for TorVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersion(s.to_owned());

        // Tor appends a build note like " (git-73ff13ab3cc9570d)"; only the
        // first word is the version proper.
        let word = s.split_whitespace().next().ok_or_else(invalid)?;
        let (numbers, tag) = match word.split_once('-') {
            Some((numbers, tag)) if !tag.is_empty() => (numbers, Some(tag.to_owned())),
            Some(_) => return Err(invalid()),
            None => (word, None),
        };

        let mut parts = numbers.split('.');
        let mut next_number = || -> Result<u32, InvalidVersion> {
            parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())
        };
        let major = next_number()?;
        let minor = next_number()?;
        let micro = next_number()?;
        let patch = match parts.next() {
            Some(part) => part.parse().map_err(|_| invalid())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(TorVersion {
            major,
            minor,
            micro,
            patch,
            status_tag: tag,
        })
    }
}

impl fmt::Display for TorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.micro, self.patch)?;
        if let Some(tag) = &self.status_tag {
            write!(f, "-{tag}")?;
        }
        Ok(())
    }
}
