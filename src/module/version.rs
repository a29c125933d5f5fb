//! Interface and module versions.
//!
//! A [`Version`] is `MAJOR[.MINOR[.PATCH]][-PRE][+META]`. Minor and patch may be
//! left unspecified, which matters for compatibility checks: a required `3.4`
//! accepts any patch level of `3.4` or later minors. A [`VersionRange`] is a
//! space separated list of alternatives, any one of which may be satisfied.

use std::{cmp::Ordering, fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::core::GatewayError;

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:-([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?(?:\+(.+))?$",
    )
    .unwrap()
});

/// Parsed semantic-like version.
#[derive(Clone, Debug, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct Version {
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    pre_release: Vec<String>,
    build: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: Option<u64>, patch: Option<u64>) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: Vec::new(),
            build: None,
        }
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> Option<u64> {
        self.minor
    }

    pub fn patch(&self) -> Option<u64> {
        self.patch
    }

    pub fn pre_release(&self) -> &[String] {
        &self.pre_release
    }

    /// Build metadata, kept for display only.
    pub fn build(&self) -> Option<&str> {
        self.build.as_deref()
    }

    /// Compares two versions, returning a signed magnitude.
    ///
    /// The sign tells the ordering. The magnitude tells where the versions first
    /// differ: 2 for major, 3 for minor, 4 for patch and 5 for pre-release.
    /// Build metadata is ignored.
    pub fn compare(&self, other: &Version) -> i32 {
        if self.major != other.major {
            return signed(self.major.cmp(&other.major), 2);
        }
        if self.minor != other.minor {
            return signed(self.minor.cmp(&other.minor), 3);
        }
        if self.patch != other.patch {
            return signed(self.patch.cmp(&other.patch), 4);
        }
        signed(compare_pre_release(&self.pre_release, &other.pre_release), 5)
    }

    /// Whether this provided version satisfies a single required version.
    ///
    /// Majors must be equal, the provided minor must be at least the required one,
    /// and when minors are equal a specified required patch must not exceed the
    /// provided patch.
    pub fn satisfies(&self, required: &Version) -> bool {
        if self.major != required.major {
            return false;
        }
        if self.minor < required.minor {
            return false;
        }
        if self.minor == required.minor && required.patch.is_some() {
            return self.patch >= required.patch;
        }
        true
    }
}

fn signed(ordering: Ordering, magnitude: i32) -> i32 {
    match ordering {
        Ordering::Less => -magnitude,
        Ordering::Equal => 0,
        Ordering::Greater => magnitude,
    }
}

fn compare_pre_release(a: &[String], b: &[String]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        // a release is newer than any of its pre-releases
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }

    for (x, y) in a.iter().zip(b.iter()) {
        let ordering = compare_identifier(x, y);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

fn compare_identifier(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Compares two versions, see [`Version::compare`].
pub fn compare_versions(a: &Version, b: &Version) -> i32 {
    a.compare(b)
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == 0
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other).cmp(&0)
    }
}

impl FromStr for Version {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = VERSION_RE
            .captures(s)
            .ok_or_else(|| GatewayError::Decode(format!("Bad version: {s}")))?;

        let number = |idx: usize| -> Result<Option<u64>, GatewayError> {
            caps.get(idx)
                .map(|m| {
                    m.as_str()
                        .parse::<u64>()
                        .map_err(|_| GatewayError::Decode(format!("Bad version: {s}")))
                })
                .transpose()
        };

        let major = number(1)?.unwrap_or_default();
        let minor = number(2)?;
        let patch = number(3)?;
        let pre_release = caps
            .get(4)
            .map(|m| m.as_str().split('.').map(str::to_string).collect())
            .unwrap_or_default();
        let build = caps.get(5).map(|m| m.as_str().to_string());

        Ok(Self {
            major,
            minor,
            patch,
            pre_release,
            build,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
        }
        if let Some(patch) = self.patch {
            write!(f, ".{patch}")?;
        }
        if !self.pre_release.is_empty() {
            write!(f, "-{}", self.pre_release.join("."))?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

/// Space separated list of alternative versions.
#[derive(Clone, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct VersionRange {
    alternatives: Vec<Version>,
}

impl VersionRange {
    pub fn alternatives(&self) -> &[Version] {
        &self.alternatives
    }

    /// The single version of a provided interface.
    pub fn single(&self) -> Option<&Version> {
        match self.alternatives.as_slice() {
            [version] => Some(version),
            _ => None,
        }
    }

    pub fn is_satisfied_by(&self, provided: &Version) -> bool {
        self.alternatives.iter().any(|req| provided.satisfies(req))
    }
}

impl From<Version> for VersionRange {
    fn from(version: Version) -> Self {
        Self {
            alternatives: vec![version],
        }
    }
}

impl FromStr for VersionRange {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let alternatives = s
            .split_whitespace()
            .map(Version::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        if alternatives.is_empty() {
            return Err(GatewayError::Decode("Empty version".to_string()));
        }
        Ok(Self { alternatives })
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.alternatives.iter().map(|v| v.to_string()).collect();
        write!(f, "{}", parts.join(" "))
    }
}
