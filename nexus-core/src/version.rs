//! Host version tags and binding patterns
//!
//! The host reports its release as a string such as `1.21.10` or
//! `1.21.10-R0.1-SNAPSHOT`. [`HostVersionTag`] is the parsed, totally ordered
//! form. [`VersionPattern`] is what an adapter binding matches against; every
//! pattern reduces to a half-open interval of tags so matching and overlap
//! checks share one code path.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parsed host release identifier.
///
/// Missing components default to 0 (`1.21` == `1.21.0`). Build suffixes after
/// the first `-` are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostVersionTag {
    major: u32,
    minor: u32,
    patch: u32,
}

impl HostVersionTag {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn patch(&self) -> u32 {
        self.patch
    }

    /// The smallest tag strictly greater than this one, carrying into minor
    /// and major. `None` for the greatest representable tag.
    fn successor(&self) -> Option<Self> {
        if let Some(patch) = self.patch.checked_add(1) {
            return Some(Self::new(self.major, self.minor, patch));
        }
        if let Some(minor) = self.minor.checked_add(1) {
            return Some(Self::new(self.major, minor, 0));
        }
        self.major.checked_add(1).map(|major| Self::new(major, 0, 0))
    }
}

impl fmt::Display for HostVersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for HostVersionTag {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidVersion {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let core = raw.trim().split('-').next().unwrap_or_default();
        if core.is_empty() {
            return Err(invalid("empty version"));
        }

        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in core.split('.') {
            if count == parts.len() {
                return Err(invalid("more than three components"));
            }
            parts[count] = piece
                .parse::<u32>()
                .map_err(|_| invalid("components must be unsigned integers"))?;
            count += 1;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl TryFrom<String> for HostVersionTag {
    type Error = ValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<HostVersionTag> for String {
    fn from(tag: HostVersionTag) -> Self {
        tag.to_string()
    }
}

// ============================================================================
// PATTERNS
// ============================================================================

/// A set of host versions an adapter binding applies to.
///
/// String forms:
/// - `1.21.10`: exactly that release
/// - `1.21.*`: every patch of 1.21
/// - `1.21.8..=1.21.9`: inclusive range
/// - `1.21.8..1.21.10`: upper bound excluded
/// - `1.21.11..`: that release and everything newer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionPattern {
    Exact(HostVersionTag),
    Minor { major: u32, minor: u32 },
    Range {
        min: HostVersionTag,
        max: HostVersionTag,
        inclusive: bool,
    },
    AtLeast(HostVersionTag),
}

impl VersionPattern {
    /// Half-open interval `[low, high)`; `None` high means unbounded.
    fn bounds(&self) -> (HostVersionTag, Option<HostVersionTag>) {
        match self {
            VersionPattern::Exact(tag) => (*tag, tag.successor()),
            VersionPattern::Minor { major, minor } => (
                HostVersionTag::new(*major, *minor, 0),
                HostVersionTag::new(*major, *minor, u32::MAX).successor(),
            ),
            VersionPattern::Range {
                min,
                max,
                inclusive,
            } => {
                let high = if *inclusive { max.successor() } else { Some(*max) };
                (*min, high)
            }
            VersionPattern::AtLeast(min) => (*min, None),
        }
    }

    pub fn matches(&self, tag: &HostVersionTag) -> bool {
        let (low, high) = self.bounds();
        *tag >= low && high.map_or(true, |h| *tag < h)
    }

    /// Whether some tag would match both patterns.
    pub fn overlaps(&self, other: &VersionPattern) -> bool {
        let (a_low, a_high) = self.bounds();
        let (b_low, b_high) = other.bounds();
        let a_before_b = a_high.is_some_and(|h| h <= b_low);
        let b_before_a = b_high.is_some_and(|h| h <= a_low);
        !(a_before_b || b_before_a || self.is_empty() || other.is_empty())
    }

    fn is_empty(&self) -> bool {
        let (low, high) = self.bounds();
        high.is_some_and(|h| h <= low)
    }
}

impl fmt::Display for VersionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPattern::Exact(tag) => write!(f, "{}", tag),
            VersionPattern::Minor { major, minor } => write!(f, "{}.{}.*", major, minor),
            VersionPattern::Range {
                min,
                max,
                inclusive: true,
            } => write!(f, "{}..={}", min, max),
            VersionPattern::Range { min, max, .. } => write!(f, "{}..{}", min, max),
            VersionPattern::AtLeast(min) => write!(f, "{}..", min),
        }
    }
}

impl FromStr for VersionPattern {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ValidationError::InvalidPattern {
            raw: raw.to_string(),
            reason,
        };
        let trimmed = raw.trim();

        if let Some((min, max)) = trimmed.split_once("..=") {
            let min: HostVersionTag = min.parse().map_err(|e| invalid(format!("{}", e)))?;
            let max: HostVersionTag = max.parse().map_err(|e| invalid(format!("{}", e)))?;
            if max < min {
                return Err(invalid("upper bound below lower bound".to_string()));
            }
            return Ok(VersionPattern::Range {
                min,
                max,
                inclusive: true,
            });
        }

        if let Some((min, max)) = trimmed.split_once("..") {
            let min: HostVersionTag = min.parse().map_err(|e| invalid(format!("{}", e)))?;
            if max.trim().is_empty() {
                return Ok(VersionPattern::AtLeast(min));
            }
            let max: HostVersionTag = max.parse().map_err(|e| invalid(format!("{}", e)))?;
            if max <= min {
                return Err(invalid("exclusive range is empty".to_string()));
            }
            return Ok(VersionPattern::Range {
                min,
                max,
                inclusive: false,
            });
        }

        if let Some(prefix) = trimmed.strip_suffix(".*") {
            let (major, minor) = prefix
                .split_once('.')
                .ok_or_else(|| invalid("wildcard needs major.minor.*".to_string()))?;
            let major = major
                .parse()
                .map_err(|_| invalid("major must be an unsigned integer".to_string()))?;
            let minor = minor
                .parse()
                .map_err(|_| invalid("minor must be an unsigned integer".to_string()))?;
            return Ok(VersionPattern::Minor { major, minor });
        }

        trimmed
            .parse()
            .map(VersionPattern::Exact)
            .map_err(|e| invalid(format!("{}", e)))
    }
}

impl TryFrom<String> for VersionPattern {
    type Error = ValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<VersionPattern> for String {
    fn from(pattern: VersionPattern) -> Self {
        pattern.to_string()
    }
}

// =============================================================================
// TESTS
// =============================================================================
