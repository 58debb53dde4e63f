//! Server revision detection.
//!
//! A [`RevisionTag`] names one internal build of the host server. Builds
//! whose internal message layouts differ get different tags; the feature
//! registry uses the tag to pick the matching implementation of every
//! revision-sensitive capability.
//!
//! [`VersionResolver`] turns the host's self-reported [`BuildIdentity`]
//! into a tag once and memoizes it. Resolution never guesses: an
//! unrecognised build fails with [`RevisionError::Unrecognized`] so that no
//! mismatched implementation is ever loaded.

use crate::error::RevisionError;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Identifier for one internal server revision, e.g. `v1_20_R3`.
///
/// Ordering is lexicographic over `(major, minor, revision, sub_release)`
/// with a missing sub-release sorting before any present one, so
/// `v1_17_R1 < v1_17_R1_1 < v1_18_R2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionTag {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
    /// Distinguishes releases that share one structural revision.
    pub sub_release: Option<u16>,
}

impl RevisionTag {
    pub const fn new(major: u16, minor: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            revision,
            sub_release: None,
        }
    }

    pub const fn with_sub_release(self, sub_release: u16) -> Self {
        Self {
            sub_release: Some(sub_release),
            ..self
        }
    }

    /// The structural revision this tag belongs to, without a sub-release.
    pub const fn structural(self) -> Self {
        Self {
            sub_release: None,
            ..self
        }
    }

    /// Three-way comparison against `other`.
    pub fn compare(&self, other: &RevisionTag) -> RevisionOrder {
        compare(self, other)
    }

    /// True when this tag is `other` or newer.
    pub fn is_at_least(&self, other: RevisionTag) -> bool {
        *self >= other
    }

    /// True when this tag is strictly older than `other`.
    pub fn is_older_than(&self, other: RevisionTag) -> bool {
        *self < other
    }
}

impl fmt::Display for RevisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}_{}_R{}", self.major, self.minor, self.revision)?;
        if let Some(sub) = self.sub_release {
            write!(f, "_{}", sub)?;
        }
        Ok(())
    }
}

/// Error returned when a string is not of the form `vX_Y_RZ[_S]`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Not a revision tag: {0}")]
pub struct ParseRevisionError(pub String);

impl FromStr for RevisionTag {
    type Err = ParseRevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRevisionError(s.to_string());
        let body = s.strip_prefix('v').ok_or_else(err)?;
        let mut parts = body.split('_');

        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let revision = parts
            .next()
            .and_then(|p| p.strip_prefix('R'))
            .and_then(|p| p.parse().ok())
            .ok_or_else(err)?;
        let sub_release = match parts.next() {
            Some(p) => Some(p.parse().map_err(|_| err())?),
            None => None,
        };
        if parts.next().is_some() {
            return Err(err());
        }

        Ok(Self {
            major,
            minor,
            revision,
            sub_release,
        })
    }
}

/// Result of comparing two revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionOrder {
    Older,
    Same,
    Newer,
}

/// Compares `a` against `b`: `Older` means `a` predates `b`.
pub fn compare(a: &RevisionTag, b: &RevisionTag) -> RevisionOrder {
    match a.cmp(b) {
        Ordering::Less => RevisionOrder::Older,
        Ordering::Equal => RevisionOrder::Same,
        Ordering::Greater => RevisionOrder::Newer,
    }
}

// ============================================================================
// Known revisions
// ============================================================================

pub const V1_8_R3: RevisionTag = RevisionTag::new(1, 8, 3);
pub const V1_12_R1: RevisionTag = RevisionTag::new(1, 12, 1);
pub const V1_16_R3: RevisionTag = RevisionTag::new(1, 16, 3);
pub const V1_17_R1: RevisionTag = RevisionTag::new(1, 17, 1);
pub const V1_17_R1_1: RevisionTag = V1_17_R1.with_sub_release(1);
pub const V1_18_R2: RevisionTag = RevisionTag::new(1, 18, 2);
pub const V1_19_R1: RevisionTag = RevisionTag::new(1, 19, 1);
pub const V1_19_R2: RevisionTag = RevisionTag::new(1, 19, 2);
pub const V1_19_R3: RevisionTag = RevisionTag::new(1, 19, 3);
pub const V1_20_R1: RevisionTag = RevisionTag::new(1, 20, 1);
pub const V1_20_R2: RevisionTag = RevisionTag::new(1, 20, 2);
pub const V1_20_R3: RevisionTag = RevisionTag::new(1, 20, 3);
pub const V1_20_R4: RevisionTag = RevisionTag::new(1, 20, 4);
pub const V1_21_R1: RevisionTag = RevisionTag::new(1, 21, 1);
pub const V1_21_R2: RevisionTag = RevisionTag::new(1, 21, 2);
pub const V1_21_R3: RevisionTag = RevisionTag::new(1, 21, 3);

/// Every revision the built-in variants are written for, oldest first.
pub const KNOWN_REVISIONS: &[RevisionTag] = &[
    V1_8_R3, V1_12_R1, V1_16_R3, V1_17_R1, V1_17_R1_1, V1_18_R2, V1_19_R1, V1_19_R2, V1_19_R3,
    V1_20_R1, V1_20_R2, V1_20_R3, V1_20_R4, V1_21_R1, V1_21_R2, V1_21_R3,
];

/// Release string to revision, for releases with their own structural revision.
const RELEASES: &[(&str, RevisionTag)] = &[
    ("1.8.8", V1_8_R3),
    ("1.12.2", V1_12_R1),
    ("1.16.4", V1_16_R3),
    ("1.16.5", V1_16_R3),
    ("1.17", V1_17_R1),
    ("1.18.2", V1_18_R2),
    ("1.19", V1_19_R1),
    ("1.19.1", V1_19_R1),
    ("1.19.2", V1_19_R1),
    ("1.19.3", V1_19_R2),
    ("1.19.4", V1_19_R3),
    ("1.20", V1_20_R1),
    ("1.20.1", V1_20_R1),
    ("1.20.2", V1_20_R2),
    ("1.20.3", V1_20_R3),
    ("1.20.4", V1_20_R3),
    ("1.20.5", V1_20_R4),
    ("1.20.6", V1_20_R4),
    ("1.21", V1_21_R1),
    ("1.21.1", V1_21_R1),
    ("1.21.2", V1_21_R2),
    ("1.21.3", V1_21_R2),
    ("1.21.4", V1_21_R3),
];

/// Releases that share a structural revision with a sibling but need
/// different feature implementations.
const OVERRIDES: &[(&str, RevisionTag)] = &[("1.17.1", V1_17_R1_1)];

// ============================================================================
// Resolution
// ============================================================================

/// What the host server reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIdentity {
    /// Self-reported build string, e.g. `git-Paper-196 (MC: 1.20.4)`.
    pub version: String,
    /// Package of the server's internal implementation classes, when the
    /// host exposes one, e.g. `org.bukkit.craftbukkit.v1_20_R3`.
    pub implementation_package: Option<String>,
}

impl BuildIdentity {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            implementation_package: None,
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.implementation_package = Some(package.into());
        self
    }
}

/// Resolves the running server's revision once per process.
///
/// The resolver owns its lookup tables so hosts can extend them before the
/// first call to [`resolve`](VersionResolver::resolve). After that call the
/// result is fixed for the lifetime of the resolver.
#[derive(Debug)]
pub struct VersionResolver {
    identity: BuildIdentity,
    known: Vec<RevisionTag>,
    releases: HashMap<String, RevisionTag>,
    overrides: HashMap<String, RevisionTag>,
    resolved: OnceCell<RevisionTag>,
}

impl VersionResolver {
    /// Creates a resolver with the built-in tables.
    pub fn new(identity: BuildIdentity) -> Self {
        Self {
            identity,
            known: KNOWN_REVISIONS.to_vec(),
            releases: RELEASES
                .iter()
                .map(|(release, tag)| (release.to_string(), *tag))
                .collect(),
            overrides: OVERRIDES
                .iter()
                .map(|(release, tag)| (release.to_string(), *tag))
                .collect(),
            resolved: OnceCell::new(),
        }
    }

    /// Adds or replaces a mapping keyed by release or by full build string.
    pub fn with_release(mut self, release: impl Into<String>, tag: RevisionTag) -> Self {
        self.learn(tag);
        self.releases.insert(release.into(), tag);
        self
    }

    /// Adds or replaces an override keyed by release or by full build string.
    pub fn with_override(mut self, release: impl Into<String>, tag: RevisionTag) -> Self {
        self.learn(tag);
        self.overrides.insert(release.into(), tag);
        self
    }

    fn learn(&mut self, tag: RevisionTag) {
        if let Err(pos) = self.known.binary_search(&tag) {
            self.known.insert(pos, tag);
        }
    }

    /// The identity this resolver was created with.
    pub fn identity(&self) -> &BuildIdentity {
        &self.identity
    }

    /// Known revisions, oldest first.
    pub fn known_revisions(&self) -> &[RevisionTag] {
        &self.known
    }

    /// Returns the running revision, resolving it on the first call.
    ///
    /// Safe to call from any thread; every successful call returns the same
    /// tag. A failed resolution is not cached, but it is also deterministic,
    /// so repeating it yields the same error.
    ///
    /// # Errors
    ///
    /// [`RevisionError::Unrecognized`] when neither the build string nor the
    /// implementation package identifies a known revision.
    pub fn resolve(&self) -> Result<RevisionTag, RevisionError> {
        self.resolved
            .get_or_try_init(|| {
                let tag = self.detect()?;
                info!(
                    "🧭 Resolved server revision {} from build '{}'",
                    tag, self.identity.version
                );
                Ok(tag)
            })
            .copied()
    }

    /// The resolved revision, if [`resolve`](Self::resolve) already succeeded.
    pub fn get(&self) -> Option<RevisionTag> {
        self.resolved.get().copied()
    }

    fn detect(&self) -> Result<RevisionTag, RevisionError> {
        let build = self.identity.version.as_str();
        if let Some(tag) = self.overrides.get(build) {
            debug!("Build '{}' matched override table -> {}", build, tag);
            return Ok(*tag);
        }
        if let Some(tag) = self.releases.get(build) {
            debug!("Build '{}' matched release table -> {}", build, tag);
            return Ok(*tag);
        }

        if let Some(release) = release_of(build) {
            if let Some(tag) = self.overrides.get(release) {
                debug!("Release {} matched override table -> {}", release, tag);
                return Ok(*tag);
            }
            if let Some(tag) = self.releases.get(release) {
                debug!("Release {} matched release table -> {}", release, tag);
                return Ok(*tag);
            }
        }

        if let Some(tag) = self
            .identity
            .implementation_package
            .as_deref()
            .and_then(structural_of)
        {
            if self.known.binary_search(&tag).is_ok() {
                debug!("Implementation package matched structural revision {}", tag);
                return Ok(tag);
            }
        }

        Err(RevisionError::Unrecognized {
            build: self.identity.version.clone(),
        })
    }
}

/// Extracts the release part of a build string.
///
/// Handles `git-Paper-196 (MC: 1.20.4)` and `1.20.4-R0.1-SNAPSHOT`. Returns
/// `None` when no dotted numeric release can be found.
pub fn release_of(build: &str) -> Option<&str> {
    let candidate = match build.find("(MC: ") {
        Some(start) => {
            let rest = &build[start + 5..];
            &rest[..rest.find(')')?]
        }
        None => build
            .split(|c: char| c == '-' || c.is_whitespace())
            .next()?,
    };
    let candidate = candidate.trim();

    let well_formed = !candidate.is_empty()
        && candidate.contains('.')
        && candidate
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    well_formed.then_some(candidate)
}

/// Extracts a structural revision from an implementation package name.
///
/// The last dotted segment that parses as a tag wins.
pub fn structural_of(package: &str) -> Option<RevisionTag> {
    package
        .rsplit('.')
        .find_map(|segment| segment.parse::<RevisionTag>().ok())
}
