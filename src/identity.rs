//! Measurement stream identity
//!
//! An [`Identity`] names one logical measurement stream by `(source, id)`,
//! e.g. `PMU_BUS12:4`. Sources are case-normalized to upper case.
//!
//! A 64-bit xxHash of the pair is cached at construction and fed to
//! [`Hash`], so hash maps never rehash the source string. Equality and
//! ordering always compare the full `(source, id)` pair; two identities
//! whose hashes collide still compare unequal.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use xxhash_rust::xxh64::xxh64;

use crate::error::{ConcentratorError, Result};

/// Composite key of one measurement stream
#[derive(Clone)]
pub struct Identity {
    source: Arc<str>,
    id: u32,
    hash: u64,
}

impl Identity {
    /// Create an identity, normalizing the source to upper case
    ///
    /// # Errors
    ///
    /// Returns [`ConcentratorError::InvalidArgument`] if `source` is empty
    /// or only whitespace.
    pub fn new(id: u32, source: impl AsRef<str>) -> Result<Self> {
        let source = normalize(source.as_ref())?;
        let hash = placement_hash(&source, id);
        Ok(Self { source, id, hash })
    }

    /// Source name (upper case)
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Numeric id within the source
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Cached placement hash
    pub fn placement_hash(&self) -> u64 {
        self.hash
    }

    /// Replace the source name
    ///
    /// # Errors
    ///
    /// Returns [`ConcentratorError::InvalidArgument`] if `source` is empty;
    /// the identity is left untouched.
    pub fn set_source(&mut self, source: impl AsRef<str>) -> Result<()> {
        self.source = normalize(source.as_ref())?;
        self.hash = placement_hash(&self.source, self.id);
        Ok(())
    }

    /// Replace the numeric id
    pub fn set_id(&mut self, id: u32) {
        self.id = id;
        self.hash = placement_hash(&self.source, self.id);
    }
}

fn normalize(source: &str) -> Result<Arc<str>> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(ConcentratorError::InvalidArgument(
            "identity source cannot be empty".to_string(),
        ));
    }
    Ok(Arc::from(trimmed.to_uppercase()))
}

fn placement_hash(source: &str, id: u32) -> u64 {
    let mut bytes = Vec::with_capacity(source.len() + 4);
    bytes.extend_from_slice(source.as_bytes());
    bytes.extend_from_slice(&id.to_le_bytes());
    xxh64(&bytes, 0)
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.source == other.source
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.source
            .cmp(&other.source)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}:{})", self.source, self.id)
    }
}

impl FromStr for Identity {
    type Err = ConcentratorError;

    /// Parse `SOURCE:id`
    fn from_str(s: &str) -> Result<Self> {
        let (source, id) = s.rsplit_once(':').ok_or_else(|| {
            ConcentratorError::InvalidArgument(format!("'{}' is not in SOURCE:id form", s))
        })?;
        let id = id.trim().parse::<u32>().map_err(|e| {
            ConcentratorError::InvalidArgument(format!("invalid identity id in '{}': {}", s, e))
        })?;
        Identity::new(id, source)
    }
}
