//! Network-transportable errors with a hierarchical, dot-separated kind.
//!
//! An [`Error`] travels between the driver and the cluster as the string
//! `"kind---data"`. Handling logic dispatches on `kind` alone via prefix
//! matching, so `sy.query.not_found` matches the patterns `"sy"`,
//! `"sy.query"`, and itself, but never a longer pattern.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel kind carried by the nil (no-op) error.
pub const KIND_NIL: &str = "nil";
/// Kind assigned when an error cannot be classified.
pub const KIND_UNKNOWN: &str = "unknown";

/// Separator between kind and data in the wire form.
const WIRE_SEP: &str = "---";

// Well-known cluster error kinds.
pub const SY: &str = "sy";
pub const VALIDATION: &str = "sy.validation";
pub const QUERY: &str = "sy.query";
pub const NOT_FOUND: &str = "sy.query.not_found";
pub const MULTIPLE_RESULTS: &str = "sy.query.multiple_results";
pub const NOT_SUPPORTED: &str = "sy.not_supported";
pub const INTERNAL: &str = "sy.internal";
pub const UNEXPECTED: &str = "sy.unexpected";
pub const CONTROL: &str = "sy.control";
pub const UNAUTHORIZED: &str = "sy.control.unauthorized";

// Transport-level kinds surfaced by cluster clients.
pub const UNREACHABLE: &str = "freighter.unreachable";
pub const STREAM_CLOSED: &str = "freighter.stream_closed";
pub const EOF: &str = "freighter.eof";

// Driver-level kinds.
pub const CONFIGURATION: &str = "driver.configuration";
pub const CRITICAL_HARDWARE_ERROR: &str = "driver.hardware.critical";
/// Root of the canonical transient hardware error hierarchy. Pipelines match
/// this single prefix; integrations reparent their vendor conditions onto one
/// of the children below.
pub const TEMPORARY_HARDWARE_ERROR: &str = "driver.hardware.temporary";
pub const DEVICE_DISCONNECTED: &str = "driver.hardware.temporary.device_disconnected";
pub const DEVICE_UNREACHABLE: &str = "driver.hardware.temporary.unreachable";
pub const RESOURCE_NOT_AVAILABLE: &str = "driver.hardware.temporary.resource_not_available";
pub const STREAM_NOT_INITIALIZED: &str = "driver.hardware.temporary.stream_not_initialized";

/// A transportable error with a hierarchical kind and string-encoded data.
///
/// The data field is typically a human-readable message, but may carry a
/// serialized object. Equality and matching consider only the kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub kind: String,
    pub data: String,
}

impl Error {
    pub fn new(kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self { kind: kind.into(), data: data.into() }
    }

    /// The nil error, signalling the absence of a failure.
    pub fn nil() -> Self {
        Self { kind: KIND_NIL.to_string(), data: String::new() }
    }

    /// Parses an error from its wire form. If the string contains no
    /// `"---"` separator, the entire string is treated as the kind.
    pub fn parse(wire: &str) -> Self {
        match wire.find(WIRE_SEP) {
            Some(pos) => Self::new(&wire[..pos], &wire[pos + WIRE_SEP.len()..]),
            None => Self::new(wire, ""),
        }
    }

    /// Encodes the error into its round-trip-stable wire form.
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.kind, WIRE_SEP, self.data)
    }

    /// Derives a child error kind: `self.kind + "." + ext`.
    pub fn sub(&self, ext: &str) -> Self {
        Self::new(format!("{}.{ext}", self.kind), "")
    }

    /// Replaces everything up to the final dot with the parent's kind. An
    /// error whose kind carries no dot is returned unchanged.
    pub fn reparent(&self, parent: &str) -> Self {
        match self.kind.rfind('.') {
            Some(pos) => Self::new(format!("{parent}{}", &self.kind[pos..]), self.data.clone()),
            None => self.clone(),
        }
    }

    /// True when this is the nil error.
    pub fn ok(&self) -> bool {
        self.kind == KIND_NIL
    }

    /// Attaches data to an otherwise bare kind.
    pub fn with_data(&self, data: impl Into<String>) -> Self {
        Self::new(self.kind.clone(), data)
    }

    /// Prefix match on kind. The empty pattern matches every error; a
    /// pattern longer than the kind never matches.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern.len() > self.kind.len() {
            return false;
        }
        self.kind.starts_with(pattern)
    }

    /// True when any of the provided patterns matches.
    pub fn matches_any(&self, patterns: &[&str]) -> bool {
        patterns.iter().any(|p| self.matches(p))
    }

    /// Returns nil when the error matches the pattern, otherwise the error.
    /// Lets read paths swallow benign errors without surfacing them.
    pub fn skip(&self, pattern: &str) -> Self {
        if self.matches(pattern) {
            Self::nil()
        } else {
            self.clone()
        }
    }

    /// Returns nil when the error matches any of the patterns.
    pub fn skip_any(&self, patterns: &[&str]) -> Self {
        if self.matches_any(patterns) {
            Self::nil()
        } else {
            self.clone()
        }
    }

    pub fn message(&self) -> String {
        format!("[{}] {}", self.kind, self.data)
    }
}

impl Default for Error {
    fn default() -> Self {
        Self::nil()
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Error {}

impl PartialEq<str> for Error {
    fn eq(&self, other: &str) -> bool {
        self.kind == other
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.data)
    }
}

impl std::error::Error for Error {}

/// Shorthand for fallible operations that surface a transportable [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
