//! Logical file names
//!
//! An LFN is a slash-separated path starting with `/store` and ending in
//! `.root`. Each path segment starts with an alphanumeric character, so
//! `..` and hidden names can never appear.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

pub const LFN_PATTERN: &str = r"^/store(/[A-Za-z0-9][-A-Za-z0-9_.]*)+\.root$";

static LFN_REGEX: OnceLock<Regex> = OnceLock::new();

fn lfn_regex() -> &'static Regex {
    LFN_REGEX.get_or_init(|| Regex::new(LFN_PATTERN).expect("LFN pattern is a valid regex"))
}

/// LFN validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LfnError {
    #[error("Invalid input LFN: {0}")]
    Invalid(String),
}

/// A validated logical file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lfn(String);

impl Lfn {
    pub fn parse(raw: &str) -> Result<Self, LfnError> {
        if lfn_regex().is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(LfnError::Invalid(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path below the pool base directory.
    pub fn relative_path(&self) -> &str {
        self.0.trim_start_matches('/')
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

pub fn is_valid_lfn(raw: &str) -> bool {
    lfn_regex().is_match(raw)
}

impl fmt::Display for Lfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Lfn {
    type Err = LfnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Lfn {
    type Error = LfnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Lfn> for String {
    fn from(lfn: Lfn) -> Self {
        lfn.0
    }
}

impl AsRef<str> for Lfn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
