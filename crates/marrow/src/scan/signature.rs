//! Named signature collections persisted as JSON.
//!
//! Lets tools ship their byte signatures next to the binary instead of
//! hard-coding them, with several alternative signatures per name so newer
//! target builds can be matched without a code change.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scan::Pattern;

/// One named lookup with its alternative signatures, tried in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub name: String,
    pub patterns: Vec<String>,
}

impl SignatureEntry {
    /// Parse every alternative into a [`Pattern`], failing on the first
    /// malformed one.
    pub fn compiled(&self) -> Result<Vec<Pattern>> {
        self.patterns.iter().map(|p| Pattern::parse(p)).collect()
    }
}

/// A versioned set of named signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureSet {
    pub version: String,
    pub entries: Vec<SignatureEntry>,
}

impl SignatureSet {
    pub fn entry(&self, name: &str) -> Option<&SignatureEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }
}

pub fn load_signatures<P: AsRef<Path>>(path: P) -> Result<SignatureSet> {
    let content = fs::read_to_string(&path)?;
    let data = serde_json::from_str(&content)?;
    Ok(data)
}

pub fn save_signatures<P: AsRef<Path>>(path: P, signatures: &SignatureSet) -> Result<()> {
    let content = serde_json::to_string_pretty(signatures)?;
    fs::write(path, content)?;
    Ok(())
}
