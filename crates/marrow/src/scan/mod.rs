//! Byte signature scanning over a target address space.
//!
//! A [`Pattern`] pairs signature bytes with a same-length mask; each position
//! either must match exactly, matches anything, or must differ. Patterns can
//! also be written in the usual text form (`"48 8D 0D ?? ?? ?? ??"`), which
//! maps unknown bytes to wildcards.

pub mod signature;

use memchr::memchr;

use crate::error::{Error, Result};
use crate::memory::space::{Address, MemorySpace};

pub use signature::{SignatureEntry, SignatureSet, load_signatures, save_signatures};

/// Match rule for one signature position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskByte {
    /// The byte must equal the signature byte (`x`).
    Exact,
    /// Any byte matches (`?`).
    Wildcard,
    /// The byte must differ from the signature byte (`!`).
    Not,
}

/// A byte signature with per-position match rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<u8>,
    mask: Vec<MaskByte>,
}

impl Pattern {
    /// Build a pattern from signature bytes and a textual mask, one `x`/`?`/`!`
    /// per byte.
    pub fn with_mask(bytes: &[u8], mask: &str) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::invalid_argument("signature must not be empty"));
        }
        if bytes.len() != mask.len() {
            return Err(Error::invalid_argument(format!(
                "signature is {} bytes but mask is {} characters",
                bytes.len(),
                mask.len()
            )));
        }

        let mask = mask
            .chars()
            .map(|c| match c {
                'x' => Ok(MaskByte::Exact),
                '?' => Ok(MaskByte::Wildcard),
                '!' => Ok(MaskByte::Not),
                other => Err(Error::invalid_argument(format!(
                    "invalid mask character '{other}' (expected 'x', '?' or '!')"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Pattern {
            bytes: bytes.to_vec(),
            mask,
        })
    }

    /// Parse the whitespace-separated text form, e.g. `"48 8D 0D ?? ?? ?? ??"`.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();

        for token in pattern.split_whitespace() {
            if token == "??" || token == "?" {
                bytes.push(0);
                mask.push(MaskByte::Wildcard);
                continue;
            }

            let value = u8::from_str_radix(token, 16).map_err(|e| {
                Error::invalid_argument(format!("invalid signature token '{token}': {e}"))
            })?;
            bytes.push(value);
            mask.push(MaskByte::Exact);
        }

        if bytes.is_empty() {
            return Err(Error::invalid_argument("signature pattern is empty"));
        }

        Ok(Pattern { bytes, mask })
    }

    /// Render back to the text form; not-equal positions are written `!XX`.
    pub fn format(&self) -> String {
        self.bytes
            .iter()
            .zip(&self.mask)
            .map(|(byte, mask)| match mask {
                MaskByte::Exact => format!("{byte:02X}"),
                MaskByte::Wildcard => "??".to_owned(),
                MaskByte::Not => format!("!{byte:02X}"),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        self.bytes
            .iter()
            .zip(&self.mask)
            .zip(window)
            .all(|((expected, mask), actual)| match mask {
                MaskByte::Exact => expected == actual,
                MaskByte::Wildcard => true,
                MaskByte::Not => expected != actual,
            })
    }

    /// Position and value of the first exact byte, used to skip ahead
    /// through regions that cannot possibly match.
    fn anchor(&self) -> Option<(usize, u8)> {
        self.mask
            .iter()
            .position(|m| *m == MaskByte::Exact)
            .map(|i| (i, self.bytes[i]))
    }

    /// Offset of the first match inside `buffer`, if any.
    pub fn find_in(&self, buffer: &[u8]) -> Option<usize> {
        if buffer.len() < self.len() {
            return None;
        }
        let last = buffer.len() - self.len();

        match self.anchor() {
            Some((anchor_offset, anchor_byte)) => {
                let mut start = 0;
                while start <= last {
                    // The anchor byte must appear at start+anchor_offset;
                    // memchr jumps straight to the next candidate.
                    let hit = memchr(anchor_byte, &buffer[start + anchor_offset..=last + anchor_offset])?;
                    let candidate = start + hit;
                    if self.matches_at(&buffer[candidate..candidate + self.len()]) {
                        return Some(candidate);
                    }
                    start = candidate + 1;
                }
                None
            }
            None => (0..=last).find(|&i| self.matches_at(&buffer[i..i + self.len()])),
        }
    }

    /// Offsets of every match inside `buffer`.
    pub fn find_all_in(&self, buffer: &[u8]) -> Vec<usize> {
        if buffer.len() < self.len() {
            return Vec::new();
        }
        let last = buffer.len() - self.len();
        (0..=last)
            .filter(|&i| self.matches_at(&buffer[i..i + self.len()]))
            .collect()
    }
}

/// Searches a region of a target address space for byte signatures.
///
/// The whole region is pulled across the process boundary with one bulk read,
/// then scanned locally.
pub struct PatternScanner<'a, S: MemorySpace> {
    space: &'a S,
}

impl<'a, S: MemorySpace> PatternScanner<'a, S> {
    pub fn new(space: &'a S) -> Self {
        PatternScanner { space }
    }

    /// Absolute address of the first match in `[start, start + size)`, or
    /// `None` when the signature does not occur.
    pub fn find(&self, start: Address, size: usize, pattern: &Pattern) -> Result<Option<u64>> {
        let base = self.space.resolve(start)?;
        let buffer = self.space.read_bytes(Address::Absolute(base), size)?;
        Ok(pattern.find_in(&buffer).map(|offset| base + offset as u64))
    }

    /// Absolute addresses of every match in `[start, start + size)`.
    pub fn find_all(&self, start: Address, size: usize, pattern: &Pattern) -> Result<Vec<u64>> {
        let base = self.space.resolve(start)?;
        let buffer = self.space.read_bytes(Address::Absolute(base), size)?;
        Ok(pattern
            .find_all_in(&buffer)
            .into_iter()
            .map(|offset| base + offset as u64)
            .collect())
    }
}
