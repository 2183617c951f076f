// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Property keys: `base` or `base[name=value,...]`

use crate::error::{CoreError, CoreResult};
use std::collections::BTreeMap;
use std::fmt;

const BLOCK: &str = "property-key";

/// Append-information tag naming a channel
pub const CHANNEL_TAG: &str = "ch";

/// Parsed property key
///
/// The bracketed append information narrows the key to part of the base
/// property (typically one channel). Tags are kept sorted so equal keys
/// written in a different order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyKey {
    full: String,
    base: String,
    append: String,
    tags: BTreeMap<String, String>,
}

impl PropertyKey {
    pub fn parse(text: &str) -> CoreResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CoreError::invalid_argument(BLOCK, "empty property key"));
        }

        let (base, tags) = match text.find('[') {
            None => {
                if text.contains(']') {
                    return Err(malformed(text));
                }
                (text, BTreeMap::new())
            }
            Some(open) => {
                let inner = text[open + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| malformed(text))?;
                if inner.contains('[') || inner.contains(']') {
                    return Err(malformed(text));
                }
                (text[..open].trim_end(), parse_tags(text, inner)?)
            }
        };

        if base.is_empty() {
            return Err(malformed(text));
        }
        Ok(Self::from_parts(base, tags))
    }

    fn from_parts(base: &str, tags: BTreeMap<String, String>) -> Self {
        let append = tags
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(",");
        let full = if append.is_empty() {
            base.to_string()
        } else {
            format!("{}[{}]", base, append)
        };
        Self {
            full,
            base: base.to_string(),
            append,
            tags,
        }
    }

    /// Key scoped to one channel of `base`
    pub fn for_channel(base: &str, channel_id: u32) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(CHANNEL_TAG.to_string(), channel_id.to_string());
        Self::from_parts(base, tags)
    }

    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Normalized append information, empty when the key has none
    pub fn append(&self) -> &str {
        &self.append
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    pub fn channel_id(&self) -> Option<u32> {
        self.tag(CHANNEL_TAG).and_then(|v| v.parse().ok())
    }

    /// Whether locks or accesses on `self` and `other` contend
    ///
    /// A bare base key covers all of its appended variants; two different
    /// appended variants of one base are independent.
    pub fn overlaps(&self, other: &PropertyKey) -> bool {
        self.base == other.base && self.contends_with_append(&other.append)
    }

    /// Same rule as [`overlaps`](Self::overlaps) for an append of this key's base
    pub(crate) fn contends_with_append(&self, append: &str) -> bool {
        self.append.is_empty() || append.is_empty() || self.append == append
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl std::str::FromStr for PropertyKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PropertyKey::parse(s)
    }
}

fn parse_tags(text: &str, inner: &str) -> CoreResult<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    if inner.trim().is_empty() {
        return Ok(tags);
    }
    for item in inner.split(',') {
        let (name, value) = item.split_once('=').ok_or_else(|| malformed(text))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(malformed(text));
        }
        tags.insert(name.to_string(), value.trim().to_string());
    }
    Ok(tags)
}

#[track_caller]
fn malformed(text: &str) -> CoreError {
    CoreError::invalid_argument(BLOCK, format!("malformed property key '{}'", text))
}
