//! Store key construction for a limiter namespace.

use crate::error::{LimiterError, Result};

/// Hard key-length ceiling of the backing store, in bytes.
pub const MAX_KEY_LEN: usize = 250;

/// Longest description accepted, in bytes.
pub const MAX_DESCRIPTION_LEN: usize = 248;

/// Separates the description from the identity. Never allowed in a description.
pub const SEPARATOR: char = '|';

const MITIGATED_SUFFIX: &str = ":mitigated";

/// Longest minute suffix, `":59"`.
const MINUTE_SUFFIX_MAX_LEN: usize = 3;

/// A validated limiter namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    description: String,
}

impl KeySpace {
    /// Validate a description and wrap it.
    pub fn new(description: impl Into<String>) -> Result<Self> {
        let description = description.into();

        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(LimiterError::Config(format!(
                "Max len for description is {} bytes, got {} bytes",
                MAX_DESCRIPTION_LEN,
                description.len()
            )));
        }

        if description.contains(SEPARATOR) {
            return Err(LimiterError::Config(format!(
                "Description must not contain the reserved separator '{}'",
                SEPARATOR
            )));
        }

        Ok(Self { description })
    }

    /// The namespace prefix.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Derive every key the limiter touches for `identity`.
    ///
    /// Fails with [`LimiterError::KeyTooLong`] when the longest derived key
    /// would not fit the store, so no truncated key is ever issued.
    pub fn derive(&self, identity: &str) -> Result<IdentityKeys> {
        let base_len = self.description.len() + SEPARATOR.len_utf8() + identity.len();
        let longest = base_len + MITIGATED_SUFFIX.len().max(MINUTE_SUFFIX_MAX_LEN);
        if longest > MAX_KEY_LEN {
            return Err(LimiterError::KeyTooLong {
                len: longest,
                max: MAX_KEY_LEN,
            });
        }

        let mut base = String::with_capacity(base_len);
        base.push_str(&self.description);
        base.push(SEPARATOR);
        base.push_str(identity);

        Ok(IdentityKeys { base })
    }
}

/// Keys for one identity inside a [`KeySpace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeys {
    base: String,
}

impl IdentityKeys {
    /// `description|identity`
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Key of the mitigation flag.
    pub fn mitigated(&self) -> String {
        format!("{}{}", self.base, MITIGATED_SUFFIX)
    }

    /// Key of the counter for `minute` (minute-of-hour, 0..=59).
    pub fn bucket(&self, minute: u32) -> String {
        debug_assert!(minute < 60, "minute-of-hour out of range: {}", minute);
        format!("{}:{}", self.base, minute)
    }
}
