//! Placeholder substitution in deployed text artifacts.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::error::{DeployError, Result};

/// Placeholders look like `_PRODUCT_API_URL_`, bounded by non-word characters.
pub const DEFAULT_PLACEHOLDER_PATTERN: &str = r"\b_[A-Z][A-Z0-9]*(?:_[A-Z0-9]+)*_\b";

/// Rewrites placeholder tokens and verifies none survive.
#[derive(Debug, Clone)]
pub struct ConfigInjector {
    placeholder: Regex,
}

impl Default for ConfigInjector {
    fn default() -> Self {
        Self {
            placeholder: Regex::new(DEFAULT_PLACEHOLDER_PATTERN)
                .expect("default placeholder pattern should always compile"),
        }
    }
}

impl ConfigInjector {
    /// Use a custom placeholder syntax for the post-injection check.
    pub fn with_pattern(pattern: &str) -> Result<Self> {
        let placeholder = Regex::new(pattern).map_err(|e| {
            DeployError::InvalidDefinition(format!("invalid placeholder pattern `{}`: {}", pattern, e))
        })?;
        Ok(Self { placeholder })
    }

    /// Replace every occurrence of every token key in `content`.
    ///
    /// Substitution is a single left-to-right pass: at each position the
    /// longest matching key wins, and replacement text is never scanned
    /// again. Fails if anything that looks like a placeholder, or any token
    /// key, remains in the output.
    pub fn inject(&self, content: &str, tokens: &BTreeMap<String, String>) -> Result<String> {
        let mut keys: Vec<(&str, &str)> = tokens
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        keys.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let mut output = String::with_capacity(content.len());
        let mut rest = content;
        let mut replaced = 0usize;
        'scan: while let Some(c) = rest.chars().next() {
            for (key, value) in &keys {
                if let Some(after) = rest.strip_prefix(key) {
                    output.push_str(value);
                    rest = after;
                    replaced += 1;
                    continue 'scan;
                }
            }
            output.push(c);
            rest = &rest[c.len_utf8()..];
        }

        let mut leftover: BTreeSet<String> = self
            .placeholder
            .find_iter(&output)
            .map(|m| m.as_str().to_string())
            .collect();
        leftover.extend(
            keys.iter()
                .filter(|(key, _)| output.contains(key))
                .map(|(key, _)| key.to_string()),
        );

        if !leftover.is_empty() {
            tracing::error!(?leftover, "Placeholders remain after injection");
            return Err(DeployError::UnresolvedPlaceholder {
                placeholders: leftover,
            });
        }

        tracing::debug!(replaced, "Injected configuration values");
        Ok(output)
    }
}
