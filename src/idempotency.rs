//! Idempotency keys.
//!
//! The guard itself is the unique constraint on `jobs.idempotency_key` plus
//! the insert-or-return-existing semantics of [`JobStore::enqueue`]. This
//! module only makes sure keys are built from stable external identifiers, in
//! one canonical shape, so that two deliveries of the same event always land
//! on the same row.
//!
//! [`JobStore::enqueue`]: crate::JobStore::enqueue

use crate::errors::KeyError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A deterministic `"<kind>:<id>"` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Build a key from a kind tag (e.g. `callrecord`) and an external id.
    pub fn new(kind: &str, external_id: &str) -> Result<Self, KeyError> {
        let kind = check_part(kind)?;
        let external_id = check_part(external_id)?;
        if kind.contains(':') {
            return Err(KeyError {
                part: kind.to_string(),
                reason: "kind must not contain `:`",
            });
        }
        Ok(Self(format!("{kind}:{external_id}")))
    }

    /// The stored form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

fn check_part(part: &str) -> Result<&str, KeyError> {
    let trimmed = part.trim();
    if trimmed.is_empty() {
        return Err(KeyError {
            part: part.to_string(),
            reason: "must not be empty",
        });
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(KeyError {
            part: part.to_string(),
            reason: "must not contain whitespace",
        });
    }
    Ok(trimmed)
}

/// Extract the identifier of the entity a resource path points at.
///
/// Both the path form (`communications/callRecords/R1`) and the key form
/// (`communications/callRecords('R1')`) resolve to `R1`, with or without a
/// leading slash, a trailing slash or a query string.
pub fn resource_id_from_path(resource: &str) -> Option<&str> {
    let path = resource.split(['?', '#']).next().unwrap_or_default();
    let segment = path.trim_end_matches('/').rsplit('/').next()?.trim();

    let id = match segment.find('(') {
        Some(open) => segment[open + 1..]
            .strip_suffix(')')?
            .trim_matches(|c| c == '\'' || c == '"'),
        None => segment,
    };

    (!id.is_empty()).then_some(id)
}
