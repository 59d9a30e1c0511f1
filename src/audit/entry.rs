//! Audit Entry
//!
//! Defines the sealed ledger entry and the validated input used to append one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::audit::hasher::EncodingVersion;
use crate::error::{LedgerError, LedgerResult};

/// A sealed, immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub partition_key: String,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub metadata: Value,
    pub prev_hash: String,
    pub hash: String,
    pub secret_version: i64,
    /// `None` for rows written before the encoding was recorded per entry.
    pub encoding_version: Option<EncodingVersion>,
}

impl AuditEntry {
    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "#{} {}: {} {} on {}{}",
            self.id,
            self.partition_key,
            self.actor_id,
            self.action,
            self.resource_type,
            self.resource_id
                .as_ref()
                .map(|id| format!("/{}", id))
                .unwrap_or_default()
        )
    }

    pub fn is_first_in_partition(&self) -> bool {
        self.prev_hash.is_empty()
    }
}

/// Input for an append. Validated before any storage access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub partition_key: String,
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub metadata: Option<Value>,
}

impl NewAuditEntry {
    pub fn new(
        partition_key: impl Into<String>,
        actor_id: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            actor_id: actor_id.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            metadata: None,
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Check preconditions and return the metadata object to seal.
    pub fn validate(&self) -> LedgerResult<Map<String, Value>> {
        for (field, value) in [
            ("partition_key", &self.partition_key),
            ("actor_id", &self.actor_id),
            ("action", &self.action),
            ("resource_type", &self.resource_type),
        ] {
            if value.trim().is_empty() {
                return Err(LedgerError::empty_field(field));
            }
        }

        if let Some(resource_id) = &self.resource_id {
            if resource_id.trim().is_empty() {
                return Err(LedgerError::empty_field("resource_id"));
            }
        }

        match &self.metadata {
            None => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(other) => Err(LedgerError::metadata_not_object(json_kind(other))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
