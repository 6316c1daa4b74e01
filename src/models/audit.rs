//! Append-only audit trail records.
//!
//! Never read on the hot path; flushed through the write-behind queue as
//! their own mutation kind.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audited write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// CPF of the actor performing the write.
    pub actor_cpf: String,
    /// Action name, e.g. "overlay.endereco.update".
    pub action: String,
    pub resource_kind: String,
    pub resource_id: String,
    /// Compact JSON summary of the prior state, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    /// Compact JSON summary of the new state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        actor_cpf: impl Into<String>,
        action: impl Into<String>,
        resource_kind: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_cpf: actor_cpf.into(),
            action: action.into(),
            resource_kind: resource_kind.into(),
            resource_id: resource_id.into(),
            before: None,
            after: None,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_before(mut self, before: serde_json::Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: serde_json::Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let record = AuditRecord::new("123", "overlay.email.update", "self_declared", "123")
            .with_after(serde_json::json!({"email": "new@x.com"}))
            .with_metadata("request_id", "abc");

        assert_eq!(record.action, "overlay.email.update");
        assert!(record.before.is_none());
        assert_eq!(record.metadata.get("request_id").unwrap(), "abc");
    }
}
