//! Write-behind queue elements.
//!
//! A `PendingMutation` is acknowledged to the client once persisted in the
//! queue; workers later apply it to the document store. Delivery is
//! at-least-once; applications are idempotent via `version` or natural key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::audit::AuditRecord;
use super::overlay::SelfDeclaredOverlay;
use super::phone::{PhoneCpfMapping, PhoneVerification};
use super::user_config::UserConfig;

/// The closed set of mutation kinds, one FIFO each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    OverlayUpsert,
    UserConfigUpsert,
    PhoneMappingUpsert,
    AuditRecord,
    PhoneVerificationCreate,
    PhoneVerificationDelete,
}

impl MutationKind {
    pub const ALL: [MutationKind; 6] = [
        MutationKind::OverlayUpsert,
        MutationKind::UserConfigUpsert,
        MutationKind::PhoneMappingUpsert,
        MutationKind::AuditRecord,
        MutationKind::PhoneVerificationCreate,
        MutationKind::PhoneVerificationDelete,
    ];

    /// Stable name used in queue keys and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::OverlayUpsert => "overlay_upsert",
            MutationKind::UserConfigUpsert => "user_config_upsert",
            MutationKind::PhoneMappingUpsert => "phone_mapping_upsert",
            MutationKind::AuditRecord => "audit_record",
            MutationKind::PhoneVerificationCreate => "phone_verification_create",
            MutationKind::PhoneVerificationDelete => "phone_verification_delete",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MutationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown mutation kind: {s}"))
    }
}

/// Typed payload carried by a pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationPayload {
    Overlay(SelfDeclaredOverlay),
    UserConfig(UserConfig),
    PhoneMapping(PhoneCpfMapping),
    Audit(AuditRecord),
    VerificationCreate(PhoneVerification),
    VerificationDelete { cpf: String, telefone: String },
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationPayload::Overlay(_) => MutationKind::OverlayUpsert,
            MutationPayload::UserConfig(_) => MutationKind::UserConfigUpsert,
            MutationPayload::PhoneMapping(_) => MutationKind::PhoneMappingUpsert,
            MutationPayload::Audit(_) => MutationKind::AuditRecord,
            MutationPayload::VerificationCreate(_) => MutationKind::PhoneVerificationCreate,
            MutationPayload::VerificationDelete { .. } => MutationKind::PhoneVerificationDelete,
        }
    }
}

/// One queued write, durable from `enqueue` until applied or dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub kind: MutationKind,
    /// Target document key (CPF, canonical phone, or record id).
    pub key: String,
    pub payload: MutationPayload,
    pub enqueued_at: DateTime<Utc>,
    /// Apply attempts so far (version-conflict rebases excluded).
    pub attempts: u32,
    /// Rebase count for version conflicts, bounded separately.
    pub rebases: u32,
    /// Not before this instant; set when an attempt is scheduled for retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_retry_at: Option<DateTime<Utc>>,
}

impl PendingMutation {
    pub fn new(key: impl Into<String>, payload: MutationPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: payload.kind(),
            key: key.into(),
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            rebases: 0,
            earliest_retry_at: None,
        }
    }

    /// Whether the element is currently due for processing.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.earliest_retry_at.map_or(true, |t| t <= now)
    }
}

/// Dead-lettered mutation plus failure context, for operator intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub mutation: PendingMutation,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::overlay::SelfDeclaredOverlay;

    #[test]
    fn test_payload_kind_agreement() {
        let overlay = SelfDeclaredOverlay::empty("123");
        let mutation = PendingMutation::new("123", MutationPayload::Overlay(overlay));
        assert_eq!(mutation.kind, MutationKind::OverlayUpsert);
    }

    #[test]
    fn test_due_when_unscheduled() {
        let overlay = SelfDeclaredOverlay::empty("123");
        let mutation = PendingMutation::new("123", MutationPayload::Overlay(overlay));
        assert!(mutation.is_due(Utc::now()));
    }

    #[test]
    fn test_roundtrip() {
        let mutation = PendingMutation::new(
            "5521999887766",
            MutationPayload::VerificationDelete {
                cpf: "123".to_string(),
                telefone: "5521999887766".to_string(),
            },
        );
        let json = serde_json::to_string(&mutation).unwrap();
        let back: PendingMutation = serde_json::from_str(&json).unwrap();
        assert_eq!(mutation, back);
    }

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(MutationKind::OverlayUpsert.as_str(), "overlay_upsert");
        assert_eq!(MutationKind::ALL.len(), 6);
    }
}
