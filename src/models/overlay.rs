//! Self-declared overlay: citizen-submitted overrides to the public profile.
//!
//! Invariants:
//! - `version` is monotonically increasing and drives optimistic concurrency
//! - at most one `telefone_pendente` exists at any time
//! - `telefone_pendente` is never merged into the materialized view
//! - `updated_at` is at least as new as any sub-field's `updated_at`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::citizen::{Endereco, Email, Etnia, Telefone};

/// Per-CPF document of citizen-declared overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfDeclaredOverlay {
    pub cpf: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endereco: Option<Endereco>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<Email>,
    /// Confirmed phone: only set through the verification state machine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telefone: Option<Telefone>,
    /// Unconfirmed phone awaiting code confirmation. Never merged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telefone_pendente: Option<Telefone>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etnia: Option<Etnia>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl SelfDeclaredOverlay {
    /// Empty overlay at version 0, the implicit state before any declaration.
    pub fn empty(cpf: impl Into<String>) -> Self {
        Self {
            cpf: cpf.into(),
            endereco: None,
            email: None,
            telefone: None,
            telefone_pendente: None,
            etnia: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether the overlay carries no declared fields at all.
    pub fn is_empty(&self) -> bool {
        self.endereco.is_none()
            && self.email.is_none()
            && self.telefone.is_none()
            && self.telefone_pendente.is_none()
            && self.etnia.is_none()
    }
}

/// A single-field patch, applied by the staged-write state machine.
#[derive(Debug, Clone)]
pub enum OverlayPatch {
    Endereco(Endereco),
    Email(Email),
    /// Direct confirmed-phone replacement (verification-internal use).
    Telefone(Telefone),
    /// Set or clear the pending phone.
    TelefonePendente(Option<Telefone>),
    Etnia(Etnia),
    /// Promote the pending phone to confirmed, clearing the pending slot.
    PromoteTelefone,
}

impl OverlayPatch {
    /// Short name used for audit actions and tracing.
    pub fn field_name(&self) -> &'static str {
        match self {
            OverlayPatch::Endereco(_) => "endereco",
            OverlayPatch::Email(_) => "email",
            OverlayPatch::Telefone(_) => "telefone",
            OverlayPatch::TelefonePendente(_) => "telefone_pendente",
            OverlayPatch::Etnia(_) => "etnia",
            OverlayPatch::PromoteTelefone => "telefone",
        }
    }
}

impl SelfDeclaredOverlay {
    /// Produce the successor overlay: the patch applied, the version bumped,
    /// and `updated_at` stamped on both the document and the changed field.
    pub fn apply(&self, patch: OverlayPatch, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.updated_at = now;

        match patch {
            OverlayPatch::Endereco(mut e) => {
                e.updated_at = Some(now);
                next.endereco = Some(e);
            }
            OverlayPatch::Email(mut e) => {
                e.updated_at = Some(now);
                next.email = Some(e);
            }
            OverlayPatch::Telefone(mut t) => {
                t.updated_at = Some(now);
                next.telefone = Some(t);
            }
            OverlayPatch::TelefonePendente(Some(mut t)) => {
                t.updated_at = Some(now);
                next.telefone_pendente = Some(t);
            }
            OverlayPatch::TelefonePendente(None) => {
                next.telefone_pendente = None;
            }
            OverlayPatch::Etnia(mut e) => {
                e.updated_at = Some(now);
                next.etnia = Some(e);
            }
            OverlayPatch::PromoteTelefone => {
                if let Some(mut pending) = next.telefone_pendente.take() {
                    pending.updated_at = Some(now);
                    next.telefone = Some(pending);
                }
            }
        }

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phone(valor: &str) -> Telefone {
        Telefone {
            ddi: "55".to_string(),
            ddd: "21".to_string(),
            valor: valor.to_string(),
            updated_at: None,
        }
    }

    #[test]
    fn test_apply_bumps_version() {
        let overlay = SelfDeclaredOverlay::empty("123");
        let now = Utc::now();
        let next = overlay.apply(
            OverlayPatch::Email(Email {
                valor: "a@b".to_string(),
                updated_at: None,
            }),
            now,
        );

        assert_eq!(next.version, 1);
        assert_eq!(next.updated_at, now);
        assert_eq!(next.email.as_ref().unwrap().updated_at, Some(now));
    }

    #[test]
    fn test_promote_moves_pending_to_confirmed() {
        let now = Utc::now();
        let overlay = SelfDeclaredOverlay::empty("123")
            .apply(OverlayPatch::TelefonePendente(Some(phone("999887766"))), now);
        assert!(overlay.telefone_pendente.is_some());
        assert!(overlay.telefone.is_none());

        let promoted = overlay.apply(OverlayPatch::PromoteTelefone, now);
        assert!(promoted.telefone_pendente.is_none());
        assert_eq!(promoted.telefone.as_ref().unwrap().valor, "999887766");
        assert_eq!(promoted.version, 2);
    }

    #[test]
    fn test_clear_pending() {
        let now = Utc::now();
        let overlay = SelfDeclaredOverlay::empty("123")
            .apply(OverlayPatch::TelefonePendente(Some(phone("1"))), now)
            .apply(OverlayPatch::TelefonePendente(None), now);
        assert!(overlay.telefone_pendente.is_none());
        assert_eq!(overlay.version, 2);
    }

    #[test]
    fn test_empty_detection() {
        let overlay = SelfDeclaredOverlay::empty("123");
        assert!(overlay.is_empty());
        let next = overlay.apply(
            OverlayPatch::Etnia(Etnia {
                valor: "parda".to_string(),
                updated_at: None,
            }),
            Utc::now(),
        );
        assert!(!next.is_empty());
    }
}
