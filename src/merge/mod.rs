//! Merge/overlay engine.
//!
//! Combines an authoritative base record with a self-declared overlay into
//! the materialized citizen view: overlay values win per field and carry
//! `source = self_declared`, base values fill the rest, wallet data passes
//! through from base untouched, and a pending phone is never exposed.
//!
//! The merge is pure: no clock reads, no I/O. Freshness is judged against
//! the `as_of` instant the caller passes in.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MergeConfig;
use crate::models::{Citizen, Endereco, Email, Etnia, Nascimento, SelfDeclaredOverlay, Telefone, Wallet};

/// Where an effective field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Base,
    SelfDeclared,
}

/// An effective field value plus provenance and freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldView<T> {
    #[serde(flatten)]
    pub value: T,
    pub source: Provenance,
    pub is_outdated: bool,
}

/// The materialized projection delivered to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitizenView {
    pub cpf: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nome_social: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nascimento: Option<Nascimento>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nome_mae: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endereco: Option<FieldView<Endereco>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<FieldView<Email>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telefone: Option<FieldView<Telefone>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etnia: Option<FieldView<Etnia>>,
    #[serde(default)]
    pub wallet: Wallet,
}

/// Freshness policy for the `is_outdated` flag.
#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    pub outdated_after: Duration,
}

impl MergePolicy {
    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            outdated_after: Duration::days(config.outdated_after_days),
        }
    }

    /// A field with no timestamp at all is considered outdated: there is no
    /// evidence it was ever (re)declared.
    fn is_outdated(&self, updated_at: Option<DateTime<Utc>>, as_of: DateTime<Utc>) -> bool {
        match updated_at {
            Some(t) => as_of.signed_duration_since(t) > self.outdated_after,
            None => true,
        }
    }
}

fn pick<T: Clone>(
    declared: Option<&T>,
    base: Option<&T>,
    updated_at: impl Fn(&T) -> Option<DateTime<Utc>>,
    policy: &MergePolicy,
    as_of: DateTime<Utc>,
) -> Option<FieldView<T>> {
    let (value, source) = match (declared, base) {
        (Some(v), _) => (v.clone(), Provenance::SelfDeclared),
        (None, Some(v)) => (v.clone(), Provenance::Base),
        (None, None) => return None,
    };
    let is_outdated = policy.is_outdated(updated_at(&value), as_of);
    Some(FieldView {
        value,
        source,
        is_outdated,
    })
}

/// Merge base and overlay into the materialized view.
///
/// `telefone_pendente` is intentionally ignored: an unconfirmed phone is
/// visible only through the verification endpoints.
pub fn merge_view(
    cpf: &str,
    base: Option<&Citizen>,
    overlay: Option<&SelfDeclaredOverlay>,
    policy: &MergePolicy,
    as_of: DateTime<Utc>,
) -> CitizenView {
    let endereco = pick(
        overlay.and_then(|o| o.endereco.as_ref()),
        base.and_then(|b| b.endereco.principal.as_ref()),
        |e: &Endereco| e.updated_at,
        policy,
        as_of,
    );
    let email = pick(
        overlay.and_then(|o| o.email.as_ref()),
        base.and_then(|b| b.email.principal.as_ref()),
        |e: &Email| e.updated_at,
        policy,
        as_of,
    );
    let telefone = pick(
        overlay.and_then(|o| o.telefone.as_ref()),
        base.and_then(|b| b.telefone.principal.as_ref()),
        |t: &Telefone| t.updated_at,
        policy,
        as_of,
    );
    let etnia = pick(
        overlay.and_then(|o| o.etnia.as_ref()),
        base.and_then(|b| b.etnia.as_ref()),
        |e: &Etnia| e.updated_at,
        policy,
        as_of,
    );

    CitizenView {
        cpf: cpf.to_string(),
        nome: base.and_then(|b| b.nome.clone()),
        nome_social: base.and_then(|b| b.nome_social.clone()),
        nascimento: base.and_then(|b| b.nascimento.clone()),
        nome_mae: base.and_then(|b| b.nome_mae.clone()),
        endereco,
        email,
        telefone,
        etnia,
        wallet: base.map(|b| b.wallet.clone()).unwrap_or_default(),
    }
}

fn newer<T: Clone>(
    ours: Option<&T>,
    theirs: Option<&T>,
    ours_at: DateTime<Utc>,
    theirs_at: DateTime<Utc>,
    updated_at: impl Fn(&T) -> Option<DateTime<Utc>>,
) -> Option<T> {
    match (ours, theirs) {
        (Some(a), Some(b)) => {
            let a_at = updated_at(a).unwrap_or(ours_at);
            let b_at = updated_at(b).unwrap_or(theirs_at);
            if a_at >= b_at {
                Some(a.clone())
            } else {
                Some(b.clone())
            }
        }
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

/// Rebase an overlay whose version check lost against the stored one.
///
/// Field-level last-writer-wins by `updated_at`; the result takes the stored
/// document's successor version so the retried CAS expects `stored.version`.
pub fn rebase_overlay(ours: &SelfDeclaredOverlay, stored: &SelfDeclaredOverlay) -> SelfDeclaredOverlay {
    let ours_at = ours.updated_at;
    let stored_at = stored.updated_at;

    SelfDeclaredOverlay {
        cpf: ours.cpf.clone(),
        endereco: newer(
            ours.endereco.as_ref(),
            stored.endereco.as_ref(),
            ours_at,
            stored_at,
            |e: &Endereco| e.updated_at,
        ),
        email: newer(
            ours.email.as_ref(),
            stored.email.as_ref(),
            ours_at,
            stored_at,
            |e: &Email| e.updated_at,
        ),
        telefone: newer(
            ours.telefone.as_ref(),
            stored.telefone.as_ref(),
            ours_at,
            stored_at,
            |t: &Telefone| t.updated_at,
        ),
        telefone_pendente: newer(
            ours.telefone_pendente.as_ref(),
            stored.telefone_pendente.as_ref(),
            ours_at,
            stored_at,
            |t: &Telefone| t.updated_at,
        ),
        etnia: newer(
            ours.etnia.as_ref(),
            stored.etnia.as_ref(),
            ours_at,
            stored_at,
            |e: &Etnia| e.updated_at,
        ),
        version: stored.version + 1,
        updated_at: ours_at.max(stored_at),
    }
}
