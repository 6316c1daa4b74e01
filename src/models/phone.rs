//! Phone verification documents and phone→CPF mappings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ephemeral verification document, keyed by (CPF, canonical phone).
///
/// Exists only while logically pending; removed on confirm, expiry, or
/// attempt exhaustion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneVerification {
    pub cpf: String,
    /// Canonical phone string (`ddi + ddd + valor`).
    pub telefone: String,
    /// Six-digit numeric code.
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
}

impl PhoneVerification {
    /// Natural key inside the verification collection.
    pub fn key(cpf: &str, telefone: &str) -> String {
        format!("{cpf}:{telefone}")
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Mapping status. Only `Active` mappings resolve phone→CPF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Active,
    Blocked,
    Quarantined,
}

/// One quarantine episode in a mapping's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEvent {
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

/// Phone→CPF mapping, keyed by canonical phone number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneCpfMapping {
    pub telefone: String,
    /// May be empty when the number is known but unbound.
    #[serde(default)]
    pub cpf: String,
    pub status: MappingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_until: Option<DateTime<Utc>>,
    /// Channel through which the mapping was established.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta_group: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quarantine_history: Vec<QuarantineEvent>,
}

impl PhoneCpfMapping {
    /// Fresh active binding established by a confirmed verification.
    pub fn bound(telefone: impl Into<String>, cpf: impl Into<String>, canal: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            telefone: telefone.into(),
            cpf: cpf.into(),
            status: MappingStatus::Active,
            quarantine_until: None,
            canal,
            beta_group: None,
            created_at: now,
            updated_at: now,
            quarantine_history: Vec::new(),
        }
    }

    /// Whether this mapping may be returned to callers resolving phone→CPF.
    /// Quarantined mappings stay unresolvable until a controller releases
    /// them, even past `quarantine_until`.
    pub fn is_resolvable(&self) -> bool {
        self.status == MappingStatus::Active && !self.cpf.is_empty()
    }

    /// Whether a controller release is currently allowed.
    pub fn release_allowed(&self, now: DateTime<Utc>) -> bool {
        self.status == MappingStatus::Quarantined
            && self.quarantine_until.map_or(true, |until| now >= until)
    }

    /// Controller release: quarantine over, mapping active again.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = MappingStatus::Active;
        self.quarantine_until = None;
        self.updated_at = now;
        if let Some(last) = self.quarantine_history.last_mut() {
            if last.released_at.is_none() {
                last.released_at = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_verification_key() {
        assert_eq!(
            PhoneVerification::key("12345678901", "5521999887766"),
            "12345678901:5521999887766"
        );
    }

    #[test]
    fn test_quarantined_not_resolvable() {
        let now = Utc::now();
        let mut mapping = PhoneCpfMapping::bound("5521999887766", "123", None);
        mapping.status = MappingStatus::Quarantined;
        mapping.quarantine_until = Some(now - Duration::hours(1));
        mapping.quarantine_history.push(QuarantineEvent {
            reason: "suspicious rebind".to_string(),
            quarantined_at: now - Duration::days(7),
            released_at: None,
        });

        // Past the quarantine window but not released: still unresolvable.
        assert!(!mapping.is_resolvable());
        assert!(mapping.release_allowed(now));

        mapping.release(now);
        assert!(mapping.is_resolvable());
        assert_eq!(mapping.quarantine_history[0].released_at, Some(now));
    }

    #[test]
    fn test_release_blocked_before_window() {
        let now = Utc::now();
        let mut mapping = PhoneCpfMapping::bound("5521999887766", "123", None);
        mapping.status = MappingStatus::Quarantined;
        mapping.quarantine_until = Some(now + Duration::hours(1));
        assert!(!mapping.release_allowed(now));
    }
}
