//! Per-CPF user preferences, carried with the same optimistic-concurrency
//! discipline as the overlay.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Small per-CPF preferences document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub cpf: String,
    pub first_login: bool,
    pub opt_in: bool,
    /// Opt-in per notification category.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub opt_in_categorias: HashMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_id: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserConfig {
    /// Defaults for a CPF that has never stored preferences: first login is
    /// pending, global opt-in is off.
    pub fn empty(cpf: impl Into<String>) -> Self {
        Self {
            cpf: cpf.into(),
            first_login: true,
            opt_in: false,
            opt_in_categorias: HashMap::new(),
            avatar_id: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Patches accepted by the user-config write path.
#[derive(Debug, Clone)]
pub enum UserConfigPatch {
    FirstLogin(bool),
    OptIn(bool),
    OptInCategoria { categoria: String, opt_in: bool },
    Avatar(Option<String>),
}

impl UserConfigPatch {
    pub fn field_name(&self) -> &'static str {
        match self {
            UserConfigPatch::FirstLogin(_) => "first_login",
            UserConfigPatch::OptIn(_) => "opt_in",
            UserConfigPatch::OptInCategoria { .. } => "opt_in_categorias",
            UserConfigPatch::Avatar(_) => "avatar_id",
        }
    }
}

impl UserConfig {
    /// Produce the successor config with the patch applied and the version
    /// bumped.
    pub fn apply(&self, patch: UserConfigPatch, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.updated_at = now;

        match patch {
            UserConfigPatch::FirstLogin(v) => next.first_login = v,
            UserConfigPatch::OptIn(v) => next.opt_in = v,
            UserConfigPatch::OptInCategoria { categoria, opt_in } => {
                next.opt_in_categorias.insert(categoria, opt_in);
            }
            UserConfigPatch::Avatar(id) => next.avatar_id = id,
        }

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_defaults() {
        let config = UserConfig::empty("123");
        assert!(config.first_login);
        assert!(!config.opt_in);
        assert_eq!(config.version, 0);
    }

    #[test]
    fn test_apply_category() {
        let config = UserConfig::empty("123").apply(
            UserConfigPatch::OptInCategoria {
                categoria: "saude".to_string(),
                opt_in: true,
            },
            Utc::now(),
        );
        assert_eq!(config.version, 1);
        assert_eq!(config.opt_in_categorias.get("saude"), Some(&true));
    }
}
