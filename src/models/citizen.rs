//! Authoritative base citizen record.
//!
//! Produced by the external ingestion pipeline and never mutated by this
//! service. Field names follow the upstream Brazilian civil-registry shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A postal address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endereco {
    pub logradouro: String,
    pub numero: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complemento: Option<String>,
    pub bairro: String,
    pub municipio: String,
    pub estado: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cep: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// An email address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub valor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A phone number split the way the telecom forms collect it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telefone {
    /// Country code, e.g. "55".
    pub ddi: String,
    /// Area code, e.g. "21".
    pub ddd: String,
    /// Subscriber number.
    pub valor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Telefone {
    /// Canonical form used as the verification and mapping key.
    pub fn canonical(&self) -> String {
        format!("{}{}{}", self.ddi, self.ddd, self.valor)
    }
}

/// Self-declared ethnicity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Etnia {
    pub valor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Birth data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nascimento {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub municipio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uf: Option<String>,
}

/// A principal value plus alternates, as ingested for addresses, emails and
/// phones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<T>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternativo: Vec<T>,
}

impl<T> Default for Principal<T> {
    fn default() -> Self {
        Self {
            principal: None,
            alternativo: Vec::new(),
        }
    }
}

/// Family health program enrollment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Saude {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinica_familia: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equipe_saude_familia: Option<String>,
}

/// Social assistance reference unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistenciaSocial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cras: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cadunico: Option<String>,
}

/// School enrollment summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Educacao {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escola: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turno: Option<String>,
}

/// Identity documents on file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Documentos {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nis: Option<String>,
}

/// Wallet section: passed through from base data only, never overridden.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saude: Option<Saude>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistencia_social: Option<AssistenciaSocial>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub educacao: Option<Educacao>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentos: Option<Documentos>,
}

/// The authoritative base record, keyed by CPF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citizen {
    pub cpf: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nome_social: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nascimento: Option<Nascimento>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nome_mae: Option<String>,
    #[serde(default)]
    pub endereco: Principal<Endereco>,
    #[serde(default)]
    pub email: Principal<Email>,
    #[serde(default)]
    pub telefone: Principal<Telefone>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etnia: Option<Etnia>,
    #[serde(default)]
    pub wallet: Wallet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Citizen {
    /// Minimal record with just a CPF; everything else absent.
    pub fn new(cpf: impl Into<String>) -> Self {
        Self {
            cpf: cpf.into(),
            nome: None,
            nome_social: None,
            nascimento: None,
            nome_mae: None,
            endereco: Principal::default(),
            email: Principal::default(),
            telefone: Principal::default(),
            etnia: None,
            wallet: Wallet::default(),
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telefone_canonical() {
        let t = Telefone {
            ddi: "55".to_string(),
            ddd: "21".to_string(),
            valor: "999887766".to_string(),
            updated_at: None,
        };
        assert_eq!(t.canonical(), "5521999887766");
    }

    #[test]
    fn test_citizen_roundtrip() {
        let mut citizen = Citizen::new("12345678901");
        citizen.email.principal = Some(Email {
            valor: "a@b".to_string(),
            updated_at: None,
        });

        let json = serde_json::to_string(&citizen).unwrap();
        let back: Citizen = serde_json::from_str(&json).unwrap();
        assert_eq!(citizen, back);
    }

    #[test]
    fn test_absent_fields_not_serialized() {
        let citizen = Citizen::new("12345678901");
        let json = serde_json::to_value(&citizen).unwrap();
        assert!(json.get("nome").is_none());
        assert!(json.get("etnia").is_none());
    }
}
