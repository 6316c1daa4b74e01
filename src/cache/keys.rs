//! Closed cache key schema.
//!
//! Every cache key this service touches is enumerated here; constructing
//! ad-hoc keys elsewhere is forbidden. Keys are stable, versioned by family
//! name, and colon-separated.

use std::fmt;

/// A cache key in one of the known families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey<'a> {
    /// Materialized merged view.
    Citizen(&'a str),
    /// Latest overlay known to this service (may be ahead of the store).
    Overlay(&'a str),
    /// Per-CPF preferences.
    UserConfig(&'a str),
    /// Phone→CPF mapping by canonical phone.
    PhoneMapping(&'a str),
    /// Address reference data: neighborhood by id.
    Bairro(&'a str),
    /// Address reference data: street by id.
    Logradouro(&'a str),
    /// Address reference data: fully-qualified address.
    AddressFull {
        bairro: &'a str,
        logradouro: &'a str,
        numero: &'a str,
    },
    /// Pending phone verification document.
    Verification { cpf: &'a str, telefone: &'a str },
    /// Sliding issuance counter.
    VerifyRateLimit(&'a str),
}

/// Key family, used for TTL selection and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    Citizen,
    Overlay,
    UserConfig,
    PhoneMapping,
    Address,
    Verification,
    RateLimit,
}

impl KeyFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFamily::Citizen => "citizen",
            KeyFamily::Overlay => "overlay",
            KeyFamily::UserConfig => "userconfig",
            KeyFamily::PhoneMapping => "phone_mapping",
            KeyFamily::Address => "address",
            KeyFamily::Verification => "verify",
            KeyFamily::RateLimit => "ratelimit",
        }
    }
}

impl CacheKey<'_> {
    pub fn family(&self) -> KeyFamily {
        match self {
            CacheKey::Citizen(_) => KeyFamily::Citizen,
            CacheKey::Overlay(_) => KeyFamily::Overlay,
            CacheKey::UserConfig(_) => KeyFamily::UserConfig,
            CacheKey::PhoneMapping(_) => KeyFamily::PhoneMapping,
            CacheKey::Bairro(_) | CacheKey::Logradouro(_) | CacheKey::AddressFull { .. } => {
                KeyFamily::Address
            }
            CacheKey::Verification { .. } => KeyFamily::Verification,
            CacheKey::VerifyRateLimit(_) => KeyFamily::RateLimit,
        }
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Citizen(cpf) => write!(f, "citizen:{cpf}"),
            CacheKey::Overlay(cpf) => write!(f, "overlay:{cpf}"),
            CacheKey::UserConfig(cpf) => write!(f, "userconfig:{cpf}"),
            CacheKey::PhoneMapping(telefone) => write!(f, "phone:mapping:{telefone}"),
            CacheKey::Bairro(id) => write!(f, "address:bairro:{id}"),
            CacheKey::Logradouro(id) => write!(f, "address:logradouro:{id}"),
            CacheKey::AddressFull {
                bairro,
                logradouro,
                numero,
            } => write!(f, "address:full:{bairro}:{logradouro}:{numero}"),
            CacheKey::Verification { cpf, telefone } => write!(f, "verify:{cpf}:{telefone}"),
            CacheKey::VerifyRateLimit(cpf) => write!(f, "ratelimit:verify:{cpf}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rendering() {
        assert_eq!(CacheKey::Citizen("123").render(), "citizen:123");
        assert_eq!(
            CacheKey::Verification {
                cpf: "123",
                telefone: "5521999887766"
            }
            .render(),
            "verify:123:5521999887766"
        );
        assert_eq!(
            CacheKey::AddressFull {
                bairro: "copacabana",
                logradouro: "atlantica",
                numero: "100"
            }
            .render(),
            "address:full:copacabana:atlantica:100"
        );
        assert_eq!(CacheKey::VerifyRateLimit("1").render(), "ratelimit:verify:1");
    }

    #[test]
    fn test_family_assignment() {
        assert_eq!(CacheKey::Bairro("7").family(), KeyFamily::Address);
        assert_eq!(CacheKey::Overlay("1").family(), KeyFamily::Overlay);
        assert_eq!(
            CacheKey::VerifyRateLimit("1").family(),
            KeyFamily::RateLimit
        );
    }
}
