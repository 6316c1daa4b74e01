//! Data model for the citizen edge service.
//!
//! - `citizen`: authoritative base record and its sub-documents
//! - `overlay`: citizen-declared overrides with optimistic versioning
//! - `user_config`: per-CPF preferences (first login, opt-in, avatar)
//! - `phone`: verification documents and phone→CPF mappings
//! - `mutation`: write-behind queue elements
//! - `audit`: append-only write trail records

pub mod audit;
pub mod citizen;
pub mod mutation;
pub mod overlay;
pub mod phone;
pub mod user_config;

pub use audit::AuditRecord;
pub use citizen::{Citizen, Endereco, Email, Etnia, Nascimento, Telefone, Wallet};
pub use mutation::{DeadLetter, MutationKind, MutationPayload, PendingMutation};
pub use overlay::SelfDeclaredOverlay;
pub use phone::{MappingStatus, PhoneCpfMapping, PhoneVerification, QuarantineEvent};
pub use user_config::UserConfig;
