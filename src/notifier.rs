//! Verification-code delivery.
//!
//! The external notifier is an opaque collaborator: delivery is idempotent
//! by (cpf, phone, code). When delivery is disabled by configuration the
//! code is logged instead, which is also what tests rely on.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::config::VerificationConfig;

/// Notifier errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Delivery contract for verification codes.
#[async_trait]
pub trait CodeNotifier: Send + Sync {
    async fn deliver(&self, cpf: &str, telefone: &str, code: &str) -> Result<(), NotifyError>;
}

/// Logs the code. Used when delivery is disabled.
pub struct LogNotifier;

#[async_trait]
impl CodeNotifier for LogNotifier {
    async fn deliver(&self, cpf: &str, telefone: &str, code: &str) -> Result<(), NotifyError> {
        info!(cpf, telefone, code, "verification code (delivery disabled)");
        Ok(())
    }
}

/// Delivers through the external HTTP channel.
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CodeNotifier for HttpNotifier {
    async fn deliver(&self, cpf: &str, telefone: &str, code: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "cpf": cpf,
                "telefone": telefone,
                "code": code,
                "idempotency_key": format!("{cpf}:{telefone}:{code}"),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(format!(
                "notifier returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Captures deliveries instead of sending them. Test double.
#[derive(Default)]
pub struct RecordingNotifier {
    deliveries: Mutex<Vec<(String, String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently delivered code for (cpf, phone), if any.
    pub fn last_code(&self, cpf: &str, telefone: &str) -> Option<String> {
        self.deliveries
            .lock()
            .iter()
            .rev()
            .find(|(c, t, _)| c == cpf && t == telefone)
            .map(|(_, _, code)| code.clone())
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().len()
    }
}

#[async_trait]
impl CodeNotifier for RecordingNotifier {
    async fn deliver(&self, cpf: &str, telefone: &str, code: &str) -> Result<(), NotifyError> {
        self.deliveries
            .lock()
            .push((cpf.to_string(), telefone.to_string(), code.to_string()));
        Ok(())
    }
}

/// Pick the notifier the configuration asks for.
pub fn from_config(config: &VerificationConfig) -> Arc<dyn CodeNotifier> {
    match (&config.delivery_url, config.delivery_enabled) {
        (Some(url), true) => Arc::new(HttpNotifier::new(url.clone())),
        _ => Arc::new(LogNotifier),
    }
}
