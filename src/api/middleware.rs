//! API middleware: request-id tracking and bearer-token authentication.
//!
//! Token issuance and role management live with the external identity
//! provider; this service only validates HS256 tokens and enforces CPF
//! ownership (admins bypass).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig as AuthSettings;

use super::responses::ApiError;

/// Request ID header name.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Attach a request id to every request and response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Request id stored in extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Claims decoded from the bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    /// CPF the token owns.
    #[serde(default)]
    pub cpf: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
}

impl Claims {
    pub fn is_admin(&self, admin_role: &str) -> bool {
        self.roles.iter().any(|role| role == admin_role)
    }

    /// Owner-or-admin check for a path CPF.
    pub fn authorize(&self, cpf: &str, admin_role: &str) -> Result<(), ApiError> {
        if self.is_admin(admin_role) {
            return Ok(());
        }
        match &self.cpf {
            Some(own) if own == cpf => Ok(()),
            _ => Err(ApiError::forbidden("token does not own this CPF")),
        }
    }

    /// Admin-only check.
    pub fn require_admin(&self, admin_role: &str) -> Result<(), ApiError> {
        if self.is_admin(admin_role) {
            Ok(())
        } else {
            Err(ApiError::forbidden("admin role required"))
        }
    }

    /// Actor identity recorded in audit records.
    pub fn actor(&self) -> String {
        self.cpf
            .clone()
            .or_else(|| self.sub.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Authentication middleware state.
pub struct AuthState {
    decoding_key: DecodingKey,
    validation: Validation,
    pub admin_role: String,
    excluded_paths: Vec<String>,
}

impl AuthState {
    pub fn new(settings: &AuthSettings) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self {
            decoding_key: DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
            validation,
            admin_role: settings.admin_role.clone(),
            excluded_paths: vec!["/v1/health".to_string(), "/metrics".to_string()],
        }
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|p| path.starts_with(p))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| ApiError::unauthorized(format!("invalid token: {e}")))
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// Reject requests without valid claims; stash claims for the handlers.
pub async fn auth_middleware(
    State(state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.is_excluded(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let token = extract_bearer_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;

    let claims = state.verify(&token)?;
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn settings() -> AuthSettings {
        AuthSettings {
            jwt_secret: "test-secret-key-32-characters!!".to_string(),
            admin_role: "admin".to_string(),
        }
    }

    fn token(claims: &Claims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(settings().jwt_secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(cpf: &str, roles: Vec<&str>) -> Claims {
        Claims {
            sub: Some("user".to_string()),
            cpf: Some(cpf.to_string()),
            roles: roles.into_iter().map(String::from).collect(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
        }
    }

    #[test]
    fn test_verify_roundtrip() {
        let state = AuthState::new(&settings());
        let decoded = state.verify(&token(&claims("123", vec![]))).unwrap();
        assert_eq!(decoded.cpf.as_deref(), Some("123"));
    }

    #[test]
    fn test_verify_rejects_bad_signature() {
        let state = AuthState::new(&settings());
        let other = EncodingKey::from_secret(b"a different secret entirely!!");
        let forged = encode(&Header::default(), &claims("123", vec![]), &other).unwrap();
        assert!(state.verify(&forged).is_err());
    }

    #[test]
    fn test_ownership() {
        let c = claims("123", vec![]);
        assert!(c.authorize("123", "admin").is_ok());
        assert!(c.authorize("456", "admin").is_err());
    }

    #[test]
    fn test_admin_bypasses_ownership() {
        let c = claims("123", vec!["admin"]);
        assert!(c.authorize("456", "admin").is_ok());
        assert!(c.require_admin("admin").is_ok());

        let plain = claims("123", vec![]);
        assert!(plain.require_admin("admin").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let state = AuthState::new(&settings());
        let mut c = claims("123", vec![]);
        c.exp = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp();
        assert!(state.verify(&token(&c)).is_err());
    }
}
