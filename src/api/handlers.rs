//! HTTP handlers. Thin by design: validate the input shape, check
//! ownership, delegate to the core services, map the result.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::AppContext;
use crate::cache::ViewSource;
use crate::merge::CitizenView;
use crate::models::overlay::OverlayPatch;
use crate::models::user_config::UserConfigPatch;
use crate::models::{
    AuditRecord, DeadLetter, Email, Endereco, Etnia, MutationKind, MutationPayload,
    PendingMutation, Telefone,
};
use crate::verify::IssueOutcome;

use super::middleware::Claims;
use super::responses::ApiError;

type Ctx = State<Arc<AppContext>>;

fn require_digits(value: &str, field: &str) -> Result<(), ApiError> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::bad_request(format!("{field} must be numeric")));
    }
    Ok(())
}

fn require_filled(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{field} must not be empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Merged view
// ---------------------------------------------------------------------------

/// Merged view plus how it was served.
#[derive(Debug, Serialize)]
pub struct CitizenResponse {
    #[serde(flatten)]
    pub view: CitizenView,
    pub source: ViewSource,
}

pub async fn get_citizen(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
) -> Result<Json<CitizenResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    let (view, source) = ctx.cache.get_merged(&cpf).await?;
    Ok(Json(CitizenResponse { view, source }))
}

// ---------------------------------------------------------------------------
// Overlay writes
// ---------------------------------------------------------------------------

/// Acknowledgement for a staged overlay write.
#[derive(Debug, Serialize)]
pub struct OverlayWriteResponse {
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct EnderecoInput {
    pub logradouro: String,
    pub numero: String,
    #[serde(default)]
    pub complemento: Option<String>,
    pub bairro: String,
    pub municipio: String,
    pub estado: String,
    #[serde(default)]
    pub cep: Option<String>,
}

impl EnderecoInput {
    fn validate(&self) -> Result<(), ApiError> {
        require_filled(&self.logradouro, "logradouro")?;
        require_filled(&self.numero, "numero")?;
        require_filled(&self.bairro, "bairro")?;
        require_filled(&self.municipio, "municipio")?;
        require_filled(&self.estado, "estado")?;
        if let Some(cep) = &self.cep {
            require_digits(cep, "cep")?;
        }
        Ok(())
    }

    fn into_endereco(self) -> Endereco {
        Endereco {
            logradouro: self.logradouro,
            numero: self.numero,
            complemento: self.complemento,
            bairro: self.bairro,
            municipio: self.municipio,
            estado: self.estado,
            cep: self.cep,
            updated_at: None,
        }
    }
}

pub async fn put_address(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
    Json(input): Json<EnderecoInput>,
) -> Result<Json<OverlayWriteResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    input.validate()?;

    let next = ctx
        .overlay
        .put(&cpf, OverlayPatch::Endereco(input.into_endereco()), &claims.actor())
        .await?;
    Ok(Json(OverlayWriteResponse {
        version: next.version,
        updated_at: next.updated_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EmailInput {
    pub valor: String,
}

pub async fn put_email(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
    Json(input): Json<EmailInput>,
) -> Result<Json<OverlayWriteResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    if !input.valor.contains('@') || input.valor.trim().is_empty() {
        return Err(ApiError::bad_request("valor must be an email address"));
    }

    let email = Email {
        valor: input.valor,
        updated_at: None,
    };
    let next = ctx
        .overlay
        .put(&cpf, OverlayPatch::Email(email), &claims.actor())
        .await?;
    Ok(Json(OverlayWriteResponse {
        version: next.version,
        updated_at: next.updated_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EtniaInput {
    pub valor: String,
}

pub async fn put_ethnicity(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
    Json(input): Json<EtniaInput>,
) -> Result<Json<OverlayWriteResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    require_filled(&input.valor, "valor")?;

    let etnia = Etnia {
        valor: input.valor,
        updated_at: None,
    };
    let next = ctx
        .overlay
        .put(&cpf, OverlayPatch::Etnia(etnia), &claims.actor())
        .await?;
    Ok(Json(OverlayWriteResponse {
        version: next.version,
        updated_at: next.updated_at,
    }))
}

// ---------------------------------------------------------------------------
// Phone verification
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PhoneInput {
    pub ddi: String,
    pub ddd: String,
    pub valor: String,
}

impl PhoneInput {
    fn validate(&self) -> Result<(), ApiError> {
        require_digits(&self.ddi, "ddi")?;
        require_digits(&self.ddd, "ddd")?;
        require_digits(&self.valor, "valor")?;
        Ok(())
    }

    fn into_telefone(self) -> Telefone {
        Telefone {
            ddi: self.ddi,
            ddd: self.ddd,
            valor: self.valor,
            updated_at: None,
        }
    }
}

pub async fn put_phone(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
    Json(input): Json<PhoneInput>,
) -> Result<Json<IssueOutcome>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    input.validate()?;

    let outcome = ctx
        .verifier
        .issue(&cpf, &input.into_telefone(), &claims.actor())
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct PhoneValidateInput {
    pub ddi: String,
    pub ddd: String,
    pub valor: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct PhoneValidateResponse {
    pub status: &'static str,
}

pub async fn validate_phone(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
    Json(input): Json<PhoneValidateInput>,
) -> Result<Json<PhoneValidateResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    require_digits(&input.ddi, "ddi")?;
    require_digits(&input.ddd, "ddd")?;
    require_digits(&input.valor, "valor")?;
    if input.code.len() != 6 {
        return Err(ApiError::bad_request("code must be six digits"));
    }
    require_digits(&input.code, "code")?;

    let telefone = Telefone {
        ddi: input.ddi,
        ddd: input.ddd,
        valor: input.valor,
        updated_at: None,
    };
    ctx.verifier
        .confirm(&cpf, &telefone, &input.code, &claims.actor())
        .await?;
    Ok(Json(PhoneValidateResponse {
        status: "confirmed",
    }))
}

/// Cancels whatever verification is pending for the CPF.
pub async fn cancel_phone(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
) -> Result<Json<PhoneValidateResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;

    let current = ctx.overlay.current(&cpf).await?;
    let Some(pending) = current.telefone_pendente else {
        return Err(ApiError::not_found("no pending phone for this CPF"));
    };

    ctx.verifier.cancel(&cpf, &pending, &claims.actor()).await?;
    Ok(Json(PhoneValidateResponse { status: "cancelled" }))
}

// ---------------------------------------------------------------------------
// User config
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct FirstLoginResponse {
    pub first_login: bool,
}

pub async fn get_first_login(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
) -> Result<Json<FirstLoginResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    let config = ctx.user_config.get(&cpf).await?;
    Ok(Json(FirstLoginResponse {
        first_login: config.first_login,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FirstLoginInput {
    pub first_login: bool,
}

pub async fn put_first_login(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
    Json(input): Json<FirstLoginInput>,
) -> Result<Json<FirstLoginResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    let next = ctx
        .user_config
        .put(&cpf, UserConfigPatch::FirstLogin(input.first_login), &claims.actor())
        .await?;
    Ok(Json(FirstLoginResponse {
        first_login: next.first_login,
    }))
}

#[derive(Debug, Serialize)]
pub struct OptInResponse {
    pub opt_in: bool,
    pub categorias: std::collections::HashMap<String, bool>,
}

pub async fn get_opt_in(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
) -> Result<Json<OptInResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    let config = ctx.user_config.get(&cpf).await?;
    Ok(Json(OptInResponse {
        opt_in: config.opt_in,
        categorias: config.opt_in_categorias,
    }))
}

#[derive(Debug, Deserialize)]
pub struct OptInInput {
    pub opt_in: bool,
    /// When present, toggles one category instead of the global flag.
    #[serde(default)]
    pub categoria: Option<String>,
}

pub async fn put_opt_in(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
    Json(input): Json<OptInInput>,
) -> Result<Json<OptInResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;

    let patch = match input.categoria {
        Some(categoria) => {
            require_filled(&categoria, "categoria")?;
            UserConfigPatch::OptInCategoria {
                categoria,
                opt_in: input.opt_in,
            }
        }
        None => UserConfigPatch::OptIn(input.opt_in),
    };

    let next = ctx.user_config.put(&cpf, patch, &claims.actor()).await?;
    Ok(Json(OptInResponse {
        opt_in: next.opt_in,
        categorias: next.opt_in_categorias,
    }))
}

#[derive(Debug, Serialize)]
pub struct AvatarResponse {
    pub avatar_id: Option<String>,
}

pub async fn get_avatar(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
) -> Result<Json<AvatarResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    let config = ctx.user_config.get(&cpf).await?;
    Ok(Json(AvatarResponse {
        avatar_id: config.avatar_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AvatarInput {
    pub avatar_id: Option<String>,
}

pub async fn put_avatar(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(cpf): Path<String>,
    Json(input): Json<AvatarInput>,
) -> Result<Json<AvatarResponse>, ApiError> {
    claims.authorize(&cpf, &ctx.config.auth.admin_role)?;
    let next = ctx
        .user_config
        .put(&cpf, UserConfigPatch::Avatar(input.avatar_id), &claims.actor())
        .await?;
    Ok(Json(AvatarResponse {
        avatar_id: next.avatar_id,
    }))
}

// ---------------------------------------------------------------------------
// Phone mapping (admin)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PhoneResolveResponse {
    pub cpf: String,
}

pub async fn resolve_phone(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(telefone): Path<String>,
) -> Result<Json<PhoneResolveResponse>, ApiError> {
    claims.require_admin(&ctx.config.auth.admin_role)?;
    require_digits(&telefone, "telefone")?;

    let mapping = match ctx.cache.get_phone_mapping(&telefone).await {
        Some(mapping) => Some(mapping),
        None => {
            let loaded = ctx.gateway.load_phone_mapping(&telefone).await?;
            if let Some(mapping) = &loaded {
                ctx.cache.put_phone_mapping(mapping).await;
            }
            loaded
        }
    };

    match mapping {
        Some(mapping) if mapping.is_resolvable() => Ok(Json(PhoneResolveResponse {
            cpf: mapping.cpf,
        })),
        _ => Err(ApiError::not_found("no active mapping for this phone")),
    }
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub status: &'static str,
}

/// Controller release of a quarantined mapping, allowed only after the
/// quarantine window elapsed.
pub async fn release_phone_mapping(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(telefone): Path<String>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    claims.require_admin(&ctx.config.auth.admin_role)?;
    require_digits(&telefone, "telefone")?;

    let Some(mut mapping) = ctx.gateway.load_phone_mapping(&telefone).await? else {
        return Err(ApiError::not_found("no mapping for this phone"));
    };

    let now = Utc::now();
    if !mapping.release_allowed(now) {
        return Err(ApiError::new(
            axum::http::StatusCode::CONFLICT,
            "quarantine_active",
            "mapping is not quarantined or the quarantine window has not elapsed",
        ));
    }

    mapping.release(now);
    ctx.cache.put_phone_mapping(&mapping).await;
    let mutation = PendingMutation::new(&telefone, MutationPayload::PhoneMapping(mapping));
    ctx.queue.enqueue(&mutation).await.map_err(|e| {
        ApiError::internal(format!("release could not be queued: {e}"))
    })?;

    ctx.audit
        .record(AuditRecord::new(
            claims.actor(),
            "phone_mapping.release",
            "phone_mapping",
            &telefone,
        ))
        .await;

    Ok(Json(ReleaseResponse { status: "released" }))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

pub async fn dead_letters(
    State(ctx): Ctx,
    Extension(claims): Extension<Claims>,
    Path(kind): Path<String>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    claims.require_admin(&ctx.config.auth.admin_role)?;
    let kind: MutationKind = kind
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;
    let letters = ctx
        .queue
        .dead_letters(kind)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(letters))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

pub async fn metrics(State(ctx): Ctx) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.monitor.render_metrics(),
    )
}
