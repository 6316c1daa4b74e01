//! End-to-end flows over the in-memory backends: read-your-writes, merge
//! precedence, negative caching, stampede protection, degraded mode.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use civitas::app::App;
use civitas::cache::ViewSource;
use civitas::config::ServiceConfig;
use civitas::kv::{KeyValueStore, MemoryKv};
use civitas::merge::Provenance;
use civitas::models::citizen::{Citizen, Email, Endereco, Principal};
use civitas::models::overlay::OverlayPatch;
use civitas::models::MutationKind;
use civitas::notifier::{CodeNotifier, RecordingNotifier};
use civitas::store::{Collection, DocumentBackend, MemoryBackend, StoredDocument};
use civitas::ServiceError;

struct TestApp {
    app: App,
    backend: Arc<MemoryBackend>,
}

fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.queue.workers_per_kind = 1;
    config.queue.pop_timeout_secs = 1;
    config.queue.backoff_base_ms = 20;
    config.queue.backoff_jitter_ms = 0;
    config
}

fn build(config: ServiceConfig) -> TestApp {
    let kv = Arc::new(MemoryKv::new());
    let backend = Arc::new(MemoryBackend::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let app = App::assemble(
        config,
        kv as Arc<dyn KeyValueStore>,
        backend.clone() as Arc<dyn DocumentBackend>,
        notifier as Arc<dyn CodeNotifier>,
    );
    TestApp { app, backend }
}

fn seed_base(backend: &MemoryBackend, cpf: &str, email: &str, bairro: &str) {
    let mut citizen = Citizen::new(cpf);
    citizen.email = Principal {
        principal: Some(Email {
            valor: email.to_string(),
            updated_at: Some(Utc::now()),
        }),
        alternativo: vec![],
    };
    citizen.endereco = Principal {
        principal: Some(Endereco {
            logradouro: "Av. Atlântica".to_string(),
            numero: "100".to_string(),
            complemento: None,
            bairro: bairro.to_string(),
            municipio: "Rio de Janeiro".to_string(),
            estado: "RJ".to_string(),
            cep: None,
            updated_at: Some(Utc::now()),
        }),
        alternativo: vec![],
    };
    backend.seed(
        Collection::Citizens,
        cpf,
        StoredDocument::new(0, serde_json::to_value(&citizen).unwrap()),
    );
}

async fn drain_queue(t: &TestApp, kind: MutationKind) {
    for _ in 0..200 {
        if t.app.context.queue.depth(kind).await.unwrap() == 0 {
            // One extra tick so the in-flight element finishes applying.
            tokio::time::sleep(Duration::from_millis(40)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("queue {kind} did not drain");
}

#[tokio::test]
async fn test_read_your_writes_before_store_applies() {
    let t = build(test_config());
    seed_base(&t.backend, "12345678901", "old@x.com", "Copacabana");

    // Workers are NOT running: the store cannot have applied anything.
    let ctx = &t.app.context;
    ctx.overlay
        .put(
            "12345678901",
            OverlayPatch::Email(Email {
                valor: "new@x.com".to_string(),
                updated_at: None,
            }),
            "12345678901",
        )
        .await
        .unwrap();

    let (view, _) = ctx.cache.get_merged("12345678901").await.unwrap();
    let email = view.email.unwrap();
    assert_eq!(email.value.valor, "new@x.com");
    assert_eq!(email.source, Provenance::SelfDeclared);

    // The store still has no overlay.
    assert!(ctx.gateway.load_overlay("12345678901").await.unwrap().is_none());
}

#[tokio::test]
async fn test_overlay_overrides_base_and_drains() {
    let mut t = build(test_config());
    seed_base(&t.backend, "12345678901", "old@x.com", "Copacabana");

    let ctx = t.app.context.clone();
    ctx.overlay
        .put(
            "12345678901",
            OverlayPatch::Email(Email {
                valor: "new@x.com".to_string(),
                updated_at: None,
            }),
            "12345678901",
        )
        .await
        .unwrap();

    t.app.start_background();
    drain_queue(&t, MutationKind::OverlayUpsert).await;
    t.app.shutdown().await;

    // After drain the stored overlay carries version 1.
    let stored = ctx.gateway.load_overlay("12345678901").await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.email.unwrap().valor, "new@x.com");

    let (view, _) = ctx.cache.get_merged("12345678901").await.unwrap();
    assert_eq!(view.email.unwrap().value.valor, "new@x.com");
}

#[tokio::test]
async fn test_address_overridden_email_from_base() {
    let t = build(test_config());
    seed_base(&t.backend, "12345678901", "a@b", "Copacabana");

    let ctx = &t.app.context;
    ctx.overlay
        .put(
            "12345678901",
            OverlayPatch::Endereco(Endereco {
                logradouro: "Rua Dias Ferreira".to_string(),
                numero: "50".to_string(),
                complemento: None,
                bairro: "Leblon".to_string(),
                municipio: "Rio de Janeiro".to_string(),
                estado: "RJ".to_string(),
                cep: None,
                updated_at: None,
            }),
            "12345678901",
        )
        .await
        .unwrap();

    let (view, _) = ctx.cache.get_merged("12345678901").await.unwrap();

    let endereco = view.endereco.unwrap();
    assert_eq!(endereco.value.bairro, "Leblon");
    assert_eq!(endereco.source, Provenance::SelfDeclared);

    let email = view.email.unwrap();
    assert_eq!(email.value.valor, "a@b");
    assert_eq!(email.source, Provenance::Base);
}

#[tokio::test]
async fn test_unknown_cpf_served_from_negative_cache() {
    let t = build(test_config());
    let ctx = &t.app.context;

    let err = ctx.cache.get_merged("99999999999").await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    let reads = t.backend.reads(Collection::Citizens);

    for _ in 0..5 {
        let err = ctx.cache.get_merged("99999999999").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
    assert_eq!(t.backend.reads(Collection::Citizens), reads);
}

#[tokio::test]
async fn test_concurrent_misses_fetch_once() {
    let t = build(test_config());
    seed_base(&t.backend, "12345678901", "a@b", "Copacabana");
    let ctx = t.app.context.clone();

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            ctx.cache.get_merged("12345678901").await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    assert_eq!(t.backend.reads(Collection::Citizens), 1);
}

#[tokio::test]
async fn test_degraded_mode_reads() {
    let mut config = test_config();
    config.monitor.failure_threshold = 2;
    let t = build(config);
    seed_base(&t.backend, "22222222222", "a@b", "Copacabana");

    let ctx = &t.app.context;
    // Warm the cache for 222...
    let _ = ctx.cache.get_merged("22222222222").await.unwrap();

    // Store goes down; the controller notices after two probes.
    t.backend.set_unavailable(true);
    ctx.monitor.poll_once().await;
    ctx.monitor.poll_once().await;
    assert!(ctx.monitor.is_degraded());

    let (_, source) = ctx.cache.get_merged("22222222222").await.unwrap();
    assert_eq!(source, ViewSource::Degraded);

    // Nothing cached for 333...: surfaced as store-unavailable (503).
    let err = ctx.cache.get_merged("33333333333").await.unwrap_err();
    assert!(err.is_store_unavailable());

    // Writes are still accepted while degraded.
    ctx.overlay
        .put(
            "22222222222",
            OverlayPatch::Email(Email {
                valor: "while-down@x.com".to_string(),
                updated_at: None,
            }),
            "22222222222",
        )
        .await
        .unwrap();
    assert_eq!(
        ctx.queue.depth(MutationKind::OverlayUpsert).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_audit_records_flow_through_queue() {
    let mut t = build(test_config());
    seed_base(&t.backend, "12345678901", "a@b", "Copacabana");

    let ctx = t.app.context.clone();
    ctx.overlay
        .put(
            "12345678901",
            OverlayPatch::Email(Email {
                valor: "new@x.com".to_string(),
                updated_at: None,
            }),
            "12345678901",
        )
        .await
        .unwrap();

    t.app.start_background();
    drain_queue(&t, MutationKind::AuditRecord).await;
    t.app.shutdown().await;

    // The audit record reached the store.
    assert_eq!(t.backend.count(Collection::AuditLogs), 1);
    assert_eq!(
        t.app.context.queue.depth(MutationKind::AuditRecord).await.unwrap(),
        0
    );
}
