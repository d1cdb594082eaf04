use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use sequencer_core::account_state::AccountState;
use sequencer_core::anchor::{InProcessAnchorSink, SequencerRepairer};
use sequencer_core::circuit_breaker::CircuitBreaker;
use sequencer_core::config::Config;
use sequencer_core::executor::Executor;
use sequencer_core::key_rotation::KeyRotationScheduler;
use sequencer_core::merkle::{MerkleEngine, MerkleOptions};
use sequencer_core::reconciler::{Reconciler, ReconcilerConfig};
use sequencer_core::ring_queue::RingQueue;
use sequencer_core::routes::{self, AppState};
use sequencer_core::sequencer::{Sequencer, SequencerConfig};
use sequencer_core::signing::{EmergencyLimits, SigningService};
use sequencer_core::store::build_store;
use sequencer_core::validator::Validator;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sequencer_core=info,tower_http=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[sequencer-core] configuration error: {e}");
            std::process::exit(1);
        }
    };

    if config.allowed_origins.is_empty() {
        if cfg!(debug_assertions) {
            warn!("SEQ_ALLOWED_ORIGINS not set — using permissive CORS (dev mode only)");
        } else {
            eprintln!("[sequencer-core] FATAL: SEQ_ALLOWED_ORIGINS must be set in production builds");
            std::process::exit(1);
        }
    }

    info!(
        host = %config.host,
        port = config.port,
        batch_size = config.batch_size,
        batch_window_ms = config.batch_window_ms,
        redis = config.redis_url.is_some(),
        origins = config.allowed_origins.len(),
        "starting sequencer-core"
    );

    let store = build_store(&config);
    store.spawn_eviction_task();

    let ring_queue = Arc::new(RingQueue::new(config.batch_size * config.max_concurrent_batches * 4));

    let account_state = Arc::new(AccountState::new());

    let validator = Arc::new(Validator::new(
        account_state.clone(),
        Duration::from_secs(config.nonce_cache_ttl_secs),
        config.rate_limit_per_sender_per_sec,
        config.max_transactions_per_second as u64,
    ));

    let executor = Arc::new(Executor::new(
        Duration::from_millis(config.signing_timeout_ms),
        config.max_retries,
        Duration::from_millis(config.retry_base_delay_ms),
    ));

    let merkle = Arc::new(
        MerkleEngine::new(
            Vec::new(),
            MerkleOptions {
                duplicate_odd: true,
                batch_size: config.merkle_cache_size,
                batch_debounce_ms: 100,
                proof_cache_size: config.merkle_proof_cache_size,
            },
        )
        .expect("empty-leaf merkle engine is always constructible"),
    );
    merkle.clone().spawn_batch_debounce();

    let signing = Arc::new(SigningService::new(
        EmergencyLimits {
            ttl: Duration::from_secs(config.emergency_key_ttl_minutes * 60),
            usage_cap: config.emergency_key_tx_limit,
        },
        config.max_retries,
        Duration::from_millis(config.retry_base_delay_ms),
    ));
    signing.clone().spawn_health_probe(Duration::from_secs(10));

    let rotation = Arc::new(KeyRotationScheduler::new(
        signing.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(config.rotation_interval_days * 24 * 3600),
        Duration::from_secs(config.rotation_overlap_hours * 3600),
    ));
    rotation.spawn();

    let admission_breaker = Arc::new(CircuitBreaker::new(
        config.circuit_breaker_threshold,
        Duration::from_millis(config.circuit_breaker_reset_ms),
    ));

    let anchor_sink = Arc::new(InProcessAnchorSink::new());

    let sequencer = Arc::new(Sequencer::new(
        ring_queue.clone(),
        account_state.clone(),
        validator.clone(),
        executor.clone(),
        merkle.clone(),
        signing.clone(),
        anchor_sink.clone(),
        store.clone(),
        admission_breaker.clone(),
        SequencerConfig {
            batch_size: config.batch_size,
            max_batch_window: Duration::from_millis(config.batch_window_ms),
            max_concurrent_batches: config.max_concurrent_batches,
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            worker_count: config.worker_count,
            priority_tier_count: config.priority_tier_count as u8,
            fairness_credit_limit: config.fairness_credit_limit,
            fairness_credit_window: Duration::from_secs(config.fairness_credit_window_secs),
        },
    ));
    sequencer.clone().spawn();

    let repairer = Arc::new(SequencerRepairer::new(
        sequencer.clone(),
        anchor_sink.clone(),
        store.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        anchor_sink.clone(),
        sequencer.clone(),
        repairer,
        admission_breaker.clone(),
        ReconcilerConfig {
            interval: Duration::from_millis(config.reconcile_interval_ms),
            max_attempts: config.max_reconciliation_attempts,
            circuit_breaker_threshold: config.circuit_breaker_threshold,
            circuit_breaker_reset: Duration::from_millis(config.circuit_breaker_reset_ms),
            snapshot_interval: Duration::from_secs(300),
            max_snapshots: 64,
        },
    ));
    reconciler.spawn();

    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                "x-api-key".parse().unwrap(),
            ])
    };

    let state = Arc::new(AppState {
        sequencer: sequencer.clone(),
        ring_queue: ring_queue.clone(),
        store: store.clone(),
        signing: signing.clone(),
        config: config.clone(),
    });

    let app = Router::new()
        .route("/health", axum::routing::get(routes::health))
        .route("/status", axum::routing::get(routes::status))
        .route("/submit", axum::routing::post(routes::submit))
        .route("/submit_batch", axum::routing::post(routes::submit_batch))
        .route("/status/{id}", axum::routing::get(routes::transaction_status))
        .route("/proof/{tx_id}", axum::routing::get(routes::proof))
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            "Referrer-Policy".parse::<header::HeaderName>().unwrap(),
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("invalid listen address");

    info!(addr = %addr, "sequencer-core listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await
    .expect("server error");

    info!("sequencer-core shut down");
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    let pending = state.ring_queue.size().await;
    if pending > 0 {
        info!(pending, "draining admission queue before shutdown");
        let drained = state.ring_queue.dequeue_batch(pending).await;
        info!(drained = drained.len(), "admission queue drained, in-flight batches left to finish");
    }
    state.ring_queue.close();
}
