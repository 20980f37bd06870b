//! oipd daemon binary: boots the projection, template registry, ownership
//! engine, both backend adapters, the reference resolver, the sync loops,
//! and the HTTP query surface.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use oipd::api::state::{AppState, DaemonRecordSource, Inner};
use oipd::backend::arweave::ArweaveAdapter;
use oipd::backend::gun::GunAdapter;
use oipd::backend::BackendAdapter;
use oipd::config::AppConfig;
use oipd::deletion::DeletionRegistry;
use oipd::ownership::OwnershipEngine;
use oipd::projection::elasticsearch::{ElasticsearchProjection, EsConfig};
use oipd::projection::Projection;
use oipd::resolver::Resolver;
use oipd::signature;
use oipd::sync::{run_sync_loop, CreatorRegistrationLookup, RegistrationRegistry, SyncConfig};
use oipd::template::TemplateRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let format = match config.logging.format {
        oipd::config::LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        oipd::config::LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .with(format)
        .init();

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let es_config = EsConfig::from(&config.elasticsearch);
    let projection: Arc<dyn Projection> = Arc::new(ElasticsearchProjection::new(es_config)?);

    let templates = Arc::new(TemplateRegistry::new(projection.clone()));
    templates.rebuild().await?;

    let ownership = Arc::new(OwnershipEngine::new(
        config.auth.jwt_secret.clone(),
        config.admin.base_domain.clone(),
        config.admin.public_api_base_url.clone(),
    ));

    let node_wallet_public_key = config
        .auth
        .node_wallet_private_key_hex
        .as_deref()
        .map(signature::node_wallet_public_key_hex)
        .transpose()?;
    if let Some(public_key) = &node_wallet_public_key {
        tracing::info!(public_key, "node wallet configured");
    }

    let arweave = Arc::new(ArweaveAdapter::new(config.arweave.clone(), templates.clone())?);
    let gun = Arc::new(GunAdapter::new(config.gun.clone(), ownership.clone()));

    let deletions = Arc::new(DeletionRegistry::new(
        projection.clone(),
        ownership.clone(),
        node_wallet_public_key,
    ));

    let record_source = Arc::new(DaemonRecordSource {
        projection: projection.clone(),
        arweave: arweave.clone(),
        gun: gun.clone(),
    });
    let resolver = Arc::new(Resolver::new(
        record_source,
        config.resolver.cache_max_entries,
        config.resolver.cache_ttl_ms,
    ));

    let registrations = Arc::new(RegistrationRegistry::new());
    let registrations_for_state = registrations.clone() as Arc<dyn CreatorRegistrationLookup>;

    let cancel = CancellationToken::new();

    let arweave_sync = tokio::spawn(run_sync_loop(
        arweave.clone() as Arc<dyn BackendAdapter>,
        projection.clone(),
        templates.clone(),
        deletions.clone(),
        registrations.clone(),
        SyncConfig {
            poll_interval: std::time::Duration::from_secs(config.arweave.poll_interval_secs),
            max_in_flight_fetches: config.arweave.max_in_flight_fetches,
        },
        cancel.clone(),
    ));
    let gun_sync = tokio::spawn(run_sync_loop(
        gun.clone() as Arc<dyn BackendAdapter>,
        projection.clone(),
        templates.clone(),
        deletions.clone(),
        registrations,
        SyncConfig {
            poll_interval: std::time::Duration::from_secs(config.gun.poll_interval_secs.unwrap_or(10)),
            max_in_flight_fetches: config.arweave.max_in_flight_fetches,
        },
        cancel.clone(),
    ));

    let state = AppState(Arc::new(Inner {
        config: config.clone(),
        projection,
        templates,
        resolver,
        ownership,
        deletions,
        arweave,
        gun,
        registrations: registrations_for_state,
    }));
    let app = oipd::api::create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "oipd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = tokio::join!(arweave_sync, gun_sync);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
