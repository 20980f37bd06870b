//! Read-only query-node deployment mode: serves `GET /records`,
//! `GET /templates`, and the health routes against the same projection a
//! full daemon maintains, without running sync loops or exposing any write
//! route.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use oipd::api::state::{AppState, DaemonRecordSource, Inner};
use oipd::backend::arweave::ArweaveAdapter;
use oipd::backend::gun::GunAdapter;
use oipd::config::AppConfig;
use oipd::deletion::DeletionRegistry;
use oipd::ownership::OwnershipEngine;
use oipd::projection::elasticsearch::{ElasticsearchProjection, EsConfig};
use oipd::projection::Projection;
use oipd::resolver::Resolver;
use oipd::sync::{CreatorRegistrationLookup, RegistrationRegistry};
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

    let es_config = EsConfig::from(&config.elasticsearch);
    let projection: Arc<dyn Projection> = Arc::new(ElasticsearchProjection::new(es_config)?);

    let templates = Arc::new(TemplateRegistry::new(projection.clone()));
    templates.rebuild().await?;

    let ownership = Arc::new(OwnershipEngine::new(
        config.auth.jwt_secret.clone(),
        config.admin.base_domain.clone(),
        config.admin.public_api_base_url.clone(),
    ));

    // Still needed as a fetch fallback for references the local projection
    // hasn't caught up to yet; never put-to or deleted-from in this mode.
    let arweave = Arc::new(ArweaveAdapter::new(config.arweave.clone(), templates.clone())?);
    let gun = Arc::new(GunAdapter::new(config.gun.clone(), ownership.clone()));

    let deletions = Arc::new(DeletionRegistry::new(projection.clone(), ownership.clone(), None));

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

    // Query-only mode never registers templates or drains pending records,
    // but `Inner` still needs a lookup to satisfy its shape.
    let registrations = Arc::new(RegistrationRegistry::new()) as Arc<dyn CreatorRegistrationLookup>;

    let state = AppState(Arc::new(Inner {
        config: config.clone(),
        projection,
        templates,
        resolver,
        ownership,
        deletions,
        arweave,
        gun,
        registrations,
    }));
    let app = oipd::api::create_query_only_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "oipd query-node listening");

    axum::serve(listener, app).await?;

    Ok(())
}
