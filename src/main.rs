use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use axum::routing::post;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use gha_fleet::api::{self, ApiState};
use gha_fleet::backoff::SystemClock;
use gha_fleet::config::Config;
use gha_fleet::controller::{Controller, ControllerDeps};
use gha_fleet::crypto::SecretCipher;
use gha_fleet::error::Error;
use gha_fleet::github::GithubForgeFactory;
use gha_fleet::openstack::OpenStackProvider;
use gha_fleet::pool::PoolManagerConfig;
use gha_fleet::provider::Provider;
use gha_fleet::webhook::{self, WebhookState};
use gha_fleet::{forge::ForgeFactory, store};

const EXIT_CONFIG: u8 = 1;
const EXIT_STORE: u8 = 2;
const EXIT_FORGE_AUTH: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load("config") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let _log_guard = init_tracing(&config);
    let config = Arc::new(config);

    let cipher = SecretCipher::new(&config.passphrase);
    let store = match store::open(&config.store, cipher) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "store is unavailable");
            return ExitCode::from(EXIT_STORE);
        }
    };

    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for cloud in &config.openstack {
        match OpenStackProvider::new(&cloud.cloud, &config.runner_prefix).await {
            Ok(provider) => {
                providers.insert(cloud.name.clone(), Arc::new(provider));
            }
            Err(e) => {
                tracing::error!(provider = %cloud.name, error = %e, "provider failed to initialize");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }

    let forge_factory = Arc::new(GithubForgeFactory::new(
        &config.credentials,
        config.webhook_url(),
    ));

    let entities = match store.list_entities().await {
        Ok(entities) => entities,
        Err(e) => {
            tracing::error!(error = %e, "store is unavailable");
            return ExitCode::from(EXIT_STORE);
        }
    };

    // fail fast on credentials that cannot talk to the forge at all
    for entity in &entities {
        let client = match forge_factory.for_entity(entity) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(entity = %entity.name, error = %e, "building forge client failed");
                return ExitCode::from(EXIT_CONFIG);
            }
        };
        match client.list_runners().await {
            Ok(_) => {}
            Err(Error::Unauthorized) | Err(Error::Forbidden(_)) => {
                tracing::error!(entity = %entity.name, "forge rejected the configured credentials");
                return ExitCode::from(EXIT_FORGE_AUTH);
            }
            Err(e) => {
                tracing::warn!(entity = %entity.name, error = %e, "forge not reachable at boot");
            }
        }
    }

    let controller = Controller::spawn(ControllerDeps {
        store: store.clone(),
        providers,
        forge_factory,
        manager_config: PoolManagerConfig::from_tuning(config.runner_prefix.clone(), &config.tuning),
        clock: Arc::new(SystemClock),
    });
    for entity in entities {
        let name = entity.name.clone();
        if let Err(e) = controller.load(entity).await {
            tracing::error!(entity = %name, error = %e, "loading pool manager failed");
        }
    }

    let webhook_state = WebhookState::new(controller.clone(), config.tuning.webhook_dedup_window);
    let api_state = ApiState {
        controller: controller.clone(),
        store,
        config: config.clone(),
        controller_id: uuid::Uuid::new_v4().to_string(),
    };
    let app = Router::new()
        .route("/webhook", post(webhook::handle_webhook))
        .with_state(webhook_state)
        .merge(Router::new().nest("/api/v1", api::router().with_state(api_state)));

    if let Err(e) = serve(app, &config.listen).await {
        tracing::error!(error = %e, "server failed");
        return ExitCode::from(EXIT_CONFIG);
    }

    tracing::info!("draining pool managers");
    controller.shutdown().await;
    ExitCode::SUCCESS
}

async fn serve(app: Router, listen: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(listen, "gha-fleet is serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let registry = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(EnvFilter::from_default_env());

    match &config.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "gha-fleet.log".to_string());
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
