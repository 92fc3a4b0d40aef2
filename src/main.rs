use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::credential::{CommandCredentialProvider, EnvCredentialProvider, StaticCredentialProvider};
use crate::api::http::HttpTransport;
use crate::api::{ApiClient, CredentialProvider, MemoryTransport, Transport};
use crate::app::App;
use crate::cache::CachePolicy;
use crate::config::{AppConfig, KeyResolver};
use crate::model::Scope;
use crate::tls::{TlsDiagnostics, TlsVerify};

mod api;
mod app;
mod cache;
mod cli;
mod commands;
mod config;
mod dispatch;
mod model;
mod nav;
mod screens;
mod search;
mod theme;
mod tls;
mod tui;
mod ui;

pub use theme::Theme;

const DEMO_ENDPOINT: &str = "demo data";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let _guard = initialize_logging()?;
    info!("Starting anvil");

    let args = cli::Args::parse();
    let config = config::load()?;
    let endpoint = args.endpoint.clone().or_else(|| config.api.endpoint.clone());

    if args.diagnose_tls {
        return diagnose_tls(endpoint.as_deref(), &config).await;
    }

    let (transport, credentials, endpoint): (Arc<dyn Transport>, Arc<dyn CredentialProvider>, String) =
        match endpoint.filter(|_| !args.demo) {
            Some(url) => {
                let transport = HttpTransport::new(&url, &TlsVerify::from_env(), connect_timeout(&config))?;
                (Arc::new(transport), credential_provider(&config), url)
            }
            None => {
                info!("No endpoint configured, serving demo data");
                (
                    Arc::new(MemoryTransport::demo()),
                    Arc::new(StaticCredentialProvider::new(["demo"])),
                    DEMO_ENDPOINT.to_string(),
                )
            }
        };

    let client = Arc::new(ApiClient::from_config(&config.api, transport, credentials));
    let policy = CachePolicy::from_config(&config.cache, &config.api);
    let resolver = Arc::new(KeyResolver::new(Arc::new(config.keybindings.clone())));
    let theme = theme::theme_from_name(&config.theme.name);
    let resume = args.scope.or(config.last_selection).map(Scope::new);

    let mut app = App::new(client, policy, resolver, theme, endpoint, resume);
    app.run().await?;

    Ok(())
}

fn credential_provider(config: &AppConfig) -> Arc<dyn CredentialProvider> {
    match &config.auth.token_command {
        Some(command) => Arc::new(CommandCredentialProvider::new(command.clone())),
        None => Arc::new(EnvCredentialProvider::new(config.auth.token_env.clone())),
    }
}

fn connect_timeout(config: &AppConfig) -> Duration {
    Duration::from_millis(config.api.timeout_ms)
}

async fn diagnose_tls(endpoint: Option<&str>, config: &AppConfig) -> Result<()> {
    let mut diagnostics = TlsDiagnostics::from_env(endpoint.unwrap_or("(no endpoint configured)"));
    if let Some(url) = endpoint {
        let result = match HttpTransport::new(url, &TlsVerify::from_env(), connect_timeout(config)) {
            Ok(transport) => transport.check_connection().await,
            Err(err) => Err(err.to_string()),
        };
        diagnostics.record_connection(result);
    }
    println!("{diagnostics}");
    Ok(())
}

fn initialize_logging() -> Result<WorkerGuard> {
    let directory = dirs::data_local_dir().map_or_else(
        || std::path::PathBuf::from("logs"),
        |path| path.join("anvil").join("logs"),
    );
    std::fs::create_dir_all(&directory)?;

    let file_appender = tracing_appender::rolling::daily(&directory, "anvil.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("anvil=info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true),
        )
        .init();

    Ok(guard)
}
