use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use route_kit::bootstrap::CorsConfig;
use route_kit::middleware::from_fn;
use route_kit::{create_app, AppConfig, AppOptions, ControllerClass, RouteRequest, Toggle};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod controllers;
mod dtos;

use controllers::{Health, Users};

/// Example user service built on route_kit.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// JSON file with the application settings; flags below override it.
    #[arg(long, env = "APP_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "ROUTE_PREFIX")]
    prefix: Option<String>,

    /// Allow cross-origin requests from any origin.
    #[arg(long)]
    cors: bool,
}

impl Cli {
    fn app_config(&self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            None => AppConfig {
                route_prefix: "/api".into(),
                security_headers: Toggle::On,
                logging: Toggle::On,
                cookies: true,
                not_found: true,
                handler_timeout_ms: Some(10_000),
                ..AppConfig::default()
            },
        };
        if let Some(prefix) = &self.prefix {
            config.route_prefix = prefix.clone();
        }
        if self.cors {
            config.cors = Toggle::Custom(CorsConfig {
                origins: vec!["*".into()],
                ..CorsConfig::default()
            });
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,route_kit=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.app_config()?;
    let prefix = config.route_prefix.clone();

    let app = create_app(
        AppOptions::new([ControllerClass::of::<Users>(), ControllerClass::of::<Health>()])
            .middleware(from_fn(|req: &mut RouteRequest| {
                debug!(method = %req.method, path = req.path(), "incoming request");
                Ok(None)
            }))
            .config(config),
    )?;

    let address = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {}", address))?;
    info!(%address, %prefix, "user service listening");
    axum::serve(listener, app).await?;
    Ok(())
}
