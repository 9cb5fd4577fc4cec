use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use gandalf_providers::{HttpClient, HttpClientConfig, Provider, ProviderRegistry, build_provider};
use gandalf_server::{GatewayConfig, build_state, router};
use gandalf_storage::{ApiKeyRecord, MemoryStore, ProviderRecord, ProviderStore};

mod config;

use config::{parse_provider, parse_route};

/// Multi-tenant LLM gateway.
#[derive(Debug, Parser)]
#[command(name = "gandalf", version)]
struct Args {
    #[arg(long, env = "GANDALF_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "GANDALF_PORT", default_value_t = 8787)]
    port: u16,

    /// Provider spec `name=kind,base_url[,api_key]`; repeatable.
    #[arg(long = "provider", value_name = "SPEC")]
    providers: Vec<String>,

    /// Route spec `alias=provider:upstream_model[:priority][;...]`; repeatable.
    #[arg(long = "route", value_name = "SPEC")]
    routes: Vec<String>,

    #[arg(long, env = "GANDALF_DEFAULT_RPM", default_value_t = 60)]
    default_rpm: u32,

    #[arg(long, env = "GANDALF_DEFAULT_TPM", default_value_t = 100_000)]
    default_tpm: u32,

    #[arg(long, env = "GANDALF_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if args.providers.is_empty() {
        bail!("at least one --provider is required");
    }

    let store = Arc::new(MemoryStore::new());
    let mut provider_records: Vec<ProviderRecord> = Vec::new();
    for spec in &args.providers {
        provider_records.push(parse_provider(spec)?);
    }
    store.set_providers(provider_records).await;
    for spec in &args.routes {
        let route = parse_route(spec)?;
        store.insert_route(route).await;
    }
    seed_bootstrap_key(&store).await;

    let registry = Arc::new(ProviderRegistry::new());
    registry.replace(build_providers(&store).await?);

    let (state, runner) = build_state(
        store,
        registry,
        GatewayConfig {
            default_rpm: args.default_rpm,
            default_tpm: args.default_tpm,
            ..GatewayConfig::default()
        },
    );
    let app = router(state);

    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight HTTP is done; drain the workers (usage recorder last-mile).
    runner
        .shutdown(Duration::from_secs(args.shutdown_timeout_secs))
        .await;
    Ok(())
}

async fn build_providers(store: &Arc<MemoryStore>) -> Result<Vec<Arc<dyn Provider>>> {
    let pooled = HttpClient::new(HttpClientConfig::default())?;
    let local = HttpClient::new(HttpClientConfig {
        http1_only: true,
        ..HttpClientConfig::default()
    })?;

    let mut providers = Vec::new();
    for record in store.providers().await? {
        if !record.enabled {
            continue;
        }
        providers.push(build_provider(&record, &pooled, &local)?);
    }
    Ok(providers)
}

/// Single-process default: mint one member key at startup and print the
/// plaintext once. Real key management lives behind the admin surface.
async fn seed_bootstrap_key(store: &Arc<MemoryStore>) {
    let minted = gandalf_common::mint_key();
    store
        .insert_key(ApiKeyRecord {
            id: 1,
            key_hash: minted.hash.clone(),
            key_prefix: minted.display_prefix.clone(),
            org_id: None,
            team_id: None,
            user_id: None,
            role: gandalf_common::Role::Member,
            limits: Default::default(),
            allowed_models: None,
            expires_at: None,
            blocked: false,
        })
        .await;
    println!("bootstrap api key: {}", minted.plaintext);
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
