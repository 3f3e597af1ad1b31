//! Administrative CLI for inspecting and nudging a running gateway core's
//! in-memory state: force a channel reload, inspect the current snapshot,
//! reset a model's circuit breaker, or list disabled API keys.
//!
//! Runs against the in-memory repositories by default, since this binary is
//! a local debugging aid rather than a production control plane -- a real
//! deployment drives these same operations through whatever RPC surface
//! fronts the embedding application.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use gateway_core::{
    GatewayCore, InMemoryChannelRepository, InMemoryPriceStore, InMemorySettingsCache,
    InMemorySettingsRepository, PerfConfig, RegistryConfig,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "admin")]
#[command(about = "Gateway core admin CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Force an immediate channel registry reload.
    Reload,

    /// Print the current enabled-channel snapshot.
    Inspect,

    /// Reset a model's circuit breaker to closed.
    ResetBreaker {
        channel_id: i64,
        model_id: String,
    },

    /// List every disabled API key, grouped by channel.
    ListDisabledKeys,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    // A bundled demo repository, seeded with one channel so the subcommands
    // have something to act on; a real deployment would wire this CLI to
    // the same Postgres pool as the running gateway instead.
    let channels = Arc::new(InMemoryChannelRepository::new());
    channels.seed(demo_channel());

    let core = GatewayCore::new(
        channels,
        Arc::new(InMemoryPriceStore::new()),
        Arc::new(InMemorySettingsRepository::new()),
        Arc::new(InMemorySettingsCache::new()),
        RegistryConfig::default(),
        PerfConfig::default(),
    )
    .await?;

    match cli.command {
        Commands::Reload => reload(&core).await?,
        Commands::Inspect => inspect(&core),
        Commands::ResetBreaker { channel_id, model_id } => reset_breaker(&core, channel_id, &model_id),
        Commands::ListDisabledKeys => list_disabled_keys(&core),
    }

    Ok(())
}

fn demo_channel() -> gateway_core::Channel {
    use gateway_core::models::{ChannelType, Credentials};
    gateway_core::Channel {
        id: 1,
        name: "demo".into(),
        channel_type: ChannelType::OpenAI,
        base_url: "https://api.openai.com".into(),
        credentials: Credentials::ApiKeys(vec!["demo-key".into()]),
        supported_models: vec!["gpt-4".into()],
        model_mappings: vec![],
        extra_model_prefix: None,
        disabled_api_keys: vec![],
        status: gateway_core::ChannelStatus::Enabled,
        ordering_weight: 0,
        updated_at: chrono::Utc::now(),
        error_message: None,
        override_params_raw: None,
    }
}

async fn reload(core: &GatewayCore) -> anyhow::Result<()> {
    let changed = core.registry.force_reload().await?;
    info!(changed, "registry reload complete");
    Ok(())
}

fn inspect(core: &GatewayCore) {
    let snapshots = core.registry.snapshots();
    println!("channels: {}", snapshots.len());
    for snap in snapshots.iter() {
        println!(
            "  id={} name={} weight={} enabled_keys={} status={:?}",
            snap.channel.id,
            snap.channel.name,
            snap.channel.ordering_weight,
            snap.cached_enabled_api_keys.len(),
            snap.channel.status,
        );
    }
}

fn reset_breaker(core: &GatewayCore, channel_id: i64, model_id: &str) {
    core.breaker.reset_model_status(channel_id, model_id);
    info!(channel_id, model_id, "circuit breaker reset");
}

fn list_disabled_keys(core: &GatewayCore) {
    let snapshots = core.registry.snapshots();
    let mut any = false;
    for snap in snapshots.iter() {
        for disabled in &snap.channel.disabled_api_keys {
            any = true;
            println!(
                "channel={} key={} disabled_at={} reason={}",
                snap.channel.id, disabled.key, disabled.disabled_at, disabled.reason
            );
        }
    }
    if !any {
        println!("no disabled keys in the current snapshot");
    }
}
