//! `relaydock status`: probe the agent server once.
//! `relaydock recent`: list recent conversations.

use std::path::Path;

use relaydock_connector::{ConversationApi, HealthProbe, HealthStatus};

use crate::chat::format_recent;
use crate::config::Config;
use crate::paths;
use crate::VERSION;

pub async fn run(config: &Config, data_dir: &Path) -> anyhow::Result<()> {
    println!();
    println!("  relaydock v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    let config_path = paths::config_path(data_dir);
    if config_path.exists() {
        println!("  Config: {}", config_path.display());
    } else {
        println!("  Config: not found (using defaults)");
    }
    println!("  Log: {}", paths::log_dir(data_dir).join("relaydock.log").display());
    println!("  Server: {}", config.server_url);

    let probe = HealthProbe::new(&config.server_url, config.health_timeout())?;
    let status = probe.check().await;
    match &status {
        HealthStatus::Healthy => println!("  Health: OK"),
        HealthStatus::Unhealthy { reason } => println!("  Health: {}", reason),
        HealthStatus::Unknown => println!("  Health: unknown"),
    }

    println!();
    if !status.is_healthy() {
        println!("  Agent server is not reachable.");
        println!(
            "  Set server_url in {} or pass --server-url.",
            config_path.display()
        );
        println!();
    }
    Ok(())
}

pub async fn recent(config: &Config) -> anyhow::Result<()> {
    let api = ConversationApi::new(&config.server_url, config.request_timeout())?;
    let conversations = api.recent_conversations().await?;
    println!("{}", format_recent(&conversations));
    Ok(())
}
