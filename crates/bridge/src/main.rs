//! relaydock
//!
//! Local runtime bridge for a remote coding agent: chats with the agent
//! server and executes the file and shell actions it delegates to this
//! machine.

mod chat;
mod cmd_status;
mod config;
mod conversation;
mod conversation_command;
mod dispatch;
mod health_monitor;
mod logging;
mod paths;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::conversation::ConversationManager;

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

const VIEW_BUFFER: usize = 256;

#[derive(Parser)]
#[command(name = "relaydock", version, about = "Local runtime bridge for a remote coding agent")]
struct Cli {
    /// Data directory (default: $RELAYDOCK_DATA_DIR or ~/.relaydock)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Agent server base URL
    #[arg(long, global = true, env = "RELAYDOCK_SERVER_URL")]
    server_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat with the agent (default)
    Chat {
        /// Directory delegated actions run in
        #[arg(long, env = "RELAYDOCK_WORKSPACE")]
        workspace: Option<PathBuf>,
    },
    /// Check whether the agent server is reachable
    Status,
    /// List recent conversations
    Recent,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = paths::resolve_data_dir(cli.data_dir.as_deref())?;
    paths::ensure_dirs(&data_dir)?;

    let mut config = Config::load(&paths::config_path(&data_dir))?;
    if let Some(url) = cli.server_url {
        config.server_url = url;
    }
    let command = cli.command.unwrap_or(Command::Chat { workspace: None });
    if let Command::Chat {
        workspace: Some(dir),
    } = &command
    {
        config.workspace_dir = Some(dir.clone());
    }
    config.validate()?;

    let logging = logging::init_logging(&data_dir, logging::LogSettings::from_env())?;
    info!(
        component = "main",
        event = "main.start",
        run_id = %logging.run_id,
        version = VERSION,
        server_url = %config.server_url,
        data_dir = %data_dir.display(),
        "relaydock starting"
    );

    match command {
        Command::Chat { .. } => run_chat(&config).await,
        Command::Status => cmd_status::run(&config, &data_dir).await,
        Command::Recent => cmd_status::recent(&config).await,
    }
}

async fn run_chat(config: &Config) -> anyhow::Result<()> {
    let (view_tx, view_rx) = mpsc::channel(VIEW_BUFFER);
    let manager = ConversationManager::from_config(config, view_tx)?;
    let (handle, task) = manager.spawn();

    chat::run(handle, view_rx).await?;
    task.await?;
    Ok(())
}
