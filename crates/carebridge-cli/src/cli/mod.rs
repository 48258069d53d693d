//! CLI entry and dispatch.

use anyhow::{Context, Result};
use carebridge_core::config::{self, Config};
use carebridge_core::session::{
    ChatSession, SessionEventRx, SessionOptions, create_event_channel,
};
use carebridge_core::transport::HttpTransport;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod commands;
mod render;

#[derive(Parser)]
#[command(name = "carebridge")]
#[command(version)]
#[command(about = "Chat with the CareBridge clinical assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Backend base URL (overrides CAREBRIDGE_API_BASE and config)
    #[arg(long, global = true, value_name = "URL")]
    api_base: Option<String>,

    /// FHIR bearer token forwarded with every request
    #[arg(long, global = true, value_name = "TOKEN")]
    token: Option<String>,

    /// Log filter, e.g. `debug` or `carebridge_core=trace` (RUST_LOG wins)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start an interactive chat (default)
    Chat,
    /// Send a single message and stream the answer
    Ask {
        /// The message to send
        #[arg(short, long)]
        prompt: String,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

/// Connection settings given on the command line.
struct Overrides {
    api_base: Option<String>,
    token: Option<String>,
}

impl Overrides {
    /// Loads config, applies overrides and builds an idle session.
    fn session(&self) -> Result<(ChatSession<HttpTransport>, SessionEventRx)> {
        let mut config = Config::load().context("load config")?;
        if let Some(token) = self.token.as_deref() {
            config.token = Some(token.to_string());
        }

        let api_root = config.api_root_with(self.api_base.as_deref())?;
        let token = config.token()?;
        let transport = HttpTransport::new(&api_root, config.connect_timeout())?;
        tracing::info!(chat_url = %transport.chat_url(), "Session configured");

        let (events_tx, events_rx) = create_event_channel();
        let session = ChatSession::new(
            transport,
            token,
            SessionOptions::from_config(&config),
            events_tx,
        );
        Ok((session, events_rx))
    }
}

pub fn run() -> Result<()> {
    let Cli {
        command,
        api_base,
        token,
        log_level,
    } = Cli::parse();

    // default to chat mode
    let command = command.unwrap_or(Commands::Chat);
    let _log_guard = init_logging(&log_level, matches!(command, Commands::Chat))?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    let overrides = Overrides { api_base, token };
    rt.block_on(async move { dispatch(command, overrides).await })
}

async fn dispatch(command: Commands, overrides: Overrides) -> Result<()> {
    match command {
        Commands::Chat => {
            let (session, events) = overrides.session()?;
            commands::chat::run(session, events).await
        }
        Commands::Ask { prompt } => {
            let (session, events) = overrides.session()?;
            commands::ask::run(session, events, &prompt).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}

/// Installs the global subscriber.
///
/// Interactive chat owns the terminal, so its logs go to
/// `${CAREBRIDGE_HOME}/logs/carebridge.log`; everything else logs to stderr.
/// The returned guard flushes the file writer on drop.
fn init_logging(level: &str, to_file: bool) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;

    if to_file {
        let dir = config::paths::logs_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create log directory {}", dir.display()))?;
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, "carebridge.log"));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .try_init()
            .context("init logging")?;
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .context("init logging")?;
        Ok(None)
    }
}
