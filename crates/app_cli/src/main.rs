use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use config::{AppConfig, ConfigStore};
use secrets::{TokenVault, default_session_dir_from};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod commands;

pub const PASSPHRASE_ENV: &str = "DOCQA_PASSPHRASE";

#[derive(Parser)]
#[command(name = "docqa")]
#[command(about = "Ask questions about your documents", long_about = None)]
struct Cli {
    /// Directory holding config.json (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Directory for the session token and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an account
    Register {
        username: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Sign in and remember the session
    Login {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the local session
    Logout,
    /// Show the signed-in profile
    Whoami,
    /// Manage uploaded documents
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },
    /// Ask one question
    Ask {
        question: String,
        #[arg(long)]
        top_k: Option<u32>,
        /// Restrict retrieval to these document ids
        #[arg(long = "doc")]
        documents: Vec<i64>,
    },
    /// Interactive question/answer session
    Chat,
    /// Update profile and LLM settings; only the given fields change
    Settings {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        openai_key: Option<String>,
        #[arg(long)]
        anthropic_key: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        endpoint_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Backend health and session state
    Status,
}

#[derive(Subcommand)]
pub enum DocsAction {
    /// List documents and their processing status
    List,
    /// Upload a file
    Upload { path: PathBuf },
    /// Delete a document
    Delete { id: i64 },
    /// Show one document
    Show { id: i64 },
    /// Refresh until every document has finished processing
    Watch {
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => {
            let mut dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
            dir.push("docqa");
            dir
        }
    };
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("failed to prepare data dir: {err}");
    }
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let config_store = match cli.config_dir.clone() {
        Some(dir) => ConfigStore::from_dir(dir),
        None => ConfigStore::from_default_location()?,
    };
    let config = match config_store.load_effective() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err:#}");
            let mut cfg = AppConfig::default();
            cfg.apply_env_overrides();
            cfg
        }
    };
    let vault = open_vault(&config, &data_dir, |key| std::env::var(key).ok())?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    runtime.block_on(async move {
        info!(base_url = %config.api.base_url, "docqa starting");
        let shell = commands::Shell::open(config, vault).await?;
        shell.run(cli.command).await
    })
}

fn open_vault(
    config: &AppConfig,
    data_dir: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<TokenVault> {
    let vault = TokenVault::new(default_session_dir_from(data_dir));
    if !config.security.encrypt_token {
        return Ok(vault);
    }
    match lookup(PASSPHRASE_ENV) {
        Some(passphrase) if !passphrase.is_empty() => Ok(vault.with_passphrase(Some(passphrase))),
        _ => bail!("token encryption is enabled; set {PASSPHRASE_ENV}"),
    }
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "docqa.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,app_cli=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}
