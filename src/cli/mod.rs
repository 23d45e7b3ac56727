#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use crate::config::{self, Config};
use crate::queue;
use crate::task::TaskManager;
use crate::task::model::{TaskState, content_type_for_path};
use crate::task::worker::{CommandProcessor, Worker, WorkerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "segtask",
    version,
    about = "Queue images for segmentation and collect the masks"
)]
pub struct Cli {
    /// Config file (defaults to ~/.config/segtask/config.toml)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Log level override (trace, debug, info, warn, error)
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Submit(SubmitArgs),
    Status(StatusArgs),
    #[command(name = "result")]
    Fetch(FetchArgs),
    Worker(WorkerArgs),
    Queue(QueueArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
}

#[derive(Debug, Parser)]
pub struct SubmitArgs {
    /// Image file to upload
    pub file: PathBuf,
    /// MIME type of the image (guessed from the file name when omitted)
    #[arg(short = 't', long = "content-type")]
    pub content_type: Option<String>,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    pub id: String,
    /// Output as JSON
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct FetchArgs {
    pub id: String,
    /// Write the result here instead of stdout
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct WorkerArgs {
    /// Number of tasks processed at once
    #[arg(short = 'p', long = "parallel")]
    pub parallel: Option<usize>,
    /// Keep waiting for new tasks when the queue is empty
    #[arg(long = "wait")]
    pub wait: bool,
}

#[derive(Debug, Parser)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub cmd: QueueCmd,
}

#[derive(Debug, Subcommand)]
pub enum QueueCmd {
    /// Number of ids waiting in the queue
    Len,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Get(ConfigGetArgs),
    Path,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    id: &'a str,
    state: TaskState,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = run(cli).await;
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if let Commands::Completion(args) = &cli.cmd {
        let mut cmd = Cli::command();
        clap_complete::generate(args.shell, &mut cmd, "segtask", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let (cfg, cfg_path) = load_cfg(cli.config.clone()).await?;
    setup_logging(cli.log_level.as_deref().unwrap_or(&cfg.log.level))?;

    match cli.cmd {
        Commands::Completion(_) => Ok(ExitCode::SUCCESS),
        Commands::Config(args) => cmd_config(&cfg, &cfg_path, args),
        Commands::Submit(args) => cmd_submit(&cfg, args).await,
        Commands::Status(args) => cmd_status(&cfg, args).await,
        Commands::Fetch(args) => cmd_fetch(&cfg, args).await,
        Commands::Worker(args) => cmd_worker(&cfg, args).await,
        Commands::Queue(args) => cmd_queue(&cfg, args).await,
    }
}

fn setup_logging(level: &str) -> anyhow::Result<()> {
    let level: tracing::Level = level
        .parse()
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;
    Ok(())
}

async fn load_cfg(path: Option<PathBuf>) -> anyhow::Result<(Config, PathBuf)> {
    tokio::task::spawn_blocking(move || config::load(path.as_deref())).await?
}

async fn build_manager(cfg: &Config) -> anyhow::Result<TaskManager> {
    let root = cfg.storage_root()?;
    let queue = queue::connect(&cfg.queue).await?;
    Ok(TaskManager::new(root, queue).with_chunk_size(cfg.storage.chunk_size))
}

fn cmd_config(cfg: &Config, path: &std::path::Path, args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::List => print!("{}", config::to_toml(cfg)?),
        ConfigCmd::Get(get) => match config::get_value_string(cfg, &get.key) {
            Some(v) => println!("{v}"),
            None => anyhow::bail!(
                "unknown configuration key '{}' (see 'segtask config list')",
                get.key
            ),
        },
        ConfigCmd::Path => println!("{}", path.display()),
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_submit(cfg: &Config, args: SubmitArgs) -> anyhow::Result<ExitCode> {
    let content_type = match args.content_type {
        Some(ct) => ct,
        None => content_type_for_path(&args.file).with_context(|| {
            format!(
                "cannot guess an image type for {}; pass --content-type",
                args.file.display()
            )
        })?,
    };

    let manager = build_manager(cfg).await?;
    let mut file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("failed to open {}", args.file.display()))?;
    let id = manager.create(&mut file, &content_type).await?;
    println!("{id}");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(cfg: &Config, args: StatusArgs) -> anyhow::Result<ExitCode> {
    let manager = build_manager(cfg).await?;
    let state = manager.status(&args.id).await?;
    if args.json {
        let report = StatusReport {
            id: &args.id,
            state,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{state}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_fetch(cfg: &Config, args: FetchArgs) -> anyhow::Result<ExitCode> {
    let manager = build_manager(cfg).await?;
    let (mut file, len) = manager.result(&args.id).await?;

    let copied = match &args.output {
        Some(path) => {
            let mut out = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?;
            tokio::io::copy(&mut file, &mut out).await?
        }
        None => {
            let mut out = tokio::io::stdout();
            let n = tokio::io::copy(&mut file, &mut out).await?;
            tokio::io::AsyncWriteExt::flush(&mut out).await?;
            n
        }
    };
    if copied != len {
        anyhow::bail!("result for {} was truncated: {copied} of {len} bytes", args.id);
    }
    info!(task_id = %args.id, bytes = copied, "result fetched");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_worker(cfg: &Config, args: WorkerArgs) -> anyhow::Result<ExitCode> {
    if cfg.worker.command.trim().is_empty() {
        anyhow::bail!("worker.command is not configured - set it in the config file");
    }
    let processor = CommandProcessor::new(
        config::expand_user(&cfg.worker.command),
        config::parse_duration(&cfg.worker.timeout)?,
    );
    let worker_cfg = WorkerConfig {
        parallel: args.parallel.unwrap_or(cfg.worker.parallel).max(1),
        poll_interval: config::parse_duration(&cfg.worker.poll_interval)?,
        wait: args.wait,
    };

    let manager = build_manager(cfg).await?;
    Worker::new(manager, Arc::new(processor), worker_cfg)
        .run()
        .await?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_queue(cfg: &Config, args: QueueArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        QueueCmd::Len => {
            let queue = queue::connect(&cfg.queue).await?;
            println!("{}", queue.depth().await?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_result_subcommand() {
        let cli = Cli::try_parse_from(["segtask", "result", "abc", "-o", "mask.png"]).unwrap();
        match cli.cmd {
            Commands::Fetch(args) => {
                assert_eq!(args.id, "abc");
                assert_eq!(args.output, Some(PathBuf::from("mask.png")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "segtask",
            "submit",
            "scan.png",
            "--log-level",
            "debug",
            "--config",
            "/tmp/c.toml",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.cmd, Commands::Submit(_)));
    }
}
