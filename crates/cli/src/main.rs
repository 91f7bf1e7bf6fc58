use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use pandrive_core::{
    APP_NAME, DuplicatePolicy, OpenApiClient, OpenApiConfig, ProgressSink, Settings, StaticToken,
    TaskUpdate, UploadManager, UploadStatus,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "pandrive")]
#[command(about = "PanDrive CLI (desktop file-manager backend)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Upload {
        #[command(subcommand)]
        cmd: UploadCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Subcommand)]
enum UploadCmd {
    Run {
        #[arg(long)]
        dest: u64,
        #[arg(long)]
        token: Option<String>,
        #[arg(long, value_enum)]
        duplicate: Option<DuplicateArg>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DuplicateArg {
    KeepBoth,
    Overwrite,
}

impl From<DuplicateArg> for DuplicatePolicy {
    fn from(value: DuplicateArg) -> Self {
        match value {
            DuplicateArg::KeepBoth => DuplicatePolicy::KeepBoth,
            DuplicateArg::Overwrite => DuplicatePolicy::Overwrite,
        }
    }
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

struct NdjsonSink;

impl ProgressSink for NdjsonSink {
    fn on_update(&self, u: TaskUpdate) {
        let line = serde_json::json!({
            "type": "task.update",
            "taskId": u.task_id,
            "status": u.status,
            "progress": u.progress,
            "fileName": u.file_name,
            "remoteFileId": u.remote_file_id,
            "error": u.error,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("PANDRIVE_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
        Command::Upload { cmd } => match cmd {
            UploadCmd::Run {
                dest,
                token,
                duplicate,
                files,
            } => {
                upload_run(
                    &config_dir,
                    dest,
                    token,
                    duplicate.map(DuplicatePolicy::from),
                    files,
                    cli.json,
                    cli.events,
                )
                .await
            }
        },
    }
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir)?;
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = toml::to_string(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings: Settings =
        toml::from_str(&input).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    settings.validate().map_err(map_core_err)?;
    save_settings(config_dir, &settings)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

async fn upload_run(
    config_dir: &Path,
    dest: u64,
    token: Option<String>,
    duplicate: Option<DuplicatePolicy>,
    files: Vec<PathBuf>,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let settings = load_settings(config_dir)?;
    settings.validate().map_err(map_core_err)?;

    let token = token
        .or_else(|| std::env::var("PANDRIVE_ACCESS_TOKEN").ok())
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            CliError::new(
                "auth.missing",
                "access token missing (use --token or PANDRIVE_ACCESS_TOKEN)",
            )
        })?;

    let client = OpenApiClient::new(
        OpenApiConfig {
            base_url: settings.api.base_url.clone(),
        },
        Arc::new(StaticToken(token)),
    );
    let duplicate = duplicate.or(settings.transfer.duplicate);

    let mut manager = UploadManager::new(Arc::new(client), settings.retry_policy());
    if events {
        manager = manager.with_sink(Arc::new(NdjsonSink));
    }
    let manager = Arc::new(manager);

    for file in files {
        manager.submit(file, dest, duplicate);
    }

    loop {
        if manager.tasks().iter().all(|t| t.status.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let tasks = manager.tasks();
    let failed = tasks
        .iter()
        .filter(|t| t.status == UploadStatus::Failed)
        .count();

    if json {
        println!("{}", serde_json::json!({ "tasks": tasks }));
    } else {
        for task in &tasks {
            match task.status {
                UploadStatus::Completed => println!(
                    "completed {} fileId={}",
                    task.source_path.display(),
                    task.remote_file_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "unconfirmed".to_string())
                ),
                _ => println!(
                    "failed {}: {}",
                    task.source_path.display(),
                    task.error.clone().unwrap_or_default()
                ),
            }
        }
    }

    if failed > 0 {
        return Err(CliError::retryable(
            "upload.failed",
            format!("{failed} task(s) failed"),
        ));
    }
    Ok(())
}

fn default_config_dir() -> PathBuf {
    if cfg!(windows)
        && let Ok(base) = std::env::var("LOCALAPPDATA")
    {
        return PathBuf::from(base).join(APP_NAME);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".pandrive")
}

fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

fn load_settings(config_dir: &Path) -> Result<Settings, CliError> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings: Settings =
        toml::from_str(&text).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    Ok(settings)
}

fn save_settings(config_dir: &Path, settings: &Settings) -> Result<(), CliError> {
    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CliError::new("config.write_failed", e.to_string()))?;
    }
    let text =
        toml::to_string(settings).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    atomic_write(&path, text.as_bytes())
        .map_err(|e| CliError::new("config.write_failed", e.to_string()))?;
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

fn map_core_err(e: pandrive_core::Error) -> CliError {
    match e {
        pandrive_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        pandrive_core::Error::Validation { message } => CliError::new("upload.invalid", message),
        pandrive_core::Error::Protocol { code, message } => {
            CliError::new("service.error", format!("code {code}: {message}"))
        }
        pandrive_core::Error::Transport { message } => {
            CliError::retryable("service.unavailable", message)
        }
        pandrive_core::Error::Cancelled => CliError::new("task.cancelled", "upload cancelled"),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"retryable\":false}".to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
