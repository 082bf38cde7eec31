//! Worklog Notify 守护进程
//!
//! 周期性检测时间追踪事件，并把通知投递到配置的 webhook

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use worklog_notify::{MemoryStore, NotifierConfig, NotifierDaemon};

#[derive(Parser)]
#[command(name = "worklog-notifyd")]
#[command(about = "Worklog Notify - 时间追踪通知守护进程")]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 ~/.config/worklog-notify/config.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 数据快照文件（覆盖配置中的 data_file）
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 前台运行，Ctrl-C 退出
    Run,
    /// 向指定 webhook 发送一条测试通知
    TestWebhook {
        /// Webhook 名称
        name: String,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
}

fn load_config(cli: &Cli) -> Result<NotifierConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = NotifierConfig::load_from(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            config
        }
        None => NotifierConfig::load()?,
    };
    if let Some(data) = &cli.data {
        config.data_file = Some(data.clone());
    }
    Ok(config)
}

fn load_store(config: &NotifierConfig) -> Result<Arc<MemoryStore>> {
    match &config.data_file {
        Some(path) => {
            let store = MemoryStore::load(path)
                .with_context(|| format!("Failed to load data file {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No data_file configured, starting with an empty store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("worklog_notify=info,worklog_notifyd=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = load_store(&config)?;
    let daemon = NotifierDaemon::build(&config, store).await?;

    match cli.command {
        Commands::Run => {
            daemon.start();
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C, shutting down");
            daemon.shutdown().await;
        }
        Commands::TestWebhook { name, json } => {
            let result = daemon.dispatcher().test_webhook(&name).await;
            if json {
                let value = serde_json::json!({
                    "channel": result.channel,
                    "success": result.success,
                    "status_code": result.status_code,
                    "duration_ms": result.duration.as_millis() as u64,
                    "error": result.error.as_ref().map(|e| e.to_string()),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else if result.success {
                println!(
                    "✅ {}: HTTP {} ({} ms)",
                    result.channel,
                    result.status_code,
                    result.duration.as_millis()
                );
            } else {
                println!(
                    "❌ {}: {}",
                    result.channel,
                    result
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| format!("HTTP {}", result.status_code))
                );
            }
            if !result.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
