use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dbxsync_lib::config::{default_config_dir, AppConfig};
use dbxsync_lib::core::{accept_all, format_size, ChunkedTransfer, TransferMode, TreeDiffer, WorkList, WorkerPool};
use dbxsync_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use dbxsync_lib::storage::{create_store, RemotePath, StoreKind};
use dbxsync_lib::TransferReport;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;

/// dbxsync - 断点续传、分块上传的 Dropbox 同步工具
#[derive(Parser)]
#[command(name = "dbxsync", version = env!("CARGO_PKG_VERSION"), about)]
struct Cli {
    /// 配置目录（默认 ~/.config/dbxsync）
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// 远程存储：dropbox 或 local:<目录>
    #[arg(long, global = true, default_value = "dropbox")]
    store: StoreKind,

    /// worker 数量（默认取配置文件）
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// 不显示进度条
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 下载远程目录（或文件）到本地，已有的部分会续传
    Download {
        /// 远程路径，如 /Photos
        remote: String,
        /// 本地目标
        local: PathBuf,
        /// 删除已有的本地文件后从头下载
        #[arg(long)]
        no_resume: bool,
        /// 排除规则（glob，可重复）
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// 上传本地目录中远程不存在的文件
    Upload {
        /// 本地目录
        local: PathBuf,
        /// 远程目标目录
        remote: String,
        /// 插入到远程目标与相对路径之间的前缀
        #[arg(long, default_value = "")]
        prefix: String,
        /// 排除规则（glob，可重复）
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// 上传匹配 glob 的文件
    UploadGlob {
        /// 匹配模式，支持 * ? **
        pattern: String,
        /// 远程目标目录
        remote: String,
        /// 计算远程相对路径的基准目录
        #[arg(long, default_value = ".")]
        base: PathBuf,
        /// 不检查远程是否已存在，全部上传
        #[arg(long)]
        no_check: bool,
    },
}

/// 初始化日志系统
fn init_logging(log_dir: &Path, config: &LogConfig) {
    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            // 文件日志层 - 始终输出到文件
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer);

            // 在 debug 模式下也输出到控制台
            #[cfg(debug_assertions)]
            let subscriber = subscriber.with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            );

            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            eprintln!("无法创建日志文件 {}: {}", log_dir.display(), e);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

fn progress_bar(total: u64, quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn print_report(report: &TransferReport) {
    println!(
        "完成: 成功 {} / 失败 {} / 共 {}, 传输 {}, 耗时 {:.1}s",
        report.files_completed,
        report.files_failed,
        report.files_queued,
        format_size(report.bytes_transferred),
        report.duration_ms as f64 / 1000.0
    );
    for err in &report.errors {
        eprintln!("  失败: {}", err);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("无法创建配置目录: {}", config_dir.display()))?;
    let config = AppConfig::load(&config_dir);
    init_logging(&get_log_dir(&config_dir), &config.log);

    let store = create_store(&cli.store, &config)?;
    let workers = cli.workers.unwrap_or(config.transfer.workers);
    info!("使用存储 {}，{} 个 worker", store.name(), workers);

    let (work, mode): (WorkList, TransferMode) = match cli.command {
        Commands::Download {
            remote,
            local,
            no_resume,
            exclude,
        } => {
            let differ = TreeDiffer::new(store.clone(), config.transfer.scan_config(exclude))?;
            let work = differ
                .diff_download(&RemotePath::parse(&remote), &local, &accept_all)
                .await;
            (work, TransferMode::Download { resume: !no_resume })
        }
        Commands::Upload {
            local,
            remote,
            prefix,
            exclude,
        } => {
            let mut differ = TreeDiffer::new(store.clone(), config.transfer.scan_config(exclude))?;
            let work = differ
                .diff_upload(&local, &prefix, &RemotePath::parse(&remote))
                .await;
            (work, TransferMode::Upload)
        }
        Commands::UploadGlob {
            pattern,
            remote,
            base,
            no_check,
        } => {
            let mut differ = TreeDiffer::new(store.clone(), config.transfer.scan_config(vec![]))?;
            let work = differ
                .diff_upload_glob(&pattern, &base, &RemotePath::parse(&remote), !no_check)
                .await;
            (work, TransferMode::Upload)
        }
    };

    println!("{} 个文件, 共 {}", work.len(), format_size(work.total_size()));
    if work.is_empty() {
        return Ok(());
    }

    let pb = progress_bar(work.total_size(), cli.quiet)?;
    let observer_pb = pb.clone();
    let transfer = ChunkedTransfer::new(store, config.transfer.transfer_config());
    let pool = WorkerPool::new(transfer, config.transfer.pool_config())
        .with_observer(Arc::new(move |done: u64| observer_pb.set_position(done)));

    let report = pool.run(&work, workers, mode).await?;
    pb.finish_and_clear();
    print_report(&report);

    Ok(())
}
