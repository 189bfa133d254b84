//! 传输执行：固定数量的 worker 从同一个队列取任务

use crate::core::progress::{ProgressObserver, TransferProgress};
use crate::core::transfer::{ChunkedTransfer, TransferError, TransferResult};
use crate::core::work_list::{TransferItem, WorkList};
use anyhow::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Download { resume: bool },
    Upload,
}

impl TransferMode {
    pub fn download() -> Self {
        TransferMode::Download { resume: true }
    }
}

/// 重试配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 每个文件的最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 重试基础延迟（毫秒），第 n 次重试等待 base * 2^n
    pub retry_base_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            retry_base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Drained,
}

/// 传输报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub files_queued: u64,
    pub files_completed: u64,
    pub files_failed: u64,
    pub bytes_total: u64,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

/// 传输统计
#[derive(Debug, Default)]
struct TransferStats {
    files_completed: AtomicU64,
    files_failed: AtomicU64,
}

/// 预先填满的任务队列，每个条目只会被取走一次
struct WorkQueue {
    items: Mutex<VecDeque<TransferItem>>,
}

impl WorkQueue {
    fn new(items: impl IntoIterator<Item = TransferItem>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    async fn try_take(&self) -> Option<TransferItem> {
        self.items.lock().await.pop_front()
    }
}

/// worker 之间共享的运行状态
struct RunState {
    queue: WorkQueue,
    stats: TransferStats,
    errors: RwLock<Vec<String>>,
    progress: TransferProgress,
}

pub struct WorkerPool {
    transfer: Arc<ChunkedTransfer>,
    config: PoolConfig,
    observer: Option<ProgressObserver>,
    state: AtomicU8,
}

impl WorkerPool {
    pub fn new(transfer: ChunkedTransfer, config: PoolConfig) -> Self {
        Self {
            transfer: Arc::new(transfer),
            config,
            observer: None,
            state: AtomicU8::new(PoolState::Idle as u8),
        }
    }

    /// 进度回调（参数为当前已完成字节数）
    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> PoolState {
        match self.state.load(Ordering::SeqCst) {
            0 => PoolState::Idle,
            1 => PoolState::Running,
            _ => PoolState::Drained,
        }
    }

    /// 执行清单中的所有传输，队列清空后返回
    ///
    /// 单个文件失败不会影响其他文件，失败信息记录在报告中。
    pub async fn run(&self, work: &WorkList, pool_size: usize, mode: TransferMode) -> Result<TransferReport> {
        if pool_size == 0 {
            anyhow::bail!("worker 数量必须大于 0");
        }

        let queued: Vec<TransferItem> = work.transferable().cloned().collect();
        let files_queued = queued.len() as u64;
        let bytes_total: u64 = queued.iter().map(|i| i.size).sum();

        let mut progress = TransferProgress::new(bytes_total);
        if let Some(observer) = &self.observer {
            progress = progress.with_observer(observer.clone());
        }
        let run = Arc::new(RunState {
            queue: WorkQueue::new(queued),
            stats: TransferStats::default(),
            errors: RwLock::new(Vec::new()),
            progress,
        });

        info!(
            "开始传输: {} 个文件, {} 字节, {} 个 worker ({:?})",
            files_queued, bytes_total, pool_size, mode
        );
        self.state.store(PoolState::Running as u8, Ordering::SeqCst);
        let start = Instant::now();

        if pool_size == 1 {
            Self::worker(0, self.transfer.clone(), run.clone(), self.config.clone(), mode).await;
        } else {
            let handles: Vec<_> = (0..pool_size)
                .map(|id| {
                    tokio::spawn(Self::worker(
                        id,
                        self.transfer.clone(),
                        run.clone(),
                        self.config.clone(),
                        mode,
                    ))
                })
                .collect();

            // 等待所有 worker 完成
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("worker 异常退出: {}", e);
                }
            }
        }

        self.state.store(PoolState::Drained as u8, Ordering::SeqCst);

        let report = TransferReport {
            files_queued,
            files_completed: run.stats.files_completed.load(Ordering::Relaxed),
            files_failed: run.stats.files_failed.load(Ordering::Relaxed),
            bytes_total,
            bytes_transferred: run.progress.done(),
            duration_ms: start.elapsed().as_millis() as u64,
            errors: run.errors.read().await.clone(),
        };

        info!(
            "传输结束: 成功 {}, 失败 {}, {} 字节, 耗时 {}ms",
            report.files_completed, report.files_failed, report.bytes_transferred, report.duration_ms
        );
        Ok(report)
    }

    async fn worker(
        id: usize,
        transfer: Arc<ChunkedTransfer>,
        run: Arc<RunState>,
        config: PoolConfig,
        mode: TransferMode,
    ) {
        while let Some(item) = run.queue.try_take().await {
            debug!("[worker {}] {}", id, item.name);

            match Self::transfer_with_retry(&transfer, &item, mode, &config, &run.progress).await {
                Ok(()) => {
                    run.stats.files_completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    run.stats.files_failed.fetch_add(1, Ordering::Relaxed);
                    run.errors
                        .write()
                        .await
                        .push(format!("{}: {}", item.remote_path, e));
                }
            }
        }
        debug!("[worker {}] 队列已空", id);
    }

    /// 带重试的单文件传输，每次尝试都从头执行完整流程
    async fn transfer_with_retry(
        transfer: &ChunkedTransfer,
        item: &TransferItem,
        mode: TransferMode,
        config: &PoolConfig,
        progress: &TransferProgress,
    ) -> TransferResult<()> {
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let err = match Self::transfer_once(transfer, item, mode, progress).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            attempt += 1;

            if !err.is_retryable() {
                error!("传输失败，不再重试: {} - {}", item.remote_path, err);
                return Err(err);
            }
            if attempt >= max_attempts {
                error!(
                    "传输最终失败 (已尝试{}次): {} - {}",
                    max_attempts, item.remote_path, err
                );
                return Err(err);
            }

            let delay = retry_delay_ms(config.retry_base_delay_ms, attempt);
            warn!(
                "传输失败，{}ms 后重试 ({}/{}): {} - {}",
                delay, attempt, max_attempts, item.remote_path, err
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    async fn transfer_once(
        transfer: &ChunkedTransfer,
        item: &TransferItem,
        mode: TransferMode,
        progress: &TransferProgress,
    ) -> Result<(), TransferError> {
        let sent = AtomicU64::new(0);
        let on_progress = |n: u64| {
            sent.fetch_add(n, Ordering::Relaxed);
            progress.add(n);
        };

        let result = match mode {
            TransferMode::Download { resume } => {
                // 时间片用完后接着已写入的部分继续
                let mut result = transfer.download(item, resume, &on_progress).await;
                while let Ok(true) = result {
                    result = transfer.download(item, true, &on_progress).await;
                }
                result.map(|_| ())
            }
            TransferMode::Upload => transfer.upload(item, &on_progress).await,
        };

        // 续传下载保留已写入的部分；上传和从头下载的重试会重新发送
        let restarts = !matches!(mode, TransferMode::Download { resume: true });
        if result.is_err() && restarts {
            progress.rollback(sent.load(Ordering::Relaxed));
        }
        result
    }
}

/// 第 n 次失败后的等待时间：base * 2^(n-1)，溢出时取上限
fn retry_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor)
}
