//! 传输进度

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 进度观察者，计数变化时被调用（参数为当前已完成字节数）
pub type ProgressObserver = Arc<dyn Fn(u64) + Send + Sync>;

/// 所有 worker 共享的字节计数
pub struct TransferProgress {
    total: u64,
    done: AtomicU64,
    observer: Option<ProgressObserver>,
}

impl TransferProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            done: AtomicU64::new(0),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn add(&self, bytes: u64) {
        let done = self.done.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.notify(done);
    }

    /// 撤销一次失败尝试已计入的字节，重试会重新发送它们
    pub fn rollback(&self, bytes: u64) {
        let prev = self
            .done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(bytes)))
            .unwrap_or_else(|d| d);
        self.notify(prev.saturating_sub(bytes));
    }

    fn notify(&self, done: u64) {
        if let Some(observer) = &self.observer {
            observer(done);
        }
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// 完成百分比（总量为 0 时视为 100%）
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.done() as f64 / self.total as f64 * 100.0).min(100.0)
    }
}

/// 格式化字节数，按 MB / GB / TB 显示
pub fn format_size(bytes: u64) -> String {
    let mb = bytes as f64 / 1024.0 / 1024.0;
    if mb < 1024.0 {
        format!("{:.2} MB", mb)
    } else if mb < 1024.0 * 1024.0 {
        format!("{:.2} GB", mb / 1024.0)
    } else {
        format!("{:.2} TB", mb / 1024.0 / 1024.0)
    }
}
