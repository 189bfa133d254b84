pub mod config;
pub mod core;
pub mod logging;
pub mod storage;

pub use crate::config::AppConfig;
pub use crate::core::{
    ChunkedTransfer, RemoteDirectoryCache, TransferItem, TransferMode, TransferReport, TreeDiffer,
    WorkList, WorkerPool,
};
pub use crate::storage::{RemotePath, RemoteStore, StoreError};

/// 平台相关的用户目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
