//! 应用配置模块
//!
//! 所有配置保存在配置目录下的 config.json 中，按节划分：
//! `app`、`auth`、`transfer`、`log`。缺失或格式错误的节使用默认值。

use crate::core::{PoolConfig, ScanConfig, TransferConfig};
use crate::logging::LogConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";

/// 默认配置目录（~/.config/dbxsync 或平台对应位置）
pub fn default_config_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("dbxsync"))
        .unwrap_or_else(|| PathBuf::from(".dbxsync"))
}

/// Dropbox 应用信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSection {
    #[serde(default)]
    pub app_key: Option<String>,
    #[serde(default)]
    pub app_secret: Option<String>,
}

/// 认证信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSection {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// 传输参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSettings {
    /// worker 数量
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 每个文件的最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 上传分块大小（字节）
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    /// 单次下载调用的时间片（秒）
    #[serde(default = "default_download_time_box_secs")]
    pub download_time_box_secs: u64,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: u32,
}

fn default_workers() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_chunk_size_bytes() -> usize {
    crate::core::transfer::DEFAULT_CHUNK_SIZE
}

fn default_download_time_box_secs() -> u64 {
    3600 // 1 小时
}

fn default_list_page_size() -> u32 {
    crate::storage::DEFAULT_LIST_LIMIT
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            chunk_size_bytes: default_chunk_size_bytes(),
            download_time_box_secs: default_download_time_box_secs(),
            list_page_size: default_list_page_size(),
        }
    }
}

impl TransferSettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_attempts: self.max_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size_bytes,
            time_box: Duration::from_secs(self.download_time_box_secs),
        }
    }

    pub fn scan_config(&self, exclude_patterns: Vec<String>) -> ScanConfig {
        ScanConfig {
            exclude_patterns,
            list_page_size: self.list_page_size,
        }
    }
}

/// 完整的应用配置
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub app: AppSection,
    pub auth: AuthSection,
    pub transfer: TransferSettings,
    pub log: LogConfig,
}

impl AppConfig {
    /// 从配置文件加载，文件不存在时使用默认配置
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join(CONFIG_FILE);
        let root = fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        Self {
            app: section(&root, "app"),
            auth: section(&root, "auth"),
            transfer: section(&root, "transfer"),
            log: section(&root, "log"),
        }
    }

    /// 保存配置，保留文件中的其他字段
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join(CONFIG_FILE);

        // 读取现有配置
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };
        if !config.is_object() {
            config = serde_json::json!({});
        }

        config["app"] = serde_json::to_value(&self.app)?;
        config["auth"] = serde_json::to_value(&self.auth)?;
        config["transfer"] = serde_json::to_value(&self.transfer)?;
        config["log"] = serde_json::to_value(&self.log)?;

        fs::write(&config_file, serde_json::to_string_pretty(&config)?)
    }
}

fn section<T: DeserializeOwned + Default>(root: &serde_json::Value, key: &str) -> T {
    match root.get(key) {
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            tracing::warn!("配置节 {} 格式错误，使用默认值: {}", key, e);
            T::default()
        }),
        None => T::default(),
    }
}
