pub mod dropbox;
pub mod local;
pub mod path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

pub use dropbox::DropboxStore;
pub use local::LocalStore;
pub use path::RemotePath;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- 元数据、列表、token 刷新等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// 单次列表请求的默认条目数
pub const DEFAULT_LIST_LIMIT: u32 = 2000;

/// 存储层错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("路径不存在: {0}")]
    NotFound(String),
    #[error("认证失败: {0}")]
    Auth(String),
    #[error("上传会话偏移不匹配: 期望 {expected}, 实际 {actual}")]
    IncorrectOffset { expected: u64, actual: u64 },
    #[error("接口返回错误 ({status}): {summary}")]
    Api { status: u16, summary: String },
    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON 解析失败: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 文件元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub path_lower: String,
    pub path_display: String,
    pub size: u64,
    pub server_modified: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

/// 目录元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMetadata {
    pub name: String,
    pub path_lower: String,
    pub path_display: String,
}

/// 已删除条目的标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedMetadata {
    pub name: String,
    pub path_lower: String,
}

/// 远程条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

impl Metadata {
    pub fn name(&self) -> &str {
        match self {
            Metadata::File(f) => &f.name,
            Metadata::Folder(d) => &d.name,
            Metadata::Deleted(d) => &d.name,
        }
    }

    pub fn path_lower(&self) -> &str {
        match self {
            Metadata::File(f) => &f.path_lower,
            Metadata::Folder(d) => &d.path_lower,
            Metadata::Deleted(d) => &d.path_lower,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Metadata::File(_))
    }
}

/// 一页目录列表
#[derive(Debug, Clone, Default)]
pub struct ListFolderPage {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

/// 下载的字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = StoreResult<Bytes>> + Send>>;

/// 范围下载的结果
pub enum RangeResponse {
    Stream(ByteStream),
    /// 请求的起始偏移已经到达文件末尾
    NotSatisfiable,
}

/// 写入模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Add,
    Overwrite,
}

/// 上传会话游标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSessionCursor {
    pub session_id: String,
    pub offset: u64,
}

/// 会话结束时的提交信息
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub path: RemotePath,
    pub mode: WriteMode,
}

/// 远程存储接口
///
/// 所有调用从调用方角度看都是一次完整的请求；并发由上层的多个 worker 提供。
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 获取单个路径的元数据，不存在时返回 None
    async fn get_metadata(&self, path: &RemotePath) -> StoreResult<Option<Metadata>>;

    /// 列出目录（第一页）
    async fn list_folder(&self, path: &RemotePath, limit: u32) -> StoreResult<ListFolderPage>;

    /// 根据游标继续列出
    async fn list_folder_continue(&self, cursor: &str) -> StoreResult<ListFolderPage>;

    /// 从 offset 开始下载到文件末尾
    async fn download_range(&self, path: &RemotePath, offset: u64) -> StoreResult<RangeResponse>;

    /// 整文件上传
    async fn upload(&self, path: &RemotePath, data: Bytes, mode: WriteMode) -> StoreResult<()>;

    /// 开启上传会话并发送第一块，返回会话 ID
    async fn upload_session_start(&self, data: Bytes) -> StoreResult<String>;

    /// 向会话追加一块
    async fn upload_session_append(&self, cursor: &UploadSessionCursor, data: Bytes) -> StoreResult<()>;

    /// 发送最后一块并提交文件
    async fn upload_session_finish(
        &self,
        cursor: &UploadSessionCursor,
        data: Bytes,
        commit: &CommitInfo,
    ) -> StoreResult<()>;

    /// 刷新 access token；token 仍然有效时不做任何事
    async fn refresh_access_token(&self) -> StoreResult<()>;

    /// 存储名称（用于日志）
    fn name(&self) -> &str;

    /// 列出目录的全部条目（自动翻页）
    async fn list_folder_all(&self, path: &RemotePath, limit: u32) -> StoreResult<Vec<Metadata>> {
        let mut page = self.list_folder(path, limit).await?;
        let mut entries = std::mem::take(&mut page.entries);
        while page.has_more {
            page = self.list_folder_continue(&page.cursor).await?;
            entries.append(&mut page.entries);
        }
        Ok(entries)
    }
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Dropbox,
    Local(std::path::PathBuf),
}

impl std::str::FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("dropbox") {
            return Ok(StoreKind::Dropbox);
        }
        match s.strip_prefix("local:") {
            Some(dir) if !dir.is_empty() => Ok(StoreKind::Local(dir.into())),
            _ => Err(format!("不支持的存储类型: {} (可选 dropbox 或 local:<目录>)", s)),
        }
    }
}

/// 根据配置创建存储实例
pub fn create_store(
    kind: &StoreKind,
    config: &crate::config::AppConfig,
) -> anyhow::Result<Arc<dyn RemoteStore>> {
    match kind {
        StoreKind::Local(root) => {
            tracing::info!("初始化本地存储: {}", root.display());
            Ok(Arc::new(LocalStore::new(root)?) as Arc<dyn RemoteStore>)
        }
        StoreKind::Dropbox => {
            let app_key = config
                .app
                .app_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Dropbox storage requires app.appKey"))?;
            let refresh_token = config
                .auth
                .refresh_token
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Dropbox storage requires auth.refreshToken"))?;
            tracing::info!("初始化 Dropbox 存储");
            Ok(Arc::new(DropboxStore::new(
                app_key,
                config.app.app_secret.clone(),
                refresh_token,
                config.auth.access_token.clone(),
            )?) as Arc<dyn RemoteStore>)
        }
    }
}
