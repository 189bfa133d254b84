//! 单文件传输
//!
//! 下载支持断点续传：本地已有的字节即为续传偏移，每次调用最多运行一个
//! 时间片，超时后返回"还有剩余"，由调用方再次调用。上传小文件一次完成，
//! 大文件走上传会话（start → append* → finish）。

use crate::core::work_list::TransferItem;
use crate::storage::{CommitInfo, RangeResponse, RemoteStore, StoreError, UploadSessionCursor, WriteMode};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 上传分块大小
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// 下载写入块大小
pub const BLOCK_SIZE: usize = 64 * 1024;
/// 单次下载调用的时间片
pub const DEFAULT_TIME_BOX: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// 输入本身有问题，重试没有意义
    #[error("无效输入: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("本地文件错误: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferError::InvalidInput(_))
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub time_box: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            time_box: DEFAULT_TIME_BOX,
        }
    }
}

/// 分块传输器，同一个池里的 worker 共享一个实例
pub struct ChunkedTransfer {
    store: Arc<dyn RemoteStore>,
    /// 同一时间只允许一个 worker 刷新 token
    refresh_lock: Arc<Mutex<()>>,
    config: TransferConfig,
}

impl ChunkedTransfer {
    pub fn new(store: Arc<dyn RemoteStore>, config: TransferConfig) -> Self {
        Self {
            store,
            refresh_lock: Arc::new(Mutex::new(())),
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    async fn ensure_token(&self) -> TransferResult<()> {
        let _guard = self.refresh_lock.lock().await;
        self.store.refresh_access_token().await?;
        Ok(())
    }

    /// 下载（或续传）单个文件
    ///
    /// 返回 `true` 表示时间片用完但文件尚未下载完成。
    pub async fn download(
        &self,
        item: &TransferItem,
        resume: bool,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> TransferResult<bool> {
        check_local_path(&item.local_path)?;
        self.ensure_token().await?;

        let offset = match fs::metadata(&item.local_path).await {
            Ok(meta) if resume => meta.len(),
            Ok(_) => {
                fs::remove_file(&item.local_path).await?;
                0
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let mut stream = match self.store.download_range(&item.remote_path, offset).await? {
            RangeResponse::NotSatisfiable => {
                debug!("已下载完成: {} (offset={})", item.remote_path, offset);
                return Ok(false);
            }
            RangeResponse::Stream(stream) => stream,
        };

        if let Some(parent) = item.local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&item.local_path)
            .await?;

        debug!("开始下载: {} (offset={})", item.remote_path, offset);
        let started = Instant::now();
        let mut buf = BytesMut::with_capacity(BLOCK_SIZE);

        loop {
            let chunk = match stream.try_next().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    // 已写入的部分落盘后再返回，下一次尝试以文件长度为偏移
                    file.write_all(&buf).await?;
                    file.flush().await?;
                    on_progress(buf.len() as u64);
                    return Err(e.into());
                }
            };
            buf.extend_from_slice(&chunk);
            while buf.len() >= BLOCK_SIZE {
                let block = buf.split_to(BLOCK_SIZE);
                file.write_all(&block).await?;
                on_progress(block.len() as u64);

                if started.elapsed() >= self.config.time_box {
                    file.flush().await?;
                    info!("下载时间片用完，稍后续传: {}", item.remote_path);
                    return Ok(true);
                }
            }
        }

        if !buf.is_empty() {
            file.write_all(&buf).await?;
            on_progress(buf.len() as u64);
        }
        file.flush().await?;
        debug!("下载完成: {}", item.remote_path);
        Ok(false)
    }

    /// 上传单个文件（覆盖远程同名文件）
    pub async fn upload(
        &self,
        item: &TransferItem,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> TransferResult<()> {
        check_local_path(&item.local_path)?;
        let chunk_size = self.config.chunk_size;
        if chunk_size == 0 {
            return Err(TransferError::InvalidInput("分块大小不能为 0".to_string()));
        }
        self.ensure_token().await?;

        let mut file = File::open(&item.local_path).await?;
        let size = file.metadata().await?.len();

        if size <= chunk_size as u64 {
            let data = read_exact(&mut file, size as usize).await?;
            self.store
                .upload(&item.remote_path, data, WriteMode::Overwrite)
                .await?;
            on_progress(size);
            debug!("上传完成: {} ({} 字节)", item.remote_path, size);
            return Ok(());
        }

        let first = read_exact(&mut file, chunk_size).await?;
        let session_id = self.store.upload_session_start(first).await?;
        on_progress(chunk_size as u64);

        let mut cursor = UploadSessionCursor {
            session_id,
            offset: chunk_size as u64,
        };
        debug!("上传会话开始: {} ({})", item.remote_path, cursor.session_id);

        while size - cursor.offset > chunk_size as u64 {
            let data = read_exact(&mut file, chunk_size).await?;
            self.store.upload_session_append(&cursor, data).await?;
            cursor.offset += chunk_size as u64;
            on_progress(chunk_size as u64);
        }

        let remaining = size - cursor.offset;
        let last = read_exact(&mut file, remaining as usize).await?;
        let commit = CommitInfo {
            path: item.remote_path.clone(),
            mode: WriteMode::Overwrite,
        };
        self.store.upload_session_finish(&cursor, last, &commit).await?;
        on_progress(remaining);

        debug!("上传完成: {} ({} 字节)", item.remote_path, size);
        Ok(())
    }
}

fn check_local_path(path: &Path) -> TransferResult<()> {
    if path.file_name().is_none() {
        return Err(TransferError::InvalidInput(format!(
            "本地路径缺少文件名: {}",
            path.display()
        )));
    }
    Ok(())
}

/// 读取恰好 len 字节；文件在传输中变短时返回 UnexpectedEof
async fn read_exact(file: &mut File, len: usize) -> TransferResult<Bytes> {
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
