//! 本地目录形式的远程存储
//!
//! 把一个本地目录按远程存储的接口暴露出来：分页列表、范围读取、上传会话。
//! 上传会话的数据暂存在根目录下的 `.dbxsync-sessions` 中，列表时不可见。

use super::{
    CommitInfo, DeletedMetadata, FileMetadata, FolderMetadata, ListFolderPage, Metadata,
    RangeResponse, RemotePath, RemoteStore, StoreError, StoreResult, UploadSessionCursor,
    WriteMode,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

/// 上传会话暂存目录名
pub const STAGING_DIR: &str = ".dbxsync-sessions";

pub struct LocalStore {
    base_path: PathBuf,
    staging_dir: PathBuf,
    name: String,
}

/// 列表游标（序列化为 JSON 字符串交给调用方）
#[derive(Debug, Serialize, Deserialize)]
struct LocalCursor {
    path: String,
    offset: usize,
    limit: u32,
}

impl LocalStore {
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let staging_dir = base_path.join(STAGING_DIR);
        let name = format!("local:{}", base_path.display());
        Ok(Self {
            base_path,
            staging_dir,
            name,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 按大小写不敏感的方式解析已存在的路径，返回实际路径和各段的实际名称
    async fn resolve_existing(&self, path: &RemotePath) -> StoreResult<Option<(PathBuf, RemotePath)>> {
        let mut current = self.base_path.clone();
        let mut display = RemotePath::root();

        for segment in path.segments() {
            let exact = current.join(segment);
            if fs::symlink_metadata(&exact).await.is_ok() {
                current = exact;
                display = display.join(segment);
                continue;
            }

            let Some(found) = Self::find_case_insensitive(&current, segment).await? else {
                return Ok(None);
            };
            current = current.join(&found);
            display = display.join(&found);
        }

        Ok(Some((current, display)))
    }

    async fn find_case_insensitive(dir: &Path, segment: &str) -> StoreResult<Option<String>> {
        match fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let mut entries = fs::read_dir(dir).await?;
        let wanted = segment.to_lowercase();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.to_lowercase() == wanted {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// 写入目标路径：已存在的父目录沿用实际名称，缺失的部分按给定名称创建
    async fn resolve_for_write(&self, path: &RemotePath) -> StoreResult<PathBuf> {
        let Some(file_name) = path.file_name() else {
            return Err(StoreError::Api {
                status: 400,
                summary: "path/malformed_path".to_string(),
            });
        };
        let parent = path.parent().unwrap_or_default();

        let mut dir = self.base_path.clone();
        let mut creating = false;
        for segment in parent.segments() {
            if !creating {
                if let Some(found) = Self::find_existing_segment(&dir, segment).await? {
                    dir = dir.join(found);
                    continue;
                }
                creating = true;
            }
            dir = dir.join(segment);
        }
        fs::create_dir_all(&dir).await?;

        let target = match Self::find_existing_segment(&dir, file_name).await? {
            Some(found) => dir.join(found),
            None => dir.join(file_name),
        };
        Ok(target)
    }

    async fn find_existing_segment(dir: &Path, segment: &str) -> StoreResult<Option<String>> {
        if fs::symlink_metadata(dir.join(segment)).await.is_ok() {
            return Ok(Some(segment.to_string()));
        }
        Self::find_case_insensitive(dir, segment).await
    }

    fn metadata_for(display: &RemotePath, meta: &std::fs::Metadata) -> Metadata {
        let name = display.file_name().unwrap_or_default().to_string();
        let path_display = display.to_string();
        let path_lower = display.to_lowercase().to_string();

        if meta.is_dir() {
            Metadata::Folder(FolderMetadata {
                name,
                path_lower,
                path_display,
            })
        } else {
            Metadata::File(FileMetadata {
                name,
                path_lower,
                path_display,
                size: meta.len(),
                server_modified: meta.modified().ok().map(chrono::DateTime::<chrono::Utc>::from),
                content_hash: None,
            })
        }
    }

    /// 读取目录的全部条目（按名称排序，跳过暂存目录）
    async fn read_folder(&self, path: &RemotePath) -> StoreResult<Vec<Metadata>> {
        let (dir, display) = self
            .resolve_existing(path)
            .await?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let meta = fs::metadata(&dir).await?;
        if !meta.is_dir() {
            return Err(StoreError::Api {
                status: 409,
                summary: "path/not_folder".to_string(),
            });
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_root() && name == STAGING_DIR {
                continue;
            }
            names.push(name);
        }
        names.sort();

        let mut result = Vec::with_capacity(names.len());
        for name in names {
            let child = display.join(&name);
            match fs::metadata(dir.join(&name)).await {
                Ok(meta) => result.push(Self::metadata_for(&child, &meta)),
                // 列出之后被删除的条目
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    result.push(Metadata::Deleted(DeletedMetadata {
                        name,
                        path_lower: child.to_lowercase().to_string(),
                    }))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(result)
    }

    async fn page(&self, path: &RemotePath, offset: usize, limit: u32) -> StoreResult<ListFolderPage> {
        let all = self.read_folder(path).await?;
        let limit = (limit.max(1)) as usize;
        let end = (offset + limit).min(all.len());
        let entries = all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let cursor = serde_json::to_string(&LocalCursor {
            path: path.to_string(),
            offset: end,
            limit: limit as u32,
        })?;
        Ok(ListFolderPage {
            entries,
            cursor,
            has_more: end < all.len(),
        })
    }

    fn session_path(&self, session_id: &str) -> StoreResult<PathBuf> {
        // 会话 ID 由本存储生成，拒绝任何可能逃出暂存目录的输入
        if session_id.is_empty() || session_id.contains(['/', '\\', '.']) {
            return Err(StoreError::NotFound(format!("upload session {}", session_id)));
        }
        Ok(self.staging_dir.join(session_id))
    }

    async fn append_to_session(&self, cursor: &UploadSessionCursor, data: &[u8]) -> StoreResult<PathBuf> {
        let staging = self.session_path(&cursor.session_id)?;
        let current = match fs::metadata(&staging).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!(
                    "upload session {}",
                    cursor.session_id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if current != cursor.offset {
            return Err(StoreError::IncorrectOffset {
                expected: current,
                actual: cursor.offset,
            });
        }

        let mut file = fs::OpenOptions::new().append(true).open(&staging).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(staging)
    }

    async fn commit(&self, from: &Path, commit: &CommitInfo) -> StoreResult<()> {
        let target = self.resolve_for_write(&commit.path).await?;
        if commit.mode == WriteMode::Add && fs::metadata(&target).await.is_ok() {
            return Err(StoreError::Api {
                status: 409,
                summary: "path/conflict/file".to_string(),
            });
        }
        fs::rename(from, &target).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    async fn get_metadata(&self, path: &RemotePath) -> StoreResult<Option<Metadata>> {
        let Some((full_path, display)) = self.resolve_existing(path).await? else {
            return Ok(None);
        };
        match fs::metadata(&full_path).await {
            Ok(meta) => Ok(Some(Self::metadata_for(&display, &meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_folder(&self, path: &RemotePath, limit: u32) -> StoreResult<ListFolderPage> {
        self.page(path, 0, limit).await
    }

    async fn list_folder_continue(&self, cursor: &str) -> StoreResult<ListFolderPage> {
        let cursor: LocalCursor = serde_json::from_str(cursor)?;
        self.page(&RemotePath::parse(&cursor.path), cursor.offset, cursor.limit)
            .await
    }

    async fn download_range(&self, path: &RemotePath, offset: u64) -> StoreResult<RangeResponse> {
        let (full_path, _) = self
            .resolve_existing(path)
            .await?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let meta = fs::metadata(&full_path).await?;
        if meta.is_dir() {
            return Err(StoreError::Api {
                status: 409,
                summary: "path/not_file".to_string(),
            });
        }
        if offset >= meta.len() {
            return Ok(RangeResponse::NotSatisfiable);
        }

        let mut file = fs::File::open(&full_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let stream = ReaderStream::new(file).map_err(StoreError::Io);
        Ok(RangeResponse::Stream(Box::pin(stream)))
    }

    async fn upload(&self, path: &RemotePath, data: Bytes, mode: WriteMode) -> StoreResult<()> {
        let full_path = self.resolve_for_write(path).await?;
        if mode == WriteMode::Add && fs::metadata(&full_path).await.is_ok() {
            return Err(StoreError::Api {
                status: 409,
                summary: "path/conflict/file".to_string(),
            });
        }

        // 使用临时文件写入，然后原子重命名
        fs::create_dir_all(&self.staging_dir).await?;
        let temp_path = self.staging_dir.join(uuid::Uuid::new_v4().simple().to_string());
        fs::write(&temp_path, &data).await?;
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn upload_session_start(&self, data: Bytes) -> StoreResult<String> {
        fs::create_dir_all(&self.staging_dir).await?;
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        fs::write(self.session_path(&session_id)?, &data).await?;
        Ok(session_id)
    }

    async fn upload_session_append(&self, cursor: &UploadSessionCursor, data: Bytes) -> StoreResult<()> {
        self.append_to_session(cursor, &data).await?;
        Ok(())
    }

    async fn upload_session_finish(
        &self,
        cursor: &UploadSessionCursor,
        data: Bytes,
        commit: &CommitInfo,
    ) -> StoreResult<()> {
        let staging = self.append_to_session(cursor, &data).await?;
        let cleanup = staging.clone();
        // 无论提交是否成功，会话都已结束
        scopeguard::defer! {
            let _ = std::fs::remove_file(&cleanup);
        }
        self.commit(&staging, commit).await
    }

    async fn refresh_access_token(&self) -> StoreResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(resp: RangeResponse) -> Vec<u8> {
        match resp {
            RangeResponse::Stream(mut s) => {
                let mut out = Vec::new();
                while let Some(chunk) = s.next().await {
                    out.extend_from_slice(&chunk.unwrap());
                }
                out
            }
            RangeResponse::NotSatisfiable => panic!("unexpected NotSatisfiable"),
        }
    }

    #[tokio::test]
    async fn test_paged_listing_hides_staging() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        std::fs::create_dir(dir.path().join("Sub")).unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.upload_session_start(Bytes::from_static(b"x")).await.unwrap();

        let page = store.list_folder(&RemotePath::root(), 2).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(page.has_more);
        let all = store.list_folder_all(&RemotePath::root(), 2).await.unwrap();
        let names: Vec<_> = all.iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, ["Sub", "a.txt", "b.txt", "c.txt"]);
        assert_eq!(all[0].path_lower(), "/sub");
    }

    #[tokio::test]
    async fn test_lowercase_lookup_resolves_real_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Photos")).unwrap();
        std::fs::write(dir.path().join("Photos").join("IMG.jpg"), b"data").unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let meta = store
            .get_metadata(&RemotePath::parse("/photos/img.jpg"))
            .await
            .unwrap()
            .unwrap();
        match meta {
            Metadata::File(f) => {
                assert_eq!(f.path_display, "/Photos/IMG.jpg");
                assert_eq!(f.size, 4);
            }
            other => panic!("expected file, got {:?}", other),
        }
        assert!(store
            .get_metadata(&RemotePath::parse("/photos/missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_range_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.bin"), b"0123456789").unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let path = RemotePath::parse("/f.bin");

        assert_eq!(collect(store.download_range(&path, 4).await.unwrap()).await, b"456789");
        assert!(matches!(
            store.download_range(&path, 10).await.unwrap(),
            RangeResponse::NotSatisfiable
        ));
    }

    #[tokio::test]
    async fn test_session_rejects_wrong_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let id = store.upload_session_start(Bytes::from_static(b"abc")).await.unwrap();

        let bad = UploadSessionCursor {
            session_id: id.clone(),
            offset: 1,
        };
        let err = store
            .upload_session_append(&bad, Bytes::from_static(b"d"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IncorrectOffset { expected: 3, actual: 1 }));

        let good = UploadSessionCursor { session_id: id, offset: 3 };
        let commit = CommitInfo {
            path: RemotePath::parse("/dir/out.bin"),
            mode: WriteMode::Overwrite,
        };
        store
            .upload_session_finish(&good, Bytes::from_static(b"def"), &commit)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("dir/out.bin")).unwrap(), b"abcdef");
    }
}
