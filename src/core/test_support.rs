//! 测试用的远程存储：在 LocalStore 外包一层，统计调用次数并按需注入失败

use crate::storage::{
    CommitInfo, ListFolderPage, LocalStore, Metadata, RangeResponse, RemotePath, RemoteStore,
    StoreError, StoreResult, UploadSessionCursor, WriteMode,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct CallCounts {
    pub get_metadata: AtomicUsize,
    pub list_folder: AtomicUsize,
    pub list_folder_continue: AtomicUsize,
    pub download: AtomicUsize,
    pub upload: AtomicUsize,
    pub session_start: AtomicUsize,
    pub session_append: AtomicUsize,
    pub session_finish: AtomicUsize,
    pub refresh: AtomicUsize,
}

pub struct TestStore {
    pub inner: LocalStore,
    pub calls: CallCounts,
    /// 接下来 N 次传输调用（下载或上传）失败
    fail_transfers: AtomicU32,
    /// 这些小写路径的传输调用总是失败
    broken_paths: Mutex<HashSet<String>>,
    /// 这些小写路径的列表调用总是失败
    broken_listings: Mutex<HashSet<String>>,
    /// 这些小写路径的元数据调用总是失败
    broken_metadata: Mutex<HashSet<String>>,
    /// 再成功 N 次传输调用后失败一次
    fail_after: Mutex<Option<u32>>,
    /// 下一次下载在发送这么多字节后中断
    cut_next_download: Mutex<Option<usize>>,
    /// 每次会话调用收到的字节，按调用顺序
    pub session_bytes: Mutex<Vec<Vec<u8>>>,
    /// 每个被下载的路径（小写），按调用顺序
    pub downloaded: Mutex<Vec<String>>,
    refreshing: AtomicBool,
    pub overlapping_refresh: AtomicBool,
}

impl TestStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalStore::new(root).unwrap(),
            calls: CallCounts::default(),
            fail_transfers: AtomicU32::new(0),
            broken_paths: Mutex::new(HashSet::new()),
            broken_listings: Mutex::new(HashSet::new()),
            broken_metadata: Mutex::new(HashSet::new()),
            fail_after: Mutex::new(None),
            cut_next_download: Mutex::new(None),
            session_bytes: Mutex::new(Vec::new()),
            downloaded: Mutex::new(Vec::new()),
            refreshing: AtomicBool::new(false),
            overlapping_refresh: AtomicBool::new(false),
        }
    }

    pub fn fail_next_transfers(&self, n: u32) {
        self.fail_transfers.store(n, Ordering::SeqCst);
    }

    pub fn break_path(&self, path: &str) {
        self.broken_paths.lock().unwrap().insert(path.to_lowercase());
    }

    pub fn fail_listing(&self, path: &str) {
        self.broken_listings.lock().unwrap().insert(path.to_lowercase());
    }

    pub fn fail_metadata(&self, path: &str) {
        self.broken_metadata.lock().unwrap().insert(path.to_lowercase());
    }

    pub fn cut_next_download_after(&self, bytes: usize) {
        *self.cut_next_download.lock().unwrap() = Some(bytes);
    }

    pub fn fail_after_transfers(&self, n: u32) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    fn check_transfer(&self, path: Option<&RemotePath>) -> StoreResult<()> {
        if let Some(path) = path {
            let key = path.to_lowercase().to_string();
            if self.broken_paths.lock().unwrap().contains(&key) {
                return Err(StoreError::Api {
                    status: 500,
                    summary: format!("injected failure for {}", key),
                });
            }
        }
        {
            let mut fail_after = self.fail_after.lock().unwrap();
            match *fail_after {
                Some(0) => {
                    *fail_after = None;
                    return Err(StoreError::Api {
                        status: 503,
                        summary: "injected failure after successful calls".to_string(),
                    });
                }
                Some(n) => *fail_after = Some(n - 1),
                None => {}
            }
        }
        let took = self
            .fail_transfers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if took.is_ok() {
            return Err(StoreError::Api {
                status: 503,
                summary: "injected transient failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for TestStore {
    async fn get_metadata(&self, path: &RemotePath) -> StoreResult<Option<Metadata>> {
        self.calls.get_metadata.fetch_add(1, Ordering::SeqCst);
        let key = path.to_lowercase().to_string();
        if self.broken_metadata.lock().unwrap().contains(&key) {
            return Err(StoreError::Api {
                status: 500,
                summary: format!("injected metadata failure for {}", key),
            });
        }
        self.inner.get_metadata(path).await
    }

    async fn list_folder(&self, path: &RemotePath, limit: u32) -> StoreResult<ListFolderPage> {
        self.calls.list_folder.fetch_add(1, Ordering::SeqCst);
        let key = path.to_lowercase().to_string();
        if self.broken_listings.lock().unwrap().contains(&key) {
            return Err(StoreError::Api {
                status: 500,
                summary: format!("injected listing failure for {}", key),
            });
        }
        self.inner.list_folder(path, limit).await
    }

    async fn list_folder_continue(&self, cursor: &str) -> StoreResult<ListFolderPage> {
        self.calls.list_folder_continue.fetch_add(1, Ordering::SeqCst);
        self.inner.list_folder_continue(cursor).await
    }

    async fn download_range(&self, path: &RemotePath, offset: u64) -> StoreResult<RangeResponse> {
        self.calls.download.fetch_add(1, Ordering::SeqCst);
        self.check_transfer(Some(path))?;
        self.downloaded
            .lock()
            .unwrap()
            .push(path.to_lowercase().to_string());
        let response = self.inner.download_range(path, offset).await?;
        let cut = self.cut_next_download.lock().unwrap().take();
        match (response, cut) {
            (RangeResponse::Stream(stream), Some(cut)) => {
                let body: Vec<Bytes> = stream.try_collect().await?;
                let mut sent = body.concat();
                sent.truncate(cut);
                let items: Vec<StoreResult<Bytes>> = vec![
                    Ok(Bytes::from(sent)),
                    Err(StoreError::Api {
                        status: 500,
                        summary: "injected stream interruption".to_string(),
                    }),
                ];
                Ok(RangeResponse::Stream(Box::pin(futures::stream::iter(items))))
            }
            (response, _) => Ok(response),
        }
    }

    async fn upload(&self, path: &RemotePath, data: Bytes, mode: WriteMode) -> StoreResult<()> {
        self.calls.upload.fetch_add(1, Ordering::SeqCst);
        self.check_transfer(Some(path))?;
        self.inner.upload(path, data, mode).await
    }

    async fn upload_session_start(&self, data: Bytes) -> StoreResult<String> {
        self.calls.session_start.fetch_add(1, Ordering::SeqCst);
        self.check_transfer(None)?;
        self.session_bytes.lock().unwrap().push(data.to_vec());
        self.inner.upload_session_start(data).await
    }

    async fn upload_session_append(&self, cursor: &UploadSessionCursor, data: Bytes) -> StoreResult<()> {
        self.calls.session_append.fetch_add(1, Ordering::SeqCst);
        self.check_transfer(None)?;
        self.session_bytes.lock().unwrap().push(data.to_vec());
        self.inner.upload_session_append(cursor, data).await
    }

    async fn upload_session_finish(
        &self,
        cursor: &UploadSessionCursor,
        data: Bytes,
        commit: &CommitInfo,
    ) -> StoreResult<()> {
        self.calls.session_finish.fetch_add(1, Ordering::SeqCst);
        self.check_transfer(Some(&commit.path))?;
        self.session_bytes.lock().unwrap().push(data.to_vec());
        self.inner.upload_session_finish(cursor, data, commit).await
    }

    async fn refresh_access_token(&self) -> StoreResult<()> {
        self.calls.refresh.fetch_add(1, Ordering::SeqCst);
        if self.refreshing.swap(true, Ordering::SeqCst) {
            self.overlapping_refresh.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.refreshing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// 在目录下写入文件（自动创建父目录）
pub fn write_file(root: &Path, rel: &str, data: &[u8]) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, data).unwrap();
}

/// 可预测的测试数据
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
