//! Dropbox API v2 客户端
//!
//! 只实现同步引擎需要的接口。参数通过 `Dropbox-API-Arg` 头传递，
//! access token 由 refresh token 换取，过期前 5 分钟视为需要刷新。

use super::{
    CommitInfo, DeletedMetadata, FileMetadata, FolderMetadata, ListFolderPage, Metadata,
    RangeResponse, RemotePath, RemoteStore, StoreError, StoreResult, UploadSessionCursor,
    WriteMode, OP_TIMEOUT_SECS,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const API_URL: &str = "https://api.dropboxapi.com/2";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2";
const TOKEN_URL: &str = "https://api.dropbox.com/oauth2/token";
/// 距离过期不足该秒数时刷新 token
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    /// None 表示过期时间未知（来自配置文件）
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at - now > ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS),
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum ApiMetadata {
    File {
        name: String,
        #[serde(default)]
        path_lower: Option<String>,
        #[serde(default)]
        path_display: Option<String>,
        size: u64,
        #[serde(default)]
        server_modified: Option<DateTime<Utc>>,
        #[serde(default)]
        content_hash: Option<String>,
    },
    Folder {
        name: String,
        #[serde(default)]
        path_lower: Option<String>,
        #[serde(default)]
        path_display: Option<String>,
    },
    Deleted {
        name: String,
        #[serde(default)]
        path_lower: Option<String>,
    },
}

impl From<ApiMetadata> for Metadata {
    fn from(m: ApiMetadata) -> Self {
        match m {
            ApiMetadata::File {
                name,
                path_lower,
                path_display,
                size,
                server_modified,
                content_hash,
            } => Metadata::File(FileMetadata {
                name,
                path_lower: path_lower.unwrap_or_default(),
                path_display: path_display.unwrap_or_default(),
                size,
                server_modified,
                content_hash,
            }),
            ApiMetadata::Folder {
                name,
                path_lower,
                path_display,
            } => Metadata::Folder(FolderMetadata {
                name,
                path_lower: path_lower.unwrap_or_default(),
                path_display: path_display.unwrap_or_default(),
            }),
            ApiMetadata::Deleted { name, path_lower } => Metadata::Deleted(DeletedMetadata {
                name,
                path_lower: path_lower.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiListFolder {
    entries: Vec<ApiMetadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ApiSessionStart {
    session_id: String,
}

pub struct DropboxStore {
    client: Client,
    app_key: String,
    app_secret: Option<String>,
    refresh_token: String,
    token: RwLock<Option<AccessToken>>,
    name: String,
}

impl DropboxStore {
    pub fn new(
        app_key: &str,
        app_secret: Option<String>,
        refresh_token: &str,
        access_token: Option<String>,
    ) -> StoreResult<Self> {
        // 下载是长连接流，只限制连接时间，单次 RPC 另设超时
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .build()?;

        let token = access_token
            .filter(|t| !t.is_empty())
            .map(|token| AccessToken {
                token,
                expires_at: None,
            });

        Ok(Self {
            client,
            app_key: app_key.to_string(),
            app_secret,
            refresh_token: refresh_token.to_string(),
            token: RwLock::new(token),
            name: "dropbox".to_string(),
        })
    }

    async fn bearer(&self) -> StoreResult<String> {
        if let Some(t) = self.token.read().await.as_ref() {
            if t.is_fresh(Utc::now()) {
                return Ok(t.token.clone());
            }
        }
        self.refresh_access_token().await?;
        self.token
            .read()
            .await
            .as_ref()
            .map(|t| t.token.clone())
            .ok_or_else(|| StoreError::Auth("没有可用的 access token".to_string()))
    }

    async fn rpc(&self, endpoint: &str, arg: Value) -> StoreResult<Response> {
        let token = self.bearer().await?;
        let resp = self
            .client
            .post(format!("{}/{}", API_URL, endpoint))
            .bearer_auth(token)
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .json(&arg)
            .send()
            .await?;
        self.check(resp).await
    }

    fn content_request(&self, endpoint: &str, token: &str, arg: &Value) -> RequestBuilder {
        self.client
            .post(format!("{}/{}", CONTENT_URL, endpoint))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", header_arg(arg))
    }

    async fn content_upload(&self, endpoint: &str, arg: Value, data: Bytes) -> StoreResult<Response> {
        let token = self.bearer().await?;
        let resp = self
            .content_request(endpoint, &token, &arg)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        self.check(resp).await
    }

    /// 把非 2xx 响应转换成 StoreError
    async fn check(&self, resp: Response) -> StoreResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let summary = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error_summary")?.as_str().map(str::to_string))
            .unwrap_or(body);

        if status == StatusCode::UNAUTHORIZED {
            // 下一次请求前重新换取 token
            *self.token.write().await = None;
            return Err(StoreError::Auth(summary));
        }
        if status == StatusCode::CONFLICT && summary.contains("not_found") {
            return Err(StoreError::NotFound(summary));
        }
        Err(StoreError::Api {
            status: status.as_u16(),
            summary,
        })
    }

    fn list_page(page: ApiListFolder) -> ListFolderPage {
        ListFolderPage {
            entries: page.entries.into_iter().map(Metadata::from).collect(),
            cursor: page.cursor,
            has_more: page.has_more,
        }
    }
}

fn mode_tag(mode: WriteMode) -> &'static str {
    match mode {
        WriteMode::Add => "add",
        WriteMode::Overwrite => "overwrite",
    }
}

/// HTTP 头只能携带 ASCII，非 ASCII 字符按 JSON 规则转义为 \uXXXX
fn header_arg(arg: &Value) -> String {
    let raw = arg.to_string();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

#[async_trait]
impl RemoteStore for DropboxStore {
    async fn get_metadata(&self, path: &RemotePath) -> StoreResult<Option<Metadata>> {
        match self
            .rpc("files/get_metadata", json!({ "path": path.as_api_path() }))
            .await
        {
            Ok(resp) => {
                let meta: ApiMetadata = resp.json().await?;
                Ok(Some(meta.into()))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_folder(&self, path: &RemotePath, limit: u32) -> StoreResult<ListFolderPage> {
        let resp = self
            .rpc(
                "files/list_folder",
                json!({ "path": path.as_api_path(), "limit": limit }),
            )
            .await?;
        Ok(Self::list_page(resp.json().await?))
    }

    async fn list_folder_continue(&self, cursor: &str) -> StoreResult<ListFolderPage> {
        let resp = self
            .rpc("files/list_folder/continue", json!({ "cursor": cursor }))
            .await?;
        Ok(Self::list_page(resp.json().await?))
    }

    async fn download_range(&self, path: &RemotePath, offset: u64) -> StoreResult<RangeResponse> {
        let token = self.bearer().await?;
        let arg = json!({ "path": path.as_api_path() });
        let resp = self
            .content_request("files/download", &token, &arg)
            .header(header::RANGE, format!("bytes={}-", offset))
            .send()
            .await?;

        if resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!("范围不可满足，已下载完成: {} @ {}", path, offset);
            return Ok(RangeResponse::NotSatisfiable);
        }

        let resp = self.check(resp).await?;
        if offset > 0 && resp.status() != StatusCode::PARTIAL_CONTENT {
            warn!("服务端忽略了 Range 请求: {} @ {}", path, offset);
            return Err(StoreError::Api {
                status: resp.status().as_u16(),
                summary: "range ignored by server".to_string(),
            });
        }

        let stream = resp.bytes_stream().map_err(StoreError::Http);
        Ok(RangeResponse::Stream(Box::pin(stream)))
    }

    async fn upload(&self, path: &RemotePath, data: Bytes, mode: WriteMode) -> StoreResult<()> {
        let arg = json!({
            "path": path.as_api_path(),
            "mode": mode_tag(mode),
            "autorename": false,
            "mute": false,
        });
        self.content_upload("files/upload", arg, data).await?;
        Ok(())
    }

    async fn upload_session_start(&self, data: Bytes) -> StoreResult<String> {
        let resp = self
            .content_upload("files/upload_session/start", json!({ "close": false }), data)
            .await?;
        let started: ApiSessionStart = resp.json().await?;
        Ok(started.session_id)
    }

    async fn upload_session_append(&self, cursor: &UploadSessionCursor, data: Bytes) -> StoreResult<()> {
        let arg = json!({
            "cursor": { "session_id": cursor.session_id, "offset": cursor.offset },
            "close": false,
        });
        self.content_upload("files/upload_session/append_v2", arg, data)
            .await?;
        Ok(())
    }

    async fn upload_session_finish(
        &self,
        cursor: &UploadSessionCursor,
        data: Bytes,
        commit: &CommitInfo,
    ) -> StoreResult<()> {
        let arg = json!({
            "cursor": { "session_id": cursor.session_id, "offset": cursor.offset },
            "commit": {
                "path": commit.path.as_api_path(),
                "mode": mode_tag(commit.mode),
                "autorename": false,
                "mute": false,
            },
        });
        self.content_upload("files/upload_session/finish", arg, data)
            .await?;
        Ok(())
    }

    async fn refresh_access_token(&self) -> StoreResult<()> {
        let now = Utc::now();
        if let Some(t) = self.token.read().await.as_ref() {
            if t.is_fresh(now) {
                return Ok(());
            }
        }

        let mut guard = self.token.write().await;
        // 等待写锁期间可能已被其他调用刷新
        if let Some(t) = guard.as_ref() {
            if t.is_fresh(Utc::now()) {
                return Ok(());
            }
        }

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", self.refresh_token.clone()),
            ("client_id", self.app_key.clone()),
        ];
        if let Some(secret) = &self.app_secret {
            form.push(("client_secret", secret.clone()));
        }

        let resp = self
            .client
            .post(TOKEN_URL)
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .form(&form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!("刷新 token 失败 ({}): {}", status, body)));
        }

        let token: TokenResponse = resp.json().await?;
        let expires_at = token
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        info!("access token 已刷新, 过期时间: {:?}", expires_at);
        *guard = Some(AccessToken {
            token: token.access_token,
            expires_at,
        });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_arg_escapes_non_ascii() {
        let arg = json!({ "path": "/文档/é.txt" });
        let encoded = header_arg(&arg);
        assert!(encoded.is_ascii());
        assert_eq!(encoded, r#"{"path":"/\u6587\u6863/\u00e9.txt"}"#);
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, arg);
    }

    #[test]
    fn test_header_arg_surrogate_pair() {
        let encoded = header_arg(&json!({ "path": "/😀" }));
        assert_eq!(encoded, r#"{"path":"/\ud83d\ude00"}"#);
    }

    #[test]
    fn test_token_freshness() {
        let now = Utc::now();
        let soon = AccessToken {
            token: "t".into(),
            expires_at: Some(now + ChronoDuration::seconds(60)),
        };
        let later = AccessToken {
            token: "t".into(),
            expires_at: Some(now + ChronoDuration::hours(3)),
        };
        let unknown = AccessToken {
            token: "t".into(),
            expires_at: None,
        };
        assert!(!soon.is_fresh(now));
        assert!(later.is_fresh(now));
        assert!(unknown.is_fresh(now));
    }

    #[test]
    fn test_parse_list_folder() {
        let body = r#"{
            "entries": [
                {".tag": "folder", "name": "Docs", "path_lower": "/docs", "path_display": "/Docs", "id": "id:1"},
                {".tag": "file", "name": "a.txt", "path_lower": "/a.txt", "path_display": "/a.txt",
                 "size": 12, "server_modified": "2024-01-02T03:04:05Z", "content_hash": "abc", "rev": "1"},
                {".tag": "deleted", "name": "old.txt", "path_lower": "/old.txt"}
            ],
            "cursor": "c1",
            "has_more": true
        }"#;
        let page = DropboxStore::list_page(serde_json::from_str(body).unwrap());
        assert_eq!(page.entries.len(), 3);
        assert!(page.has_more);
        assert!(matches!(&page.entries[0], Metadata::Folder(f) if f.path_lower == "/docs"));
        assert!(matches!(&page.entries[1], Metadata::File(f) if f.size == 12));
        assert!(matches!(&page.entries[2], Metadata::Deleted(_)));
    }
}
