//! 远程路径
//!
//! 远程路径是一组有序的路径段，根目录为空序列（Dropbox 中写作 ""）。
//! 父目录通过去掉最后一段得到，不做字符串下标运算。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemotePath {
    segments: Vec<String>,
}

impl RemotePath {
    /// 根目录
    pub fn root() -> Self {
        Self::default()
    }

    /// 解析 "/a/b/c" 形式的路径，空段和 "." 被忽略
    pub fn parse(path: &str) -> Self {
        let segments = path
            .replace('\\', "/")
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect();
        Self { segments }
    }

    /// 由本地相对路径构造（只取普通路径段）
    pub fn from_relative(path: &Path) -> Self {
        let segments = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// 父目录；根目录没有父目录
    pub fn parent(&self) -> Option<RemotePath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// 追加一个或多个路径段（name 中的 '/' 会被拆开）
    pub fn join(&self, name: &str) -> RemotePath {
        let mut segments = self.segments.clone();
        segments.extend(RemotePath::parse(name).segments);
        Self { segments }
    }

    pub fn join_path(&self, other: &RemotePath) -> RemotePath {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// 前 n 段组成的祖先路径
    pub fn prefix(&self, n: usize) -> RemotePath {
        Self {
            segments: self.segments[..n.min(self.segments.len())].to_vec(),
        }
    }

    /// 小写形式，用于大小写不敏感的比较
    pub fn to_lowercase(&self) -> RemotePath {
        Self {
            segments: self.segments.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// API 使用的字符串形式：根目录为 ""，其余为 "/a/b"
    pub fn as_api_path(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl From<&str> for RemotePath {
    fn from(s: &str) -> Self {
        RemotePath::parse(s)
    }
}
