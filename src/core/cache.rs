//! 远程目录缓存
//!
//! 以路径段为键的前缀树，记录每个已列出目录的子条目，用于回答
//! "远程路径是否存在"而不必每次都发起请求。一次运行内只增不减。

use crate::storage::{Metadata, RemotePath, RemoteStore, DEFAULT_LIST_LIMIT};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug)]
enum CacheNode {
    /// 已知存在，但尚未列出其内容（文件，或未展开的目录）
    Entry { path_lower: String },
    /// 已列出内容的目录；列表失败的目录也以空目录记录
    Dir {
        path_lower: String,
        children: HashMap<String, CacheNode>,
    },
}

impl CacheNode {
    fn path_lower(&self) -> &str {
        match self {
            CacheNode::Entry { path_lower } => path_lower,
            CacheNode::Dir { path_lower, .. } => path_lower,
        }
    }
}

/// 远程目录缓存，生命周期为一次同步会话
pub struct RemoteDirectoryCache {
    root: CacheNode,
    list_limit: u32,
    listing_calls: u64,
}

impl Default for RemoteDirectoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteDirectoryCache {
    pub fn new() -> Self {
        Self {
            root: CacheNode::Entry {
                path_lower: String::new(),
            },
            list_limit: DEFAULT_LIST_LIMIT,
            listing_calls: 0,
        }
    }

    pub fn with_list_limit(mut self, limit: u32) -> Self {
        self.list_limit = limit.max(1);
        self
    }

    /// 已发起的目录列表次数（每个目录最多一次）
    pub fn listing_calls(&self) -> u64 {
        self.listing_calls
    }

    /// 远程路径是否存在（大小写不敏感）
    ///
    /// 从根开始逐级检查祖先目录，未加载的目录向远程列出一次。某一级缺少
    /// 下一段时直接返回 false，不再向下请求。
    pub async fn exists(&mut self, store: &dyn RemoteStore, path: &RemotePath) -> bool {
        if path.is_root() {
            return true;
        }
        let key = path.to_lowercase();

        for depth in 0..key.len() {
            let dir_key = key.prefix(depth);

            let needs_listing = match self.node(&dir_key) {
                Some(CacheNode::Entry { .. }) => true,
                Some(CacheNode::Dir { .. }) => false,
                None => return false,
            };
            if needs_listing {
                let children = self.load_dir(store, &dir_key).await;
                if let Some(node) = self.node_mut(&dir_key) {
                    let path_lower = node.path_lower().to_string();
                    *node = CacheNode::Dir {
                        path_lower,
                        children,
                    };
                }
            }

            let next = &key.segments()[depth];
            match self.node(&dir_key) {
                Some(CacheNode::Dir { children, .. }) if children.contains_key(next) => {}
                _ => return false,
            }
        }

        true
    }

    /// 已缓存条目的规范远程路径（小写）
    pub fn canonical_path(&self, path: &RemotePath) -> Option<&str> {
        self.node(&path.to_lowercase()).map(CacheNode::path_lower)
    }

    async fn load_dir(&mut self, store: &dyn RemoteStore, dir: &RemotePath) -> HashMap<String, CacheNode> {
        self.listing_calls += 1;

        match store.list_folder_all(dir, self.list_limit).await {
            Ok(entries) => {
                debug!("缓存目录 {} ({} 个条目)", dir, entries.len());
                entries
                    .into_iter()
                    .filter(|e| !matches!(e, Metadata::Deleted(_)))
                    .map(|e| {
                        (
                            e.name().to_lowercase(),
                            CacheNode::Entry {
                                path_lower: e.path_lower().to_string(),
                            },
                        )
                    })
                    .collect()
            }
            Err(e) => {
                debug!("列出目录失败，按空目录缓存: {} - {}", dir, e);
                HashMap::new()
            }
        }
    }

    fn node(&self, key: &RemotePath) -> Option<&CacheNode> {
        let mut node = &self.root;
        for segment in key.segments() {
            node = match node {
                CacheNode::Dir { children, .. } => children.get(segment)?,
                CacheNode::Entry { .. } => return None,
            };
        }
        Some(node)
    }

    fn node_mut(&mut self, key: &RemotePath) -> Option<&mut CacheNode> {
        let mut node = &mut self.root;
        for segment in key.segments() {
            node = match node {
                CacheNode::Dir { children, .. } => children.get_mut(segment)?,
                CacheNode::Entry { .. } => return None,
            };
        }
        Some(node)
    }
}
