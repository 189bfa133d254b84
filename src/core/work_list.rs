//! 传输清单
//!
//! 差异扫描阶段（单线程）生成清单，执行阶段只读。

use crate::storage::RemotePath;
use serde::Serialize;
use std::path::PathBuf;

/// 单个文件的传输指令
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferItem {
    pub name: String,
    pub remote_path: RemotePath,
    pub local_path: PathBuf,
    /// 下载：还需获取的字节数；上传：本地文件大小
    pub size: u64,
}

impl TransferItem {
    pub fn new(
        name: impl Into<String>,
        remote_path: RemotePath,
        local_path: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        Self {
            name: name.into(),
            remote_path,
            local_path: local_path.into(),
            size,
        }
    }
}

/// 传输清单
///
/// 只能通过 `push`/`extend` 添加条目，`total_size` 始终等于各条目大小之和。
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkList {
    items: Vec<TransferItem>,
    total_size: u64,
}

impl WorkList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: TransferItem) {
        self.total_size += item.size;
        self.items.push(item);
    }

    /// 合并另一次扫描的结果
    pub fn extend(&mut self, other: WorkList) {
        self.total_size += other.total_size;
        self.items.extend(other.items);
    }

    pub fn items(&self) -> &[TransferItem] {
        &self.items
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 需要实际执行的条目（大小为 0 的不入队）
    pub fn transferable(&self) -> impl Iterator<Item = &TransferItem> {
        self.items.iter().filter(|item| item.size > 0)
    }
}

impl FromIterator<TransferItem> for WorkList {
    fn from_iter<I: IntoIterator<Item = TransferItem>>(iter: I) -> Self {
        let mut list = WorkList::new();
        for item in iter {
            list.push(item);
        }
        list
    }
}

impl IntoIterator for WorkList {
    type Item = TransferItem;
    type IntoIter = std::vec::IntoIter<TransferItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, size: u64) -> TransferItem {
        TransferItem::new(name, RemotePath::parse(name), name, size)
    }

    #[test]
    fn test_total_size_tracks_items() {
        let mut list: WorkList = [item("/a", 3), item("/b", 7)].into_iter().collect();
        assert_eq!(list.total_size(), 10);

        let other: WorkList = [item("/c", 5)].into_iter().collect();
        list.extend(other);
        assert_eq!(list.len(), 3);
        assert_eq!(
            list.total_size(),
            list.items().iter().map(|i| i.size).sum::<u64>()
        );
    }

    #[test]
    fn test_zero_sized_items_are_not_transferable() {
        let list: WorkList = [item("/a", 10), item("/b", 0), item("/c", 5)]
            .into_iter()
            .collect();
        let sizes: Vec<u64> = list.transferable().map(|i| i.size).collect();
        assert_eq!(sizes, [10, 5]);
        assert_eq!(list.total_size(), 15);
    }
}
