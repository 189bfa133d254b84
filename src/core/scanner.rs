use crate::core::cache::RemoteDirectoryCache;
use crate::core::work_list::{TransferItem, WorkList};
use crate::storage::{FolderMetadata, Metadata, RemotePath, RemoteStore, DEFAULT_LIST_LIMIT};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// 远程条目过滤器，返回 false 的条目不参与比较
pub type EntryFilter = dyn Fn(&Metadata) -> bool + Send + Sync;

/// 默认过滤器：全部包含
pub fn accept_all(_: &Metadata) -> bool {
    true
}

/// 扫描配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 排除规则（glob patterns，大小写不敏感）
    pub exclude_patterns: Vec<String>,
    /// 远程目录列表的分页大小
    pub list_page_size: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: vec![],
            list_page_size: DEFAULT_LIST_LIMIT,
        }
    }
}

/// 把 glob 转换为正则：`**` 跨目录，`*` 和 `?` 不跨 `/`
pub fn glob_to_regex(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    let pattern = pattern.replace('\\', "/");
    let chars: Vec<char> = pattern.chars().collect();
    let mut re = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');

    RegexBuilder::new(&re)
        .case_insensitive(case_insensitive)
        .build()
        .with_context(|| format!("无效的匹配模式: {}", pattern))
}

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// 排除规则集合
#[derive(Debug, Default)]
struct ExcludeSet {
    /// (正则, 是否只匹配文件名)
    rules: Vec<(Regex, bool)>,
}

impl ExcludeSet {
    fn new(patterns: &[String]) -> Result<Self> {
        let rules = patterns
            .iter()
            .map(|p| {
                let name_only = !p.trim_start_matches('/').contains('/');
                Ok((glob_to_regex(p.trim_start_matches('/'), true)?, name_only))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// `rel_path` 为使用 `/` 分隔的相对路径
    fn is_excluded(&self, rel_path: &str) -> bool {
        let rel_path = rel_path.trim_start_matches('/');
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        self.rules.iter().any(|(re, name_only)| {
            re.is_match(rel_path) || (*name_only && re.is_match(name))
        })
    }
}

/// 差异扫描器
///
/// 持有本次会话的远程目录缓存，生成 WorkList。扫描阶段是单线程的，
/// 缓存不需要同步。
pub struct TreeDiffer {
    store: Arc<dyn RemoteStore>,
    cache: RemoteDirectoryCache,
    config: ScanConfig,
    excludes: ExcludeSet,
}

impl TreeDiffer {
    pub fn new(store: Arc<dyn RemoteStore>, config: ScanConfig) -> Result<Self> {
        let excludes = ExcludeSet::new(&config.exclude_patterns)?;
        let cache = RemoteDirectoryCache::new().with_list_limit(config.list_page_size);
        Ok(Self {
            store,
            cache,
            config,
            excludes,
        })
    }

    pub fn cache(&self) -> &RemoteDirectoryCache {
        &self.cache
    }

    /// 下载方向：比较远程 `remote_root` 与本地 `local_dest`
    ///
    /// 获取根元数据失败时记录错误并返回空清单。
    pub async fn diff_download(
        &self,
        remote_root: &RemotePath,
        local_dest: &Path,
        filter: &EntryFilter,
    ) -> WorkList {
        info!("开始扫描远程: {} -> {}", remote_root, local_dest.display());

        let root = if remote_root.is_root() {
            // 根目录没有元数据，按目录处理
            Ok(Some(Metadata::Folder(FolderMetadata {
                name: String::new(),
                path_lower: String::new(),
                path_display: String::new(),
            })))
        } else {
            self.store.get_metadata(remote_root).await
        };

        let entry = match root {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                warn!("远程路径不存在: {}", remote_root);
                return WorkList::new();
            }
            Err(e) => {
                error!(
                    "获取远程元数据失败: remote={}, local={} - {}",
                    remote_root,
                    local_dest.display(),
                    e
                );
                return WorkList::new();
            }
        };

        // 单个文件且目标是已存在的目录时，文件放进该目录；否则目标就是文件本身
        let dest_is_dir = fs::metadata(local_dest)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let join_path = entry.is_file() && dest_is_dir;
        let root_lower = entry.path_lower().to_string();

        let mut work = WorkList::new();
        if let Err(e) = self
            .process_entries(
                vec![entry],
                local_dest.to_path_buf(),
                join_path,
                &root_lower,
                filter,
                &mut work,
            )
            .await
        {
            error!(
                "扫描失败: remote={}, local={} - {:#}",
                remote_root,
                local_dest.display(),
                e
            );
            return WorkList::new();
        }

        info!(
            "扫描完成: {} 个文件待下载, 共 {} 字节",
            work.len(),
            work.total_size()
        );
        work
    }

    fn process_entries<'a>(
        &'a self,
        mut entries: Vec<Metadata>,
        current_dir: PathBuf,
        join_path: bool,
        root_lower: &'a str,
        filter: &'a EntryFilter,
        work: &'a mut WorkList,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if join_path {
                fs::create_dir_all(&current_dir)
                    .await
                    .with_context(|| format!("创建本地目录失败: {}", current_dir.display()))?;
            }

            entries.sort_by_cached_key(|e| e.name().to_lowercase());

            for entry in entries {
                let current_path = if join_path {
                    current_dir.join(entry.name())
                } else {
                    current_dir.clone()
                };

                if matches!(entry, Metadata::Deleted(_)) {
                    continue;
                }
                // 排除规则按相对扫描根的路径匹配，根本身不参与
                let rel = relative_to(root_lower, entry.path_lower());
                if (!rel.is_empty() && self.excludes.is_excluded(rel)) || !filter(&entry) {
                    debug!("排除: {}", entry.path_lower());
                    continue;
                }

                match entry {
                    Metadata::File(file) => {
                        let remote_path = RemotePath::parse(&file.path_lower);
                        match local_file_size(&current_path).await? {
                            None => {
                                work.push(TransferItem::new(
                                    file.name,
                                    remote_path,
                                    current_path,
                                    file.size,
                                ));
                            }
                            Some(local_size) if file.size > local_size => {
                                debug!(
                                    "远程较大，追加下载: {} ({} > {})",
                                    file.path_lower, file.size, local_size
                                );
                                work.push(TransferItem::new(
                                    file.name,
                                    remote_path,
                                    current_path,
                                    file.size - local_size,
                                ));
                            }
                            Some(_) => {}
                        }
                    }
                    Metadata::Folder(folder) => {
                        let remote_path = RemotePath::parse(&folder.path_lower);
                        match self
                            .store
                            .list_folder_all(&remote_path, self.config.list_page_size)
                            .await
                        {
                            Ok(children) => {
                                self.process_entries(
                                    children,
                                    current_path,
                                    true,
                                    root_lower,
                                    filter,
                                    work,
                                )
                                .await?;
                            }
                            Err(e) => {
                                warn!("列出远程目录失败，跳过: {} - {}", remote_path, e);
                            }
                        }
                    }
                    Metadata::Deleted(_) => {}
                }
            }

            Ok(())
        })
    }

    /// 上传方向：递归遍历本地目录，远程不存在的文件加入清单
    ///
    /// 远程路径为 `remote_dest / rel_prefix / 相对路径`，只检查存在性，不比较大小。
    pub async fn diff_upload(
        &mut self,
        local_root: &Path,
        rel_prefix: &str,
        remote_dest: &RemotePath,
    ) -> WorkList {
        info!("开始扫描本地: {} -> {}", local_root.display(), remote_dest);

        let files = match list_local_files(local_root.to_path_buf()).await {
            Ok(files) => files,
            Err(e) => {
                error!("扫描本地目录失败: {} - {:#}", local_root.display(), e);
                return WorkList::new();
            }
        };

        let prefix = RemotePath::parse(rel_prefix);
        let base = remote_dest.join_path(&prefix);
        let mut work = WorkList::new();
        let mut skipped = 0usize;

        for (rel, full, size) in files {
            let rel_local = RemotePath::from_relative(&rel);
            if self.excludes.is_excluded(&rel_local.to_string()) {
                debug!("排除文件: {}", rel.display());
                continue;
            }

            let rel_remote = prefix.join_path(&rel_local);
            let remote_path = base.join_path(&rel_local);
            if self.cache.exists(self.store.as_ref(), &remote_path).await {
                skipped += 1;
                continue;
            }
            work.push(TransferItem::new(rel_remote.to_string(), remote_path, full, size));
        }

        info!(
            "扫描完成: {} 个文件待上传, {} 个已存在, 共 {} 字节 (目录列表 {} 次)",
            work.len(),
            skipped,
            work.total_size(),
            self.cache.listing_calls()
        );
        work
    }

    /// 上传方向（glob）：展开模式，远程路径为 `remote_dest / (相对 rel_base 的路径)`
    ///
    /// `check_exists` 为 false 时不检查远程，全部上传。
    pub async fn diff_upload_glob(
        &mut self,
        pattern: &str,
        rel_base: &Path,
        remote_dest: &RemotePath,
        check_exists: bool,
    ) -> WorkList {
        info!("展开匹配模式: {}", pattern);

        let matches = match expand_glob(pattern.to_string()).await {
            Ok(m) => m,
            Err(e) => {
                error!("展开匹配模式失败: {} - {:#}", pattern, e);
                return WorkList::new();
            }
        };

        let mut work = WorkList::new();
        for (full, size) in matches {
            let rel = match full.strip_prefix(rel_base) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => full.clone(),
            };
            let rel_remote = RemotePath::from_relative(&rel);
            if self.excludes.is_excluded(&rel_remote.to_string()) {
                continue;
            }

            let remote_path = remote_dest.join_path(&rel_remote);
            if check_exists && self.cache.exists(self.store.as_ref(), &remote_path).await {
                continue;
            }
            work.push(TransferItem::new(
                rel_remote.to_string().trim_start_matches('/'),
                remote_path,
                full,
                size,
            ));
        }

        info!(
            "匹配完成: {} 个文件待上传, 共 {} 字节",
            work.len(),
            work.total_size()
        );
        work
    }
}

/// `path_lower` 相对 `root_lower` 的部分，不带开头的 `/`
fn relative_to<'p>(root_lower: &str, path_lower: &'p str) -> &'p str {
    path_lower
        .strip_prefix(root_lower)
        .unwrap_or(path_lower)
        .trim_start_matches('/')
}

/// 本地文件大小；不存在时返回 None
async fn local_file_size(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            warn!("本地同名路径是目录，跳过: {}", path.display());
            Ok(Some(u64::MAX))
        }
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("读取本地文件信息失败: {}", path.display())),
    }
}

/// 递归列出本地普通文件：(相对路径, 完整路径, 大小)，按名称排序
async fn list_local_files(root: PathBuf) -> Result<Vec<(PathBuf, PathBuf, u64)>> {
    if !fs::metadata(&root).await?.is_dir() {
        anyhow::bail!("不是目录: {}", root.display());
    }

    // 使用 spawn_blocking 避免阻塞 async runtime
    let files = tokio::task::spawn_blocking(move || {
        WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| match e {
                Ok(e) => Some(e),
                Err(err) => {
                    debug!("跳过无法访问的路径: {}", err);
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(&root).ok()?.to_path_buf();
                let size = entry.metadata().ok()?.len();
                Some((rel, entry.path().to_path_buf(), size))
            })
            .collect::<Vec<_>>()
    })
    .await?;

    Ok(files)
}

/// 展开 glob：从模式中第一个含通配符的路径段之前的目录开始遍历
async fn expand_glob(pattern: String) -> Result<Vec<(PathBuf, u64)>> {
    let normalized = pattern.replace('\\', "/");

    if !has_wildcard(&normalized) {
        let path = PathBuf::from(&pattern);
        return match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(vec![(path, meta.len())]),
            _ => Ok(vec![]),
        };
    }

    let absolute = normalized.starts_with('/');
    let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    let literal = segments.iter().take_while(|s| !has_wildcard(s)).count();

    let mut base = if absolute {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for s in &segments[..literal] {
        base.push(s);
    }
    let rest = segments[literal..].join("/");
    let matcher = glob_to_regex(&rest, false)?;
    let walk_root = if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        base.clone()
    };

    let found = tokio::task::spawn_blocking(move || {
        WalkDir::new(&walk_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(&walk_root).ok()?;
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                if !matcher.is_match(&rel_str) {
                    return None;
                }
                let size = entry.metadata().ok()?.len();
                Some((base.join(rel), size))
            })
            .collect::<Vec<_>>()
    })
    .await?;

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{write_file, TestStore};
    use std::sync::atomic::Ordering;

    fn differ(store: Arc<TestStore>) -> TreeDiffer {
        TreeDiffer::new(store, ScanConfig::default()).unwrap()
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("**/*.txt", false).unwrap();
        assert!(re.is_match("a.txt"));
        assert!(re.is_match("x/y/a.txt"));
        assert!(!re.is_match("a.txt.bak"));

        let re = glob_to_regex("*.txt", false).unwrap();
        assert!(re.is_match("a.txt"));
        assert!(!re.is_match("dir/a.txt"));

        let re = glob_to_regex("img?.PNG", true).unwrap();
        assert!(re.is_match("img1.png"));
        assert!(!re.is_match("img12.png"));
    }

    #[test]
    fn test_exclude_set() {
        let set = ExcludeSet::new(&[".git/**".to_string(), "*.tmp".to_string()]).unwrap();
        assert!(set.is_excluded("/.git/config"));
        assert!(set.is_excluded("/docs/a.TMP"));
        assert!(!set.is_excluded("/docs/a.txt"));
    }

    #[tokio::test]
    async fn test_download_diff_size_policy() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write_file(remote.path(), "same.bin", &[1u8; 100]);
        write_file(remote.path(), "grown.bin", &[2u8; 150]);
        write_file(remote.path(), "new.bin", &[3u8; 40]);
        write_file(remote.path(), "shrunk.bin", &[4u8; 10]);
        write_file(remote.path(), "Sub/deep.bin", &[5u8; 7]);
        write_file(local.path(), "same.bin", &[1u8; 100]);
        write_file(local.path(), "grown.bin", &[2u8; 100]);
        write_file(local.path(), "shrunk.bin", &[4u8; 20]);

        let store = Arc::new(TestStore::new(remote.path()));
        let work = differ(store)
            .diff_download(&RemotePath::root(), local.path(), &accept_all)
            .await;

        let got: Vec<(String, u64)> = work
            .items()
            .iter()
            .map(|i| (i.name.clone(), i.size))
            .collect();
        assert_eq!(
            got,
            [
                ("grown.bin".to_string(), 50),
                ("new.bin".to_string(), 40),
                ("deep.bin".to_string(), 7),
            ]
        );
        assert_eq!(work.total_size(), 97);
        assert!(local.path().join("Sub").is_dir());
        assert_eq!(work.items()[2].local_path, local.path().join("Sub").join("deep.bin"));
    }

    #[tokio::test]
    async fn test_download_diff_follows_pages_and_filter() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_file(remote.path(), &format!("dir/f{}.txt", i), b"abc");
        }
        write_file(remote.path(), "dir/skip.log", b"abc");

        let store = Arc::new(TestStore::new(remote.path()));
        let config = ScanConfig {
            list_page_size: 2,
            ..Default::default()
        };
        let differ = TreeDiffer::new(store.clone(), config).unwrap();
        let only_txt = |m: &Metadata| !m.name().ends_with(".log");
        let work = differ
            .diff_download(&RemotePath::parse("/dir"), local.path(), &only_txt)
            .await;

        assert_eq!(work.len(), 5);
        assert!(store.calls.list_folder_continue.load(Ordering::SeqCst) >= 2);
        // 目标为目录本身（不再嵌套一层 dir）
        assert_eq!(work.items()[0].local_path, local.path().join("f0.txt"));
    }

    #[tokio::test]
    async fn test_download_single_file_into_directory() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write_file(remote.path(), "a/report.pdf", b"12345");

        let store = Arc::new(TestStore::new(remote.path()));
        let d = differ(store);
        let work = d
            .diff_download(&RemotePath::parse("/a/report.pdf"), local.path(), &accept_all)
            .await;
        assert_eq!(work.items()[0].local_path, local.path().join("report.pdf"));

        let target = local.path().join("renamed.pdf");
        let work = d
            .diff_download(&RemotePath::parse("/a/report.pdf"), &target, &accept_all)
            .await;
        assert_eq!(work.items()[0].local_path, target);
    }

    #[tokio::test]
    async fn test_download_missing_root_is_empty() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let store = Arc::new(TestStore::new(remote.path()));
        let work = differ(store)
            .diff_download(&RemotePath::parse("/nothing/here"), local.path(), &accept_all)
            .await;
        assert!(work.is_empty());
        assert_eq!(work.total_size(), 0);
    }

    #[tokio::test]
    async fn test_download_root_metadata_error_is_empty() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write_file(remote.path(), "docs/a.txt", b"abc");
        let store = Arc::new(TestStore::new(remote.path()));
        store.fail_metadata("/docs");

        let work = differ(store)
            .diff_download(&RemotePath::parse("/docs"), local.path(), &accept_all)
            .await;
        assert!(work.is_empty());
        assert_eq!(work.total_size(), 0);
    }

    #[tokio::test]
    async fn test_excludes_are_relative_to_subfolder_root() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write_file(remote.path(), "proj/a.txt", b"abc");
        write_file(remote.path(), "proj/node_modules/x.js", b"x");
        write_file(local.path(), "src/b.txt", b"bb");
        write_file(local.path(), "node_modules/y.js", b"y");

        let store = Arc::new(TestStore::new(remote.path()));
        let config = ScanConfig {
            exclude_patterns: vec!["node_modules/**".to_string()],
            ..Default::default()
        };
        let mut d = TreeDiffer::new(store, config).unwrap();

        let down = d
            .diff_download(&RemotePath::parse("/proj"), local.path(), &accept_all)
            .await;
        let remotes: Vec<String> = down.items().iter().map(|i| i.remote_path.to_string()).collect();
        assert_eq!(remotes, ["/proj/a.txt"]);

        // 前缀不影响排除规则
        let up = d
            .diff_upload(local.path(), "backup", &RemotePath::parse("/dst"))
            .await;
        let remotes: Vec<String> = up.items().iter().map(|i| i.remote_path.to_string()).collect();
        assert_eq!(remotes, ["/dst/backup/src/b.txt"]);
    }

    #[tokio::test]
    async fn test_upload_diff_skips_existing() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write_file(local.path(), "a.txt", b"aaaa");
        write_file(local.path(), "sub/b.txt", b"bb");
        write_file(local.path(), "sub/c.txt", b"c");
        // 远程已有 b.txt（大小不同也视为已存在）
        write_file(remote.path(), "backup/photos/sub/B.TXT", b"different");

        let store = Arc::new(TestStore::new(remote.path()));
        let mut d = differ(store);
        let work = d
            .diff_upload(local.path(), "photos", &RemotePath::parse("/backup"))
            .await;

        let remotes: Vec<String> = work.items().iter().map(|i| i.remote_path.to_string()).collect();
        assert_eq!(remotes, ["/backup/photos/a.txt", "/backup/photos/sub/c.txt"]);
        assert_eq!(work.items()[0].name, "/photos/a.txt");
        assert_eq!(work.total_size(), 5);
    }

    #[tokio::test]
    async fn test_upload_glob_with_and_without_check() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write_file(local.path(), "logs/2024/a.log", b"111");
        write_file(local.path(), "logs/2024/b.txt", b"22");
        write_file(local.path(), "logs/c.log", b"3");
        write_file(remote.path(), "dst/logs/c.log", b"3");

        let store = Arc::new(TestStore::new(remote.path()));
        let mut d = differ(store);
        let pattern = format!("{}/logs/**/*.log", local.path().display());
        let dest = RemotePath::parse("/dst");

        let checked = d.diff_upload_glob(&pattern, local.path(), &dest, true).await;
        let remotes: Vec<String> = checked.items().iter().map(|i| i.remote_path.to_string()).collect();
        assert_eq!(remotes, ["/dst/logs/2024/a.log"]);

        let unchecked = d.diff_upload_glob(&pattern, local.path(), &dest, false).await;
        assert_eq!(unchecked.len(), 2);
        assert_eq!(unchecked.total_size(), 4);
    }
}
