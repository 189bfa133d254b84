pub mod cache;
pub mod engine;
pub mod progress;
pub mod scanner;
pub mod transfer;
pub mod work_list;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::RemoteDirectoryCache;
pub use engine::{PoolConfig, PoolState, TransferMode, TransferReport, WorkerPool};
pub use progress::{format_size, ProgressObserver, TransferProgress};
pub use scanner::{accept_all, glob_to_regex, EntryFilter, ScanConfig, TreeDiffer};
pub use transfer::{ChunkedTransfer, TransferConfig, TransferError, TransferResult};
pub use work_list::{TransferItem, WorkList};
