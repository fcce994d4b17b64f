//! 存储模块 - 同步 SDK 的数据持久化层
//!
//! 分层架构：
//! - UploadQueue: 持久化上传队列（SQLite，单写者 Actor）
//! - KvStore: 锚点与同步状态的 KV 存储（sled，多用户 Tree 隔离）
//! - migrate: 队列库的 schema 迁移与版本护栏

use crate::error::Result;

pub mod db_actor;
pub mod kv;
pub mod migrate;
pub mod queue;

// 重新导出核心类型
pub use kv::KvStore;
pub use queue::{
    QueueStatistics, QueuedUpload, RetryPolicy, UploadPriority, UploadQueue, UploadStatus,
};

/// SDK 版本号 - 来自 Cargo.toml（参见 crate::version）
pub use crate::version::SDK_VERSION;

/// KV 存储统计信息
#[derive(Debug, Clone)]
pub struct KvStats {
    pub tree_size: u64,
    pub key_count: u64,
    pub total_keys: u64,
    pub storage_size: u64,
}

/// 汇总的本地存储健康报告（诊断接口用）
#[derive(Debug, Clone)]
pub struct StorageReport {
    pub queue: QueueStatistics,
    pub kv: KvStats,
}

impl StorageReport {
    /// 汇总队列与 KV 的统计，任一侧失败则整体失败
    pub async fn collect(queue: &UploadQueue, kv: &KvStore) -> Result<Self> {
        Ok(Self {
            queue: queue.statistics().await?,
            kv: kv.get_stats().await?,
        })
    }
}
