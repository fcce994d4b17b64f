//! HealthSync SDK - 离线优先的健康数据同步管道
//!
//! 本 SDK 把宿主健康库的样本可靠地送达服务端，提供：
//! - 📤 四个执行面共用一条管道：实时变更、前台对账、短/长执行窗口
//! - 💾 持久化上传队列：SQLite 单写者 Actor，进程崩溃后自动回收在途批次
//! - ⚓ 锚点增量读取：样本妥善落地后才推进游标，至少一次送达
//! - ♻️ 双层重试：尝试级指数退避 + 队列级退避窗口与重试上限
//! - 📦 超大序列旁路：心电等高频数据走预签名直传，主包络引用对象键
//! - 📊 同步质量分析：成功率 / 时延 / 连败分层与调优建议
//! - ⚙️ 事件系统：统一的事件广播和统计
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tokio::sync::broadcast;
//! use healthsync_sdk::{FetchDelta, HealthDataSource, HealthSyncClient, HealthSyncConfig, Result};
//!
//! // 宿主平台实现 HealthDataSource，把系统健康库接进来
//! struct MySource {
//!     live_tx: broadcast::Sender<String>,
//! }
//!
//! #[async_trait]
//! impl HealthDataSource for MySource {
//!     async fn authorize(&self, _source_types: &[String]) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn incremental_fetch(
//!         &self,
//!         _source_type: &str,
//!         anchor: Option<Vec<u8>>,
//!     ) -> Result<FetchDelta> {
//!         Ok(FetchDelta {
//!             added: vec![],
//!             deleted_ids: vec![],
//!             new_anchor: anchor.unwrap_or_default(),
//!         })
//!     }
//!
//!     fn live_changes(&self) -> broadcast::Receiver<String> {
//!         self.live_tx.subscribe()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (live_tx, _) = broadcast::channel(16);
//!     let source = Arc::new(MySource { live_tx });
//!
//!     // 配置 SDK
//!     let config = HealthSyncConfig::builder()
//!         .data_dir("./healthsync_data")
//!         .api_url("https://api.example.com/app")
//!         .auth_header("Authorization", "Bearer <token>")
//!         .build();
//!
//!     // 初始化 SDK
//!     let client = HealthSyncClient::initialize("user123", source, config).await?;
//!
//!     // 请求读取授权并启用后台同步
//!     client.request_authorization().await?;
//!     client.set_sync_enabled(true).await?;
//!
//!     // App 进入前台时触发生命周期事件（前台对账由 Hook 自动跑）
//!     client.on_app_foreground().await?;
//!
//!     // 关闭 SDK
//!     client.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod version;
pub mod events;
pub mod lifecycle;
pub mod sample;
pub mod sdk;
pub mod source;
pub mod storage;
pub mod sync;
pub mod uploader;

// 重新导出核心类型，方便使用
pub use error::{HealthSyncError, Result};
pub use events::{EventManager, EventStats, SdkEvent, SyncPhase};
pub use lifecycle::{LifecycleHook, LifecycleManager, SyncLifecycleHook};
pub use sample::{sources, AnchorToken, BatchKind, FetchDelta, HealthSample};
pub use sdk::{
    CoordinatorConfig, HealthSyncClient, HealthSyncConfig, HealthSyncConfigBuilder, SyncStatus,
    UploaderConfig,
};
pub use source::HealthDataSource;
pub use storage::{
    KvStats, KvStore, QueueStatistics, QueuedUpload, RetryPolicy, StorageReport, UploadPriority,
    UploadQueue, UploadStatus,
};
pub use sync::{
    AnchorStore, ExecutionCoordinator, HealthSnapshot, HealthTier, LiveChangeOutcome,
    NoopScheduler, SlotKind, SlotScheduler, SurfaceReport, SyncAnalytics, SyncEvent, SyncSurface,
};
pub use uploader::{BatchTransport, Uploader};
