//! HealthSync SDK 主入口 - 配置与统一门面
//!
//! 本模块提供：
//! - HealthSyncConfig：SDK 配置与构建器
//! - HealthSyncClient：面向宿主 App 的统一接口
//!
//! 宿主平台只需要做三件事：实现 HealthDataSource 把健康库接进来、
//! 把系统执行窗口回调桥接到 run_slot、在前后台切换时调用
//! on_app_foreground / on_app_background。其余由 SDK 内部调度。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HealthSyncError, Result};
use crate::events::{EventManager, EventStats, SdkEvent, SyncPhase};
use crate::lifecycle::{LifecycleManager, SyncLifecycleHook};
use crate::source::HealthDataSource;
use crate::storage::kv::keys;
use crate::storage::{KvStore, RetryPolicy, StorageReport, UploadQueue};
use crate::sync::{
    AnchorStore, ExecutionCoordinator, HealthSnapshot, NoopScheduler, SlotKind, SlotScheduler,
    SurfaceReport, SyncAnalytics,
};
use crate::uploader::Uploader;

/// 上传器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// 服务端基础地址，例如 https://api.example.com/app
    pub api_url: String,
    /// TCP 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 单次 upload_batch 内最多尝试次数
    pub max_attempts: u32,
    /// series_data 超过该字节数时走预签名旁路直传
    pub series_offload_threshold_bytes: usize,
    /// 随主包络与预签名申请一起发送的鉴权头
    pub auth_headers: HashMap<String, String>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            connect_timeout_secs: 10,
            max_attempts: 3,
            series_offload_threshold_bytes: 4 * 1024 * 1024, // 心电等高频序列的旁路阈值
            auth_headers: HashMap::new(),
        }
    }
}

/// 执行协调器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// 实时变更即时上传的单次尝试超时（秒）
    pub live_attempt_timeout_secs: u64,
    /// 队列积压超过该值时跳过前台补查（先还旧账）
    pub backpressure_backlog_limit: u64,
    /// 已上传行的保留天数，前台对账时清理更早的行
    pub reap_retention_days: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            live_attempt_timeout_secs: 60,
            backpressure_backlog_limit: 500,
            reap_retention_days: 7,
        }
    }
}

/// HealthSync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 需要监控与前台补查的数据源类型
    pub monitored_sources: Vec<String>,
    /// 上传器配置
    pub uploader: UploaderConfig,
    /// 执行协调器配置
    pub coordinator: CoordinatorConfig,
    /// 队列重试策略
    pub retry: RetryPolicy,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for HealthSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            monitored_sources: crate::sample::sources::defaults(),
            uploader: UploaderConfig::default(),
            coordinator: CoordinatorConfig::default(),
            retry: RetryPolicy::default(),
            event_buffer_size: 256,
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.healthsync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".healthsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".healthsync")
    } else {
        // 如果无法获取用户主目录，则回退到当前目录
        PathBuf::from("./healthsync_data")
    }
}

/// HealthSync SDK 配置构建器
pub struct HealthSyncConfigBuilder {
    config: HealthSyncConfig,
}

impl HealthSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HealthSyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.uploader.api_url = url.into();
        self
    }

    /// 追加一个鉴权头（如 Authorization）
    pub fn auth_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.config.uploader.auth_headers.insert(name.into(), value.into());
        self
    }

    /// 覆盖监控的数据源集合
    pub fn monitored_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.monitored_sources = sources.into_iter().map(|s| s.into()).collect();
        self
    }

    /// 追加一个监控的数据源
    pub fn add_monitored_source<S: Into<String>>(mut self, source: S) -> Self {
        self.config.monitored_sources.push(source.into());
        self
    }

    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.config.uploader.connect_timeout_secs = secs;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.uploader.max_attempts = attempts;
        self
    }

    pub fn series_offload_threshold(mut self, bytes: usize) -> Self {
        self.config.uploader.series_offload_threshold_bytes = bytes;
        self
    }

    pub fn live_attempt_timeout(mut self, secs: u64) -> Self {
        self.config.coordinator.live_attempt_timeout_secs = secs;
        self
    }

    pub fn backpressure_backlog_limit(mut self, limit: u64) -> Self {
        self.config.coordinator.backpressure_backlog_limit = limit;
        self
    }

    pub fn reap_retention_days(mut self, days: u64) -> Self {
        self.config.coordinator.reap_retention_days = days;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> HealthSyncConfig {
        self.config
    }
}

impl Default for HealthSyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthSyncConfig {
    pub fn builder() -> HealthSyncConfigBuilder {
        HealthSyncConfigBuilder::new()
    }
}

/// 同步状态快照（诊断接口）
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    /// 后台同步是否已激活
    pub enabled: bool,
    /// 当前阶段
    pub phase: SyncPhase,
    /// 最近一次成功送达的时间（Unix 秒）
    pub last_sync_at: Option<i64>,
    /// 队列中尚未完成的批次数（pending + uploading + failed）
    pub queued_batches: u64,
    /// 最近一次失败的描述
    pub last_error: Option<String>,
}

/// 统一 SDK 主接口
///
/// 采用分层架构：
/// - 门面层：HealthSyncClient（当前类）
/// - 执行层：ExecutionCoordinator（独占持有上传队列）
/// - 传输层：Uploader
/// - 存储层：UploadQueue / KvStore / AnchorStore
/// - 事件层：EventManager
pub struct HealthSyncClient {
    /// SDK 配置
    config: HealthSyncConfig,

    /// 当前用户
    user_id: String,

    /// KV 存储（锚点与同步状态）
    kv: Arc<KvStore>,

    /// 执行协调器
    coordinator: Arc<ExecutionCoordinator>,

    /// 上传器（具体类型，供运行时重配置使用）
    uploader: Arc<Uploader>,

    /// 宿主健康数据源
    source: Arc<dyn HealthDataSource>,

    /// 同步质量分析
    analytics: Arc<SyncAnalytics>,

    /// 事件管理器
    event_manager: Arc<EventManager>,

    /// 生命周期管理器
    lifecycle_manager: Arc<tokio::sync::RwLock<LifecycleManager>>,

    /// 实时变更监听任务的停止令牌
    live_loop: CancellationToken,
}

impl HealthSyncClient {
    /// 异步初始化 SDK（推荐方式）
    ///
    /// 不具备系统任务排期能力的环境用此入口，执行窗口续租为空操作。
    pub async fn initialize(
        user_id: impl Into<String>,
        source: Arc<dyn HealthDataSource>,
        config: HealthSyncConfig,
    ) -> Result<Arc<Self>> {
        Self::initialize_with_scheduler(user_id, source, Arc::new(NoopScheduler), config).await
    }

    /// 带执行窗口排期器的初始化
    ///
    /// 分层初始化顺序：
    /// 1. 存储层 → 2. 传输层 → 3. 事件层 → 4. 执行层
    ///
    /// 初始化即注册全部执行面处理器（激活协议的第一阶段），
    /// 真正开始干活要等 set_sync_enabled(true) 翻转激活位。
    pub async fn initialize_with_scheduler(
        user_id: impl Into<String>,
        source: Arc<dyn HealthDataSource>,
        scheduler: Arc<dyn SlotScheduler>,
        config: HealthSyncConfig,
    ) -> Result<Arc<Self>> {
        let user_id = user_id.into();
        info!(
            "正在初始化 HealthSyncClient v{}: user={}",
            crate::version::SDK_VERSION,
            user_id
        );

        // 验证配置
        Self::validate_config(&user_id, &config)?;

        // === 第1层：KV 存储与锚点 ===
        let kv = Arc::new(KvStore::new(&config.data_dir).await?);
        kv.switch_user(&user_id).await?;
        let anchors = AnchorStore::open(&kv).await?;

        // === 第2层：持久化上传队列（每用户独立文件，协调器独占持有）===
        let queue_path = config
            .data_dir
            .join("users")
            .join(&user_id)
            .join("upload_queue.db");
        let queue = UploadQueue::open(&queue_path, config.retry.clone())?;

        // === 第3层：上传器 ===
        let uploader = Arc::new(Uploader::new(&config.uploader)?);

        // === 第4层：事件管理器 ===
        let event_manager = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第5层：同步质量分析 ===
        let analytics = Arc::new(SyncAnalytics::new());

        // === 第6层：执行协调器 ===
        let coordinator = Arc::new(ExecutionCoordinator::new(
            user_id.clone(),
            queue,
            anchors,
            source.clone(),
            uploader.clone(),
            scheduler,
            analytics.clone(),
            event_manager.clone(),
            kv.clone(),
            config.monitored_sources.clone(),
            config.coordinator.clone(),
        ));

        // === 第7层：生命周期管理器 ===
        let lifecycle_manager = Arc::new(tokio::sync::RwLock::new(LifecycleManager::new()));

        let client = Arc::new(Self {
            config,
            user_id,
            kv,
            coordinator,
            uploader,
            source,
            analytics,
            event_manager,
            lifecycle_manager,
            live_loop: CancellationToken::new(),
        });

        // === 自动注册同步生命周期 Hook ===
        // 在 SDK 初始化时自动注册，无需用户手动注册
        {
            let sync_hook = Arc::new(SyncLifecycleHook::new(
                client.coordinator.clone(),
                client.kv.clone(),
            ));
            let mut manager = client.lifecycle_manager.write().await;
            manager.register_hook(sync_hook);
            drop(manager);
            info!("✅ 同步生命周期 Hook 已自动注册");
        }

        // === 恢复激活状态 ===
        // 激活开关跨进程持久：上次启用过后台同步的用户重启后无需重新设置
        match client.kv.get::<_, bool>(keys::SYNC_ENABLED).await {
            Ok(Some(true)) => {
                client.coordinator.activate().await;
                info!("♻️ 已恢复上次的同步激活状态");
            }
            Ok(_) => {}
            Err(e) => warn!("⚠️ 读取同步激活状态失败: {}", e),
        }

        // === 启动实时变更监听 ===
        client.clone().spawn_live_change_listener();

        info!("✅ HealthSyncClient 初始化完成");
        Ok(client)
    }

    /// 验证配置有效性
    fn validate_config(user_id: &str, config: &HealthSyncConfig) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(HealthSyncError::Config("user_id 不能为空".to_string()));
        }
        if config.uploader.api_url.trim().is_empty() {
            return Err(HealthSyncError::Config("api_url 不能为空".to_string()));
        }
        if config.uploader.max_attempts == 0 {
            return Err(HealthSyncError::Config("max_attempts 必须大于 0".to_string()));
        }
        if config.event_buffer_size == 0 {
            return Err(HealthSyncError::Config(
                "event_buffer_size 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 启动实时变更监听任务
    ///
    /// 宿主健康库的变更通知经 broadcast 送达，逐条交给协调器。
    /// 通知积压被丢弃时只记日志：实时面丢通知不丢数据，
    /// 锚点没推进的窗口由前台对账补齐。
    fn spawn_live_change_listener(self: Arc<Self>) {
        let mut rx = self.source.live_changes();
        let token = self.live_loop.clone();
        let coordinator = self.coordinator.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.recv() => match changed {
                        Ok(source_type) => {
                            if let Err(e) = coordinator.handle_live_change(&source_type).await {
                                warn!("⚠️ 实时变更处理失败: {} - {}", source_type, e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("⚠️ 实时变更通知积压，丢弃 {} 条（前台对账补齐）", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("实时变更通道已关闭");
                            break;
                        }
                    }
                }
            }
            debug!("实时变更监听任务退出");
        });
    }

    // ========== 授权与激活 ==========

    /// 请求宿主健康库的读取授权
    pub async fn request_authorization(&self) -> Result<()> {
        info!("📋 请求健康数据读取授权: {:?}", self.config.monitored_sources);
        self.source.authorize(&self.config.monitored_sources).await
    }

    /// 打开/关闭后台同步（跨进程持久）
    ///
    /// 激活协议的第二阶段：处理器在初始化时已全部注册，本开关只翻转
    /// 激活位。关闭时进行中的一轮会自然跑完，不做强制打断。
    pub async fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.kv.set(keys::SYNC_ENABLED, &enabled).await?;
        if enabled {
            self.coordinator.activate().await;
        } else {
            self.coordinator.deactivate().await;
        }
        Ok(())
    }

    /// 后台同步是否已激活
    pub fn is_sync_enabled(&self) -> bool {
        self.coordinator.is_active()
    }

    // ========== 执行面入口 ==========

    /// 手动触发一轮前台对账
    ///
    /// 宿主在用户下拉刷新或进入关键页面时调用；App 前后台切换场景
    /// 走 on_app_foreground 即可，对账由生命周期 Hook 自动触发。
    pub async fn sync_now(&self) -> Result<SurfaceReport> {
        self.coordinator.run_foreground().await
    }

    /// 在 OS 执行窗口内跑一轮排空（宿主把系统任务回调桥接到这里）
    ///
    /// `expiration` 在窗口被系统收回时取消：在途批次按一次失败记，
    /// 未动的批次让路回队列。
    pub async fn run_slot(
        &self,
        kind: SlotKind,
        expiration: CancellationToken,
    ) -> Result<SurfaceReport> {
        self.coordinator.run_background_slot(kind, expiration).await
    }

    /// 全量重同步：清除全部锚点，各源下一轮按全量窗口回读
    pub async fn full_resync(&self) -> Result<usize> {
        self.coordinator.full_resync().await
    }

    // ========== 运行时重配置 ==========

    /// 切换服务端地址与鉴权头
    ///
    /// 只有这里会改写上传目标，执行面从不隐式改配置。
    pub async fn reconfigure(
        &self,
        api_url: Option<&str>,
        auth_headers: Option<HashMap<String, String>>,
    ) -> Result<()> {
        if let Some(url) = api_url {
            if url.trim().is_empty() {
                return Err(HealthSyncError::Config("api_url 不能为空".to_string()));
            }
            self.uploader.set_api_url(url);
        }
        if let Some(headers) = auth_headers {
            self.uploader.set_auth_headers(headers);
        }
        Ok(())
    }

    /// 当前生效的服务端地址
    pub fn api_url(&self) -> String {
        self.uploader.api_url()
    }

    // ========== 诊断与观测 ==========

    /// 同步状态快照
    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let last_sync_at = self.kv.get(keys::LAST_SYNC_AT).await.unwrap_or_else(|e| {
            warn!("⚠️ 读取最近同步时间失败: {}", e);
            None
        });
        let queued_batches = self.coordinator.queue().statistics().await?.backlog();

        Ok(SyncStatus {
            enabled: self.coordinator.is_active(),
            phase: self.coordinator.phase(),
            last_sync_at,
            queued_batches,
            last_error: self.coordinator.last_error(),
        })
    }

    /// 同步质量快照（成功率、时延、连败、分层）
    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.analytics.snapshot()
    }

    /// 基于当前质量与队列积压给出的调优建议
    pub async fn recommendations(&self) -> Result<Vec<String>> {
        let backlog = self.coordinator.queue().statistics().await?.backlog();
        Ok(self.analytics.recommendations(backlog))
    }

    /// 本地存储健康报告
    pub async fn storage_report(&self) -> Result<StorageReport> {
        StorageReport::collect(self.coordinator.queue(), &self.kv).await
    }

    /// 订阅 SDK 事件流
    pub fn subscribe_events(&self) -> broadcast::Receiver<SdkEvent> {
        self.event_manager.subscribe()
    }

    /// 事件统计
    pub async fn event_stats(&self) -> EventStats {
        self.event_manager.get_stats().await
    }

    /// 当前用户
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// 当前配置
    pub fn config(&self) -> &HealthSyncConfig {
        &self.config
    }

    // ========== 生命周期 ==========

    /// App 切换到后台（宿主在系统回调中调用）
    pub async fn on_app_background(&self) -> Result<()> {
        info!("🔄 App 切换到后台，触发生命周期事件");
        let manager = self.lifecycle_manager.read().await;
        manager.notify_background().await?;
        Ok(())
    }

    /// App 切换到前台（宿主在系统回调中调用）
    pub async fn on_app_foreground(&self) -> Result<()> {
        info!("🔄 App 切换到前台，触发生命周期事件");
        let manager = self.lifecycle_manager.read().await;
        manager.notify_foreground().await?;
        Ok(())
    }

    /// 注册额外的生命周期回调 Hook
    pub async fn register_lifecycle_hook(&self, hook: Arc<dyn crate::lifecycle::LifecycleHook>) {
        let mut manager = self.lifecycle_manager.write().await;
        manager.register_hook(hook);
    }

    /// 异步关闭 SDK
    ///
    /// 停止实时监听、刷盘 KV、停掉队列 Actor。进行中的执行面不被
    /// 强制打断，在途批次的终态由队列落盘保证，崩溃恢复同样适用。
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 HealthSyncClient...");

        self.live_loop.cancel();
        if let Err(e) = self.kv.flush().await {
            warn!("⚠️ 关闭时 KV 刷盘失败: {}", e);
        }
        self.coordinator.queue().shutdown();

        info!("✅ HealthSyncClient 关闭完成");
        Ok(())
    }
}

impl std::fmt::Debug for HealthSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthSyncClient")
            .field("user_id", &self.user_id)
            .field("enabled", &self.is_sync_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{sources, AnchorToken, FetchDelta};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    /// 空闲数据源：无样本、无删除、锚点原样回传
    struct IdleSource {
        live_tx: broadcast::Sender<String>,
    }

    impl IdleSource {
        fn new() -> Arc<Self> {
            let (live_tx, _) = broadcast::channel(8);
            Arc::new(Self { live_tx })
        }
    }

    #[async_trait]
    impl HealthDataSource for IdleSource {
        async fn authorize(&self, _source_types: &[String]) -> Result<()> {
            Ok(())
        }

        async fn incremental_fetch(
            &self,
            _source_type: &str,
            anchor: Option<AnchorToken>,
        ) -> Result<FetchDelta> {
            Ok(FetchDelta {
                added: vec![],
                deleted_ids: vec![],
                new_anchor: anchor.unwrap_or_default(),
            })
        }

        fn live_changes(&self) -> broadcast::Receiver<String> {
            self.live_tx.subscribe()
        }
    }

    fn test_config(dir: &TempDir) -> HealthSyncConfig {
        HealthSyncConfig::builder()
            .data_dir(dir.path())
            .api_url("http://localhost:9090")
            .build()
    }

    #[test]
    fn test_config_builder_composes() {
        let config = HealthSyncConfig::builder()
            .api_url("https://api.example.com/app/")
            .auth_header("Authorization", "Bearer token-1")
            .monitored_sources([sources::STEPS, sources::HEART_RATE])
            .add_monitored_source(sources::SLEEP_ANALYSIS)
            .max_attempts(5)
            .live_attempt_timeout(30)
            .backpressure_backlog_limit(100)
            .event_buffer_size(64)
            .build();

        assert_eq!(config.uploader.api_url, "https://api.example.com/app/");
        assert_eq!(
            config.uploader.auth_headers.get("Authorization"),
            Some(&"Bearer token-1".to_string())
        );
        assert_eq!(
            config.monitored_sources,
            vec!["steps", "heartRate", "sleepAnalysis"]
        );
        assert_eq!(config.uploader.max_attempts, 5);
        assert_eq!(config.coordinator.live_attempt_timeout_secs, 30);
        assert_eq!(config.coordinator.backpressure_backlog_limit, 100);
        assert_eq!(config.event_buffer_size, 64);
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_config() {
        let dir = TempDir::new().unwrap();

        // 空 user_id
        let result =
            HealthSyncClient::initialize("", IdleSource::new(), test_config(&dir)).await;
        assert!(matches!(result, Err(HealthSyncError::Config(_))));

        // 空 api_url
        let config = HealthSyncConfig::builder()
            .data_dir(dir.path())
            .api_url("")
            .build();
        let result = HealthSyncClient::initialize("u1", IdleSource::new(), config).await;
        assert!(matches!(result, Err(HealthSyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_fresh_client_status_defaults() {
        let dir = TempDir::new().unwrap();
        let client = HealthSyncClient::initialize("u1", IdleSource::new(), test_config(&dir))
            .await
            .unwrap();

        assert!(!client.is_sync_enabled());
        let status = client.sync_status().await.unwrap();
        assert!(!status.enabled);
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.queued_batches, 0);
        assert!(status.last_sync_at.is_none());
        assert!(status.last_error.is_none());

        // 没有任何事件时，质量快照给出健康的默认值
        let snapshot = client.health_snapshot();
        assert_eq!(snapshot.success_rate, 1.0);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(client.recommendations().await.unwrap().is_empty());

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enabled_state_survives_restart() {
        let dir = TempDir::new().unwrap();

        {
            let client =
                HealthSyncClient::initialize("u1", IdleSource::new(), test_config(&dir))
                    .await
                    .unwrap();
            client.set_sync_enabled(true).await.unwrap();
            assert!(client.is_sync_enabled());
            client.shutdown().await.unwrap();
        }
        // 等监听任务退出、DB Actor 释放文件锁
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reopened = HealthSyncClient::initialize("u1", IdleSource::new(), test_config(&dir))
            .await
            .unwrap();
        assert!(reopened.is_sync_enabled());

        reopened.set_sync_enabled(false).await.unwrap();
        assert!(!reopened.is_sync_enabled());
        reopened.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_switches_endpoint() {
        let dir = TempDir::new().unwrap();
        let client = HealthSyncClient::initialize("u1", IdleSource::new(), test_config(&dir))
            .await
            .unwrap();

        assert_eq!(client.api_url(), "http://localhost:9090");

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer rotated".to_string());
        client
            .reconfigure(Some("https://eu.example.com/app/"), Some(headers))
            .await
            .unwrap();
        assert_eq!(client.api_url(), "https://eu.example.com/app");

        // 空地址被拒绝，原配置保持不变
        let result = client.reconfigure(Some("  "), None).await;
        assert!(matches!(result, Err(HealthSyncError::Config(_))));
        assert_eq!(client.api_url(), "https://eu.example.com/app");

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_report_collects_both_sides() {
        let dir = TempDir::new().unwrap();
        let client = HealthSyncClient::initialize("u1", IdleSource::new(), test_config(&dir))
            .await
            .unwrap();

        let report = client.storage_report().await.unwrap();
        assert_eq!(report.queue.total(), 0);
        // total_keys 聚合主 Tree + 锚点 Tree，至少不小于主 Tree
        assert!(report.kv.total_keys >= report.kv.key_count);

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_notifications_reach_hooks() {
        let dir = TempDir::new().unwrap();
        let client = HealthSyncClient::initialize("u1", IdleSource::new(), test_config(&dir))
            .await
            .unwrap();

        // 初始化时同步 Hook 已自动注册，两个方向的通知都应成功
        client.on_app_background().await.unwrap();
        client.on_app_foreground().await.unwrap();

        client.shutdown().await.unwrap();
    }
}
