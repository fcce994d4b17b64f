//! 同步模块生命周期 Hook
//!
//! 在 App 前后台切换时，自动触发前台对账与本地状态落盘。

use crate::error::Result;
use crate::lifecycle::LifecycleHook;
use crate::storage::KvStore;
use crate::sync::ExecutionCoordinator;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// 同步模块生命周期 Hook
///
/// 前台切换触发一轮前台对账（排空 + 补查），后台切换把 KV 状态刷盘。
pub struct SyncLifecycleHook {
    coordinator: Arc<ExecutionCoordinator>,
    kv: Arc<KvStore>,
}

impl SyncLifecycleHook {
    /// 创建新的同步生命周期 Hook
    pub fn new(coordinator: Arc<ExecutionCoordinator>, kv: Arc<KvStore>) -> Self {
        Self { coordinator, kv }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    /// App 切换到后台时调用
    ///
    /// 把锚点与同步状态刷到磁盘，后台被杀时不丢最近的推进。
    async fn on_background(&self) -> Result<()> {
        info!("[Sync Hook] App 切换到后台，刷盘本地同步状态");

        match self.kv.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("[Sync Hook] ⚠️ KV 刷盘失败: {}", e);
                // 即使失败也返回 Ok，sled 的后台刷盘仍会兜底
                Ok(())
            }
        }
    }

    /// App 切换到前台时调用
    ///
    /// 在独立任务中跑一轮前台对账，不阻塞宿主的前台切换回调。
    async fn on_foreground(&self) -> Result<()> {
        if !self.coordinator.is_active() {
            info!("[Sync Hook] 同步未激活，跳过前台对账");
            return Ok(());
        }

        info!("[Sync Hook] App 切换到前台，触发前台对账");
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            match coordinator.run_foreground().await {
                Ok(report) if report.skipped => {
                    info!("[Sync Hook] 前台对账已在进行，本次跳过");
                }
                Ok(report) => {
                    info!(
                        "[Sync Hook] ✅ 前台对账完成: uploaded={}, failed={}, {}ms",
                        report.uploaded_items, report.failed_items, report.duration_ms
                    );
                }
                Err(e) => {
                    // 对账失败不是致命错误，队列里的批次下个窗口继续
                    warn!("[Sync Hook] ⚠️ 前台对账失败: {}", e);
                }
            }
        });

        Ok(())
    }
}
