//! 事件系统模块 - 同步生命周期的对外通知
//!
//! 功能包括：
//! - 同步轮次的开始/完成/失败事件
//! - 批次上传与入队事件
//! - 执行窗口到期事件
//! - 同步阶段变更事件
//! - 事件广播和订阅机制
//!
//! 宿主应用订阅这些事件驱动 UI（同步指示器、失败提示），
//! SDK 内部不依赖事件做任何控制流。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::sample::BatchKind;
use crate::storage::UploadPriority;
use crate::sync::SyncSurface;

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// 空闲，等待下一个执行面
    Idle,
    /// 某个执行面正在清空队列
    Running,
    /// 最近一轮失败，等待退避窗口
    BackingOff,
    /// 不可恢复错误（如存储损坏），需要宿主介入
    Error,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Running => "running",
            SyncPhase::BackingOff => "backing_off",
            SyncPhase::Error => "error",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SdkEvent {
    /// 某个执行面开始清空队列
    SyncStarted {
        surface: SyncSurface,
        timestamp: i64,
    },
    /// 某个执行面正常结束
    SyncCompleted {
        surface: SyncSurface,
        uploaded_batches: usize,
        uploaded_samples: usize,
        duration_ms: u64,
        timestamp: i64,
    },
    /// 某个执行面整体失败（队列不可用等，不含单批失败）
    SyncFailed {
        surface: SyncSurface,
        error: String,
        timestamp: i64,
    },
    /// 单个批次上传成功
    BatchUploaded {
        source_type: String,
        sample_count: usize,
        kind: BatchKind,
        timestamp: i64,
    },
    /// 单个批次未能即时送达，已持久入队
    BatchQueued {
        source_type: String,
        sample_count: usize,
        priority: UploadPriority,
        timestamp: i64,
    },
    /// 执行窗口到期，剩余批次让路
    SlotExpired {
        surface: SyncSurface,
        released: usize,
        timestamp: i64,
    },
    /// 同步阶段变更
    PhaseChanged {
        old_phase: SyncPhase,
        new_phase: SyncPhase,
        timestamp: i64,
    },
    /// 后台同步开关变更
    ActivationChanged { enabled: bool, timestamp: i64 },
    /// 全量重同步已触发（锚点清零）
    FullResyncRequested { cleared_anchors: usize, timestamp: i64 },
}

impl SdkEvent {
    /// 事件类型名（统计用）
    pub fn event_type(&self) -> &'static str {
        match self {
            SdkEvent::SyncStarted { .. } => "sync_started",
            SdkEvent::SyncCompleted { .. } => "sync_completed",
            SdkEvent::SyncFailed { .. } => "sync_failed",
            SdkEvent::BatchUploaded { .. } => "batch_uploaded",
            SdkEvent::BatchQueued { .. } => "batch_queued",
            SdkEvent::SlotExpired { .. } => "slot_expired",
            SdkEvent::PhaseChanged { .. } => "phase_changed",
            SdkEvent::ActivationChanged { .. } => "activation_changed",
            SdkEvent::FullResyncRequested { .. } => "full_resync_requested",
        }
    }

    /// 事件时间戳（unix 秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SdkEvent::SyncStarted { timestamp, .. }
            | SdkEvent::SyncCompleted { timestamp, .. }
            | SdkEvent::SyncFailed { timestamp, .. }
            | SdkEvent::BatchUploaded { timestamp, .. }
            | SdkEvent::BatchQueued { timestamp, .. }
            | SdkEvent::SlotExpired { timestamp, .. }
            | SdkEvent::PhaseChanged { timestamp, .. }
            | SdkEvent::ActivationChanged { timestamp, .. }
            | SdkEvent::FullResyncRequested { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件构造辅助函数
pub mod event_builders {
    use super::*;

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    pub fn sync_started(surface: SyncSurface) -> SdkEvent {
        SdkEvent::SyncStarted {
            surface,
            timestamp: now(),
        }
    }

    pub fn sync_completed(
        surface: SyncSurface,
        uploaded_batches: usize,
        uploaded_samples: usize,
        duration_ms: u64,
    ) -> SdkEvent {
        SdkEvent::SyncCompleted {
            surface,
            uploaded_batches,
            uploaded_samples,
            duration_ms,
            timestamp: now(),
        }
    }

    pub fn sync_failed(surface: SyncSurface, error: &str) -> SdkEvent {
        SdkEvent::SyncFailed {
            surface,
            error: error.to_string(),
            timestamp: now(),
        }
    }

    pub fn batch_uploaded(source_type: &str, sample_count: usize, kind: BatchKind) -> SdkEvent {
        SdkEvent::BatchUploaded {
            source_type: source_type.to_string(),
            sample_count,
            kind,
            timestamp: now(),
        }
    }

    pub fn batch_queued(
        source_type: &str,
        sample_count: usize,
        priority: UploadPriority,
    ) -> SdkEvent {
        SdkEvent::BatchQueued {
            source_type: source_type.to_string(),
            sample_count,
            priority,
            timestamp: now(),
        }
    }

    pub fn slot_expired(surface: SyncSurface, released: usize) -> SdkEvent {
        SdkEvent::SlotExpired {
            surface,
            released,
            timestamp: now(),
        }
    }

    pub fn phase_changed(old_phase: SyncPhase, new_phase: SyncPhase) -> SdkEvent {
        SdkEvent::PhaseChanged {
            old_phase,
            new_phase,
            timestamp: now(),
        }
    }

    pub fn activation_changed(enabled: bool) -> SdkEvent {
        SdkEvent::ActivationChanged {
            enabled,
            timestamp: now(),
        }
    }

    pub fn full_resync_requested(cleared_anchors: usize) -> SdkEvent {
        SdkEvent::FullResyncRequested {
            cleared_anchors,
            timestamp: now(),
        }
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
#[derive(Debug)]
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SdkEvent>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self {
            sender,
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SdkEvent) {
        debug!("发布事件: {}", event.event_type());

        // 更新统计
        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 广播事件（无订阅者时 send 会失败，属正常场景如无 UI 宿主，仅打 debug）
        if let Err(e) = self.sender.send(event) {
            debug!("事件无人订阅，已丢弃: {}", e);
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.sender.subscribe()
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();

        manager
            .emit(event_builders::sync_started(SyncSurface::Foreground))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "sync_started");
        assert!(event.timestamp() > 0);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let manager = EventManager::new(16);
        // 没有订阅者也不应报错
        manager
            .emit(event_builders::activation_changed(true))
            .await;

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("activation_changed"), Some(&1));
    }

    #[tokio::test]
    async fn test_stats_count_by_type() {
        let manager = EventManager::new(16);
        let _rx = manager.subscribe();

        manager
            .emit(event_builders::batch_uploaded("heartRate", 10, BatchKind::Realtime))
            .await;
        manager
            .emit(event_builders::batch_uploaded("steps", 5, BatchKind::Foreground))
            .await;
        manager
            .emit(event_builders::sync_failed(SyncSurface::ShortSlot, "db closed"))
            .await;

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_by_type.get("batch_uploaded"), Some(&2));
        assert_eq!(stats.events_by_type.get("sync_failed"), Some(&1));
        assert_eq!(manager.subscriber_count(), 1);
    }

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(SyncPhase::Idle.as_str(), "idle");
        assert_eq!(SyncPhase::BackingOff.as_str(), "backing_off");
        let v = serde_json::to_value(SyncPhase::BackingOff).unwrap();
        assert_eq!(v, serde_json::json!("backing_off"));
    }
}
