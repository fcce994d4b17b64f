//! 同步模块 - 锚点、健康度与执行协调
//!
//! 三个子模块围绕同一条管道分工：
//! - anchor_store：各数据源增量游标的持久化
//! - analytics：同步健康度的内存统计
//! - coordinator：多执行面对单一持久队列的仲裁

use serde::{Deserialize, Serialize};

pub mod analytics;
pub mod anchor_store;
pub mod coordinator;

pub use analytics::{HealthSnapshot, HealthTier, SyncAnalytics, SyncEvent};
pub use anchor_store::{AnchorRecord, AnchorStore};
pub use coordinator::{
    ExecutionCoordinator, LiveChangeOutcome, NoopScheduler, SlotKind, SlotScheduler, SurfaceReport,
};

/// 执行面：会主动清空队列的四个触发入口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSurface {
    /// 宿主健康库的实时变更回调
    LiveChange,
    /// 应用回到前台时的对账
    Foreground,
    /// OS 授予的短执行窗口
    ShortSlot,
    /// OS 授予的长执行窗口
    LongSlot,
}

impl SyncSurface {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSurface::LiveChange => "live_change",
            SyncSurface::Foreground => "foreground",
            SyncSurface::ShortSlot => "short_slot",
            SyncSurface::LongSlot => "long_slot",
        }
    }

    /// 中文描述（日志展示用）
    pub fn display_name(&self) -> &'static str {
        match self {
            SyncSurface::LiveChange => "实时变更",
            SyncSurface::Foreground => "前台对账",
            SyncSurface::ShortSlot => "短执行窗口",
            SyncSurface::LongSlot => "长执行窗口",
        }
    }
}

impl std::fmt::Display for SyncSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
