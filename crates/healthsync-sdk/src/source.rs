//! 宿主健康库接入层 - 核心管道唯一依赖的窄读取面
//!
//! SDK 不直接触碰宿主平台的健康存储，只通过本 trait 消费三件事：
//! 授权、锚点增量查询、实时变更通知。宿主侧适配器（iOS/Android/测试桩）
//! 各自实现本 trait 后注入 SDK。

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::sample::{AnchorToken, FetchDelta};

/// 宿主健康数据源
///
/// `incremental_fetch` 的锚点语义：`None` 表示从未观察过该数据源，
/// 实现应返回全量历史（或实现自行约束的近期窗口）；`Some` 则只返回
/// 该锚点之后的增量。返回的新锚点由调用方在样本妥善落地后持久化。
#[async_trait]
pub trait HealthDataSource: Send + Sync {
    /// 向宿主申请对给定数据源类型的读取授权
    async fn authorize(&self, source_types: &[String]) -> Result<()>;

    /// 锚点增量查询：返回 (新增样本, 删除的样本 UUID, 新锚点)
    async fn incremental_fetch(
        &self,
        source_type: &str,
        anchor: Option<AnchorToken>,
    ) -> Result<FetchDelta>;

    /// 实时变更通知流：宿主侧在对应数据源有新样本时广播其 source_type。
    ///
    /// 订阅在 SDK 构造时无条件建立（两阶段激活：处理器常驻，
    /// 未激活时收到通知直接空转）。
    fn live_changes(&self) -> broadcast::Receiver<String>;
}
