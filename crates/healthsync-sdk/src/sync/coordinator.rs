//! 执行协调器 - 多执行面对单一持久队列的仲裁
//!
//! 四个执行面（实时变更、前台对账、短/长执行窗口）都围绕同一条
//! 持久队列工作，本模块负责：
//! - 两阶段激活：处理器在进程启动时无条件注册，真正干活前先查激活位
//! - 每个执行面同一时刻至多一轮排空
//! - 执行窗口到期的协作式取消：在途批次按一次失败记，未动的批次让路
//! - 锚点推进时序：样本妥善送达或持久入队之后才推进
//!
//! 队列实例由构造方注入并被本协调器独占，所有执行面共享这一个实例，
//! 单写者串行化由队列自身保证。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::events::{event_builders, EventManager, SyncPhase};
use crate::sample::{BatchKind, HealthSample};
use crate::sdk::CoordinatorConfig;
use crate::source::HealthDataSource;
use crate::storage::kv::keys;
use crate::storage::queue::{QueuedUpload, UploadFailureReason};
use crate::storage::{KvStore, UploadPriority, UploadQueue};
use crate::sync::{AnchorStore, SyncAnalytics, SyncSurface};
use crate::uploader::BatchTransport;

/// OS 执行窗口的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// 短窗口：机会性的小批量清理
    Short,
    /// 长窗口：系统挑选的充电/空闲时段，可以干重活
    Long,
}

impl SlotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKind::Short => "short",
            SlotKind::Long => "long",
        }
    }

    fn surface(&self) -> SyncSurface {
        match self {
            SlotKind::Short => SyncSurface::ShortSlot,
            SlotKind::Long => SyncSurface::LongSlot,
        }
    }

    fn budget(&self) -> DrainBudget {
        match self {
            SlotKind::Short => DrainBudget {
                max_items: 20,
                attempt_timeout_secs: 10,
                group_by_source: false,
            },
            SlotKind::Long => DrainBudget {
                max_items: 100,
                attempt_timeout_secs: 30,
                group_by_source: true,
            },
        }
    }
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 一轮排空的预算
#[derive(Debug, Clone, Copy)]
struct DrainBudget {
    max_items: usize,
    attempt_timeout_secs: u64,
    /// 同源批次是否合并成一次上传
    group_by_source: bool,
}

/// 前台对账预算：最多 200 项，单次尝试 15 秒，同源合并
const FOREGROUND_BUDGET: DrainBudget = DrainBudget {
    max_items: 200,
    attempt_timeout_secs: 15,
    group_by_source: true,
};

/// 执行窗口排期抽象
///
/// 宿主平台把系统任务注册接口适配到这个 trait；不具备系统排期
/// 能力的环境用 NoopScheduler。
#[async_trait]
pub trait SlotScheduler: Send + Sync {
    /// 排期该类执行窗口的下一次唤醒
    async fn schedule_next(&self, kind: SlotKind) -> Result<()>;
}

/// 空排期器
#[derive(Debug, Default)]
pub struct NoopScheduler;

#[async_trait]
impl SlotScheduler for NoopScheduler {
    async fn schedule_next(&self, kind: SlotKind) -> Result<()> {
        debug!("排期器未接入，跳过 {} 窗口续租", kind);
        Ok(())
    }
}

/// 一轮执行面运行的结果摘要
#[derive(Debug, Clone, Serialize)]
pub struct SurfaceReport {
    pub surface: SyncSurface,
    /// 未激活或该执行面已有一轮在跑
    pub skipped: bool,
    /// 本轮从队列认领的行数
    pub claimed: usize,
    pub uploaded_items: usize,
    pub uploaded_samples: usize,
    pub failed_items: usize,
    /// 窗口到期让路、退回 pending 的行数
    pub released_items: usize,
    /// 前台补查中即时上传成功的样本数
    pub recheck_uploaded: usize,
    /// 前台补查中落入队列的样本数
    pub recheck_queued: usize,
    pub expired: bool,
    pub duration_ms: u64,
}

impl SurfaceReport {
    fn new(surface: SyncSurface) -> Self {
        Self {
            surface,
            skipped: false,
            claimed: 0,
            uploaded_items: 0,
            uploaded_samples: 0,
            failed_items: 0,
            released_items: 0,
            recheck_uploaded: 0,
            recheck_queued: 0,
            expired: false,
            duration_ms: 0,
        }
    }

    fn skipped(surface: SyncSurface) -> Self {
        Self {
            skipped: true,
            ..Self::new(surface)
        }
    }
}

/// 实时变更回调的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveChangeOutcome {
    /// 未激活，空转
    Inactive,
    /// 上一轮实时处理还没结束
    Busy,
    /// 增量为空，锚点直接推进
    Empty,
    /// 即时上传成功，锚点已推进
    Uploaded { samples: usize },
    /// 即时上传失败但已持久入队，锚点已推进
    Queued { samples: usize },
    /// 上传与入队双双失败，锚点原地不动，下一轮重新观察
    Deferred { samples: usize },
}

/// 执行协调器
pub struct ExecutionCoordinator {
    user_id: String,
    /// 两阶段激活位：处理器常驻，未激活时一律空转
    active: AtomicBool,
    queue: UploadQueue,
    anchors: AnchorStore,
    source: Arc<dyn HealthDataSource>,
    transport: Arc<dyn BatchTransport>,
    scheduler: Arc<dyn SlotScheduler>,
    analytics: Arc<SyncAnalytics>,
    events: Arc<EventManager>,
    kv: Arc<KvStore>,
    monitored_sources: Vec<String>,
    config: CoordinatorConfig,
    phase: parking_lot::RwLock<SyncPhase>,
    last_error: parking_lot::RwLock<Option<String>>,
    // 每个执行面一把闸：同一执行面最多一轮排空
    live_gate: tokio::sync::Mutex<()>,
    foreground_gate: tokio::sync::Mutex<()>,
    short_gate: tokio::sync::Mutex<()>,
    long_gate: tokio::sync::Mutex<()>,
}

impl ExecutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        queue: UploadQueue,
        anchors: AnchorStore,
        source: Arc<dyn HealthDataSource>,
        transport: Arc<dyn BatchTransport>,
        scheduler: Arc<dyn SlotScheduler>,
        analytics: Arc<SyncAnalytics>,
        events: Arc<EventManager>,
        kv: Arc<KvStore>,
        monitored_sources: Vec<String>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            user_id,
            active: AtomicBool::new(false),
            queue,
            anchors,
            source,
            transport,
            scheduler,
            analytics,
            events,
            kv,
            monitored_sources,
            config,
            phase: parking_lot::RwLock::new(SyncPhase::Idle),
            last_error: parking_lot::RwLock::new(None),
            live_gate: tokio::sync::Mutex::new(()),
            foreground_gate: tokio::sync::Mutex::new(()),
            short_gate: tokio::sync::Mutex::new(()),
            long_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// 激活后台同步（Inactive → Active）
    pub async fn activate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("🚀 后台同步已激活: user={}", self.user_id);
            self.events
                .emit(event_builders::activation_changed(true))
                .await;
        }
    }

    /// 停用后台同步（Active → Inactive），进行中的一轮会自然跑完
    pub async fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("🛑 后台同步已停用: user={}", self.user_id);
            self.events
                .emit(event_builders::activation_changed(false))
                .await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// 队列只读访问（统计与诊断用，写操作全部走协调器）
    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn anchors(&self) -> &AnchorStore {
        &self.anchors
    }

    async fn set_phase(&self, new_phase: SyncPhase) {
        let old_phase = {
            let mut guard = self.phase.write();
            let old = *guard;
            *guard = new_phase;
            old
        };
        if old_phase != new_phase {
            self.events
                .emit(event_builders::phase_changed(old_phase, new_phase))
                .await;
        }
    }

    fn note_error(&self, error: &crate::error::HealthSyncError) {
        *self.last_error.write() = Some(error.to_string());
    }

    async fn touch_last_sync(&self) {
        if let Err(e) = self.kv.set(keys::LAST_SYNC_AT, &Utc::now().timestamp()).await {
            debug!("记录最近同步时间失败: {}", e);
        }
    }

    /// 处理一条实时变更通知
    ///
    /// 小批量即时上传；失败则以普通优先级持久入队。锚点只在样本
    /// 妥善送达或确认入队后推进，入队也失败时锚点原地不动。
    pub async fn handle_live_change(&self, source_type: &str) -> Result<LiveChangeOutcome> {
        if !self.is_active() {
            debug!("⏭️ 未激活，忽略实时变更: {}", source_type);
            return Ok(LiveChangeOutcome::Inactive);
        }
        let _guard = match self.live_gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("⏭️ 上一轮实时处理未结束，跳过: {}", source_type);
                return Ok(LiveChangeOutcome::Busy);
            }
        };

        let prior_anchor = self.anchors.get(source_type)?;
        let delta = self
            .source
            .incremental_fetch(source_type, prior_anchor.clone())
            .await?;

        if !delta.deleted_ids.is_empty() {
            debug!(
                "源端删除 {} 条样本（上送管道不处理删除）: {}",
                delta.deleted_ids.len(),
                source_type
            );
        }
        if delta.added.is_empty() {
            // 没有要送达的样本，锚点可以直接推进
            self.anchors.advance(source_type, delta.new_anchor)?;
            return Ok(LiveChangeOutcome::Empty);
        }

        let samples = delta.added;
        let sample_count = samples.len();
        let timeout = Duration::from_secs(self.config.live_attempt_timeout_secs);
        let started = Instant::now();

        match self
            .transport
            .upload_batch(&self.user_id, samples.clone(), BatchKind::Realtime, timeout)
            .await
        {
            Ok(()) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.anchors.advance(source_type, delta.new_anchor)?;
                self.analytics
                    .record_success(source_type, BatchKind::Realtime, sample_count, elapsed);
                self.events
                    .emit(event_builders::batch_uploaded(
                        source_type,
                        sample_count,
                        BatchKind::Realtime,
                    ))
                    .await;
                self.touch_last_sync().await;
                Ok(LiveChangeOutcome::Uploaded {
                    samples: sample_count,
                })
            }
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as u64;
                let reason =
                    UploadFailureReason::from_error(&e, self.config.live_attempt_timeout_secs);
                self.analytics.record_failure(
                    source_type,
                    BatchKind::Realtime,
                    sample_count,
                    elapsed,
                    None,
                    reason.kind(),
                );
                self.note_error(&e);
                warn!("⚠️ 实时上传失败，转入持久队列: {} - {}", source_type, e);

                match self
                    .queue
                    .enqueue(
                        &self.user_id,
                        source_type,
                        &samples,
                        prior_anchor,
                        UploadPriority::Normal,
                    )
                    .await
                {
                    Some(_) => {
                        // 已持久入队，视为妥善落地
                        self.anchors.advance(source_type, delta.new_anchor)?;
                        self.events
                            .emit(event_builders::batch_queued(
                                source_type,
                                sample_count,
                                UploadPriority::Normal,
                            ))
                            .await;
                        Ok(LiveChangeOutcome::Queued {
                            samples: sample_count,
                        })
                    }
                    None => {
                        warn!(
                            "⚠️ 入队也失败，锚点不推进，下一轮重新观察: {}",
                            source_type
                        );
                        Ok(LiveChangeOutcome::Deferred {
                            samples: sample_count,
                        })
                    }
                }
            }
        }
    }

    /// 前台对账：排空一轮 + 逐源补查错过的窗口 + 队列保洁
    pub async fn run_foreground(&self) -> Result<SurfaceReport> {
        let surface = SyncSurface::Foreground;
        let _guard = match self.foreground_gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("⏭️ 前台对账已在进行，跳过");
                return Ok(SurfaceReport::skipped(surface));
            }
        };
        if !self.is_active() {
            debug!("⏭️ 未激活，前台对账空转");
            return Ok(SurfaceReport::skipped(surface));
        }

        let started = Instant::now();
        self.events
            .emit(event_builders::sync_started(surface))
            .await;
        self.set_phase(SyncPhase::Running).await;

        let mut report = match self.drain(surface, FOREGROUND_BUDGET, None).await {
            Ok(report) => report,
            Err(e) => {
                error!("❌ 前台排空失败: {}", e);
                self.note_error(&e);
                self.events
                    .emit(event_builders::sync_failed(surface, &e.to_string()))
                    .await;
                self.set_phase(SyncPhase::Error).await;
                return Err(e);
            }
        };

        self.recheck_missed_windows(&mut report).await;

        let retention = Duration::from_secs(self.config.reap_retention_days * 86_400);
        if let Err(e) = self.queue.reap_uploaded(retention).await {
            warn!("⚠️ 队列保洁失败: {}", e);
        }

        self.touch_last_sync().await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        let next_phase = if report.failed_items > 0 {
            SyncPhase::BackingOff
        } else {
            SyncPhase::Idle
        };
        self.set_phase(next_phase).await;
        self.events
            .emit(event_builders::sync_completed(
                surface,
                report.uploaded_items,
                report.uploaded_samples + report.recheck_uploaded,
                report.duration_ms,
            ))
            .await;
        info!(
            "✅ 前台对账完成: uploaded={}, failed={}, recheck_uploaded={}, recheck_queued={}, {}ms",
            report.uploaded_items,
            report.failed_items,
            report.recheck_uploaded,
            report.recheck_queued,
            report.duration_ms
        );
        Ok(report)
    }

    /// 在一个 OS 执行窗口内排空一轮
    ///
    /// 先续租下一次唤醒再干活（进程可能中途被终止），随后检查激活位。
    /// `expiration` 由宿主在窗口被系统收回时取消。
    pub async fn run_background_slot(
        &self,
        kind: SlotKind,
        expiration: CancellationToken,
    ) -> Result<SurfaceReport> {
        if let Err(e) = self.scheduler.schedule_next(kind).await {
            warn!("⚠️ {} 窗口续租失败: {}", kind, e);
        }

        let surface = kind.surface();
        if !self.is_active() {
            debug!("⏭️ 未激活，{} 窗口空转", kind);
            return Ok(SurfaceReport::skipped(surface));
        }
        let gate = match kind {
            SlotKind::Short => &self.short_gate,
            SlotKind::Long => &self.long_gate,
        };
        let _guard = match gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("⏭️ {} 窗口已有一轮在跑，跳过", kind);
                return Ok(SurfaceReport::skipped(surface));
            }
        };

        let started = Instant::now();
        self.events
            .emit(event_builders::sync_started(surface))
            .await;
        self.set_phase(SyncPhase::Running).await;

        match self.drain(surface, kind.budget(), Some(&expiration)).await {
            Ok(mut report) => {
                if report.uploaded_items > 0 {
                    self.touch_last_sync().await;
                }
                report.duration_ms = started.elapsed().as_millis() as u64;
                let next_phase = if report.failed_items > 0 {
                    SyncPhase::BackingOff
                } else {
                    SyncPhase::Idle
                };
                self.set_phase(next_phase).await;
                self.events
                    .emit(event_builders::sync_completed(
                        surface,
                        report.uploaded_items,
                        report.uploaded_samples,
                        report.duration_ms,
                    ))
                    .await;
                info!(
                    "✅ {} 窗口完成: uploaded={}, failed={}, released={}, expired={}, {}ms",
                    kind,
                    report.uploaded_items,
                    report.failed_items,
                    report.released_items,
                    report.expired,
                    report.duration_ms
                );
                Ok(report)
            }
            Err(e) => {
                error!("❌ {} 窗口排空失败: {}", kind, e);
                self.note_error(&e);
                self.events
                    .emit(event_builders::sync_failed(surface, &e.to_string()))
                    .await;
                self.set_phase(SyncPhase::Error).await;
                Err(e)
            }
        }
    }

    /// 全量重同步：清除全部锚点，下一轮各源按全量窗口回读
    pub async fn full_resync(&self) -> Result<usize> {
        let cleared = self.anchors.clear_all()?;
        if let Err(e) = self
            .kv
            .set(keys::LAST_FULL_RESYNC, &Utc::now().timestamp())
            .await
        {
            debug!("记录全量重同步时间失败: {}", e);
        }
        info!("🔄 全量重同步: 已清除 {} 个锚点", cleared);
        self.events
            .emit(event_builders::full_resync_requested(cleared))
            .await;
        Ok(cleared)
    }

    /// 排空一轮：认领 → 按预算上传 → 标记终态
    async fn drain(
        &self,
        surface: SyncSurface,
        budget: DrainBudget,
        expiration: Option<&CancellationToken>,
    ) -> Result<SurfaceReport> {
        let mut report = SurfaceReport::new(surface);
        let claimed = self.queue.dequeue_eligible(budget.max_items as u32).await?;
        report.claimed = claimed.len();
        if claimed.is_empty() {
            debug!("队列无可出队批次: {}", surface);
            return Ok(report);
        }
        info!("📤 {} 认领 {} 个批次", surface, claimed.len());

        let mut groups: VecDeque<Vec<QueuedUpload>> = if budget.group_by_source {
            group_by_source(claimed).into()
        } else {
            claimed.into_iter().map(|task| vec![task]).collect()
        };
        let kind = batch_kind_for(surface);
        let timeout = Duration::from_secs(budget.attempt_timeout_secs);

        while let Some(group) = groups.pop_front() {
            // 窗口已到期且当前组还没发起：整组连同剩余让路，不消耗重试
            if expiration.map_or(false, |token| token.is_cancelled()) {
                let mut released = self.release_group(&group).await;
                released += self.release_all(&mut groups).await;
                report.released_items += released;
                report.expired = true;
                warn!("🛑 {} 窗口到期，{} 个批次让路", surface, released);
                self.events
                    .emit(event_builders::slot_expired(surface, released))
                    .await;
                break;
            }

            let source_type = group[0].source_type.clone();
            let samples: Vec<HealthSample> = group
                .iter()
                .flat_map(|task| task.samples.iter().cloned())
                .collect();
            let sample_count = samples.len();
            let max_retry = group.iter().map(|task| task.retry_count).max().unwrap_or(0);
            let started = Instant::now();

            let outcome = match expiration {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        result = self
                            .transport
                            .upload_batch(&self.user_id, samples, kind, timeout) => Some(result),
                    }
                }
                None => Some(
                    self.transport
                        .upload_batch(&self.user_id, samples, kind, timeout)
                        .await,
                ),
            };
            let elapsed = started.elapsed().as_millis() as u64;

            match outcome {
                None => {
                    // 到期打断了在途上传：这一组按一次失败记（消耗一次重试）
                    self.mark_group_failed(&group).await;
                    report.failed_items += group.len();
                    report.expired = true;
                    self.analytics.record_failure(
                        &source_type,
                        kind,
                        sample_count,
                        elapsed,
                        Some(max_retry),
                        "expired",
                    );
                    let released = self.release_all(&mut groups).await;
                    report.released_items += released;
                    warn!(
                        "🛑 {} 窗口到期打断在途上传: source={}, 剩余 {} 个批次让路",
                        surface, source_type, released
                    );
                    self.events
                        .emit(event_builders::slot_expired(surface, released))
                        .await;
                    break;
                }
                Some(Ok(())) => {
                    self.mark_group_uploaded(&group).await;
                    report.uploaded_items += group.len();
                    report.uploaded_samples += sample_count;
                    self.analytics
                        .record_success(&source_type, kind, sample_count, elapsed);
                    self.events
                        .emit(event_builders::batch_uploaded(
                            &source_type,
                            sample_count,
                            kind,
                        ))
                        .await;
                }
                Some(Err(e)) => {
                    let reason = UploadFailureReason::from_error(&e, budget.attempt_timeout_secs);
                    self.mark_group_failed(&group).await;
                    report.failed_items += group.len();
                    self.analytics.record_failure(
                        &source_type,
                        kind,
                        sample_count,
                        elapsed,
                        Some(max_retry),
                        reason.kind(),
                    );
                    self.note_error(&e);
                    warn!(
                        "⚠️ 批次上传失败 [{}]: source={}, items={}, {}",
                        reason.kind(),
                        source_type,
                        group.len(),
                        e
                    );
                }
            }
        }

        Ok(report)
    }

    /// 逐源补查错过的窗口（仅前台）
    ///
    /// 队列积压过高时跳过：先还旧账，别再添新账。失败的补查批次
    /// 以高优先级入队，让后台窗口优先补传。
    async fn recheck_missed_windows(&self, report: &mut SurfaceReport) {
        let backlog = match self.queue.statistics().await {
            Ok(stats) => stats.backlog(),
            Err(e) => {
                warn!("⚠️ 读取队列统计失败，跳过补查: {}", e);
                return;
            }
        };
        if backlog > self.config.backpressure_backlog_limit {
            debug!(
                "⏭️ 队列积压 {} 超过 {}，跳过错过窗口补查",
                backlog, self.config.backpressure_backlog_limit
            );
            return;
        }

        let timeout = Duration::from_secs(FOREGROUND_BUDGET.attempt_timeout_secs);
        for source_type in &self.monitored_sources {
            let prior_anchor = match self.anchors.get(source_type) {
                Ok(anchor) => anchor,
                Err(e) => {
                    warn!("⚠️ 读取锚点失败，跳过补查: {} - {}", source_type, e);
                    continue;
                }
            };
            let delta = match self
                .source
                .incremental_fetch(source_type, prior_anchor.clone())
                .await
            {
                Ok(delta) => delta,
                Err(e) => {
                    warn!("⚠️ 补查增量读取失败: {} - {}", source_type, e);
                    continue;
                }
            };
            if delta.added.is_empty() {
                if let Err(e) = self.anchors.advance(source_type, delta.new_anchor) {
                    warn!("⚠️ 锚点推进失败: {} - {}", source_type, e);
                }
                continue;
            }

            let sample_count = delta.added.len();
            let started = Instant::now();
            match self
                .transport
                .upload_batch(
                    &self.user_id,
                    delta.added.clone(),
                    BatchKind::Foreground,
                    timeout,
                )
                .await
            {
                Ok(()) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    if let Err(e) = self.anchors.advance(source_type, delta.new_anchor) {
                        warn!("⚠️ 锚点推进失败: {} - {}", source_type, e);
                    }
                    self.analytics.record_success(
                        source_type,
                        BatchKind::Foreground,
                        sample_count,
                        elapsed,
                    );
                    self.events
                        .emit(event_builders::batch_uploaded(
                            source_type,
                            sample_count,
                            BatchKind::Foreground,
                        ))
                        .await;
                    report.recheck_uploaded += sample_count;
                }
                Err(e) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    let reason = UploadFailureReason::from_error(
                        &e,
                        FOREGROUND_BUDGET.attempt_timeout_secs,
                    );
                    self.analytics.record_failure(
                        source_type,
                        BatchKind::Foreground,
                        sample_count,
                        elapsed,
                        None,
                        reason.kind(),
                    );
                    self.note_error(&e);

                    match self
                        .queue
                        .enqueue(
                            &self.user_id,
                            source_type,
                            &delta.added,
                            prior_anchor,
                            UploadPriority::High,
                        )
                        .await
                    {
                        Some(_) => {
                            if let Err(e) = self.anchors.advance(source_type, delta.new_anchor) {
                                warn!("⚠️ 锚点推进失败: {} - {}", source_type, e);
                            }
                            self.events
                                .emit(event_builders::batch_queued(
                                    source_type,
                                    sample_count,
                                    UploadPriority::High,
                                ))
                                .await;
                            report.recheck_queued += sample_count;
                        }
                        None => {
                            warn!("⚠️ 补查批次入队失败，锚点不推进: {}", source_type);
                        }
                    }
                }
            }
        }
    }

    async fn mark_group_uploaded(&self, group: &[QueuedUpload]) {
        for task in group {
            if let Err(e) = self.queue.mark_uploaded(task.id).await {
                warn!("⚠️ 标记已上传失败: id={}, {}", task.id, e);
            }
        }
    }

    async fn mark_group_failed(&self, group: &[QueuedUpload]) {
        for task in group {
            if let Err(e) = self.queue.mark_failed(task.id).await {
                warn!("⚠️ 标记失败状态失败: id={}, {}", task.id, e);
            }
        }
    }

    async fn release_group(&self, group: &[QueuedUpload]) -> usize {
        let mut released = 0;
        for task in group {
            match self.queue.release(task.id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!("⚠️ 批次让路失败: id={}, {}", task.id, e),
            }
        }
        released
    }

    async fn release_all(&self, groups: &mut VecDeque<Vec<QueuedUpload>>) -> usize {
        let mut released = 0;
        while let Some(group) = groups.pop_front() {
            released += self.release_group(&group).await;
        }
        released
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("user_id", &self.user_id)
            .field("active", &self.is_active())
            .field("phase", &self.phase())
            .finish()
    }
}

fn batch_kind_for(surface: SyncSurface) -> BatchKind {
    match surface {
        SyncSurface::LiveChange => BatchKind::Realtime,
        SyncSurface::Foreground => BatchKind::Foreground,
        SyncSurface::ShortSlot | SyncSurface::LongSlot => BatchKind::Background,
    }
}

/// 按 source_type 合并，组间保持首次出现的顺序，组内保持出队顺序
fn group_by_source(tasks: Vec<QueuedUpload>) -> Vec<Vec<QueuedUpload>> {
    let mut groups: Vec<(String, Vec<QueuedUpload>)> = Vec::new();
    for task in tasks {
        match groups.iter_mut().find(|(s, _)| *s == task.source_type) {
            Some((_, group)) => group.push(task),
            None => groups.push((task.source_type.clone(), vec![task])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}
