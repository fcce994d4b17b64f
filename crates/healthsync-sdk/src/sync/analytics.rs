//! 同步健康度分析 - 有界事件环内的成败统计
//!
//! 记录最近的上传结果（成功/失败、样本量、耗时），推导成功率、
//! 连续失败次数与健康档位，并按简单阈值给出文字建议。
//! 事件环是纯内存结构，进程重启即清零；它回答「最近同步得怎么样」，
//! 不承担审计职责。

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::sample::BatchKind;

/// 事件环默认容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// 快照中保留的最近失败条数
const RECENT_FAILURE_LIMIT: usize = 10;

/// 单次上传尝试的结果事件
#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    /// unix 秒
    pub timestamp: i64,
    pub kind: BatchKind,
    pub source_type: String,
    pub success: bool,
    pub sample_count: usize,
    pub duration_ms: u64,
    /// 失败批次此前已累计的重试次数
    pub retry_count: Option<u32>,
    /// 失败时的原因分类（network / timeout / server_rejected / serialization）
    pub error_kind: Option<String>,
}

/// 同步健康档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl HealthTier {
    /// 成功率到档位的映射，边界取闭区间下沿
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= 0.95 {
            HealthTier::Excellent
        } else if rate >= 0.85 {
            HealthTier::Good
        } else if rate >= 0.70 {
            HealthTier::Fair
        } else {
            HealthTier::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthTier::Excellent => "excellent",
            HealthTier::Good => "good",
            HealthTier::Fair => "fair",
            HealthTier::Poor => "poor",
        }
    }

    /// 中文描述（日志展示用）
    pub fn display_name(&self) -> &'static str {
        match self {
            HealthTier::Excellent => "优秀",
            HealthTier::Good => "良好",
            HealthTier::Fair => "一般",
            HealthTier::Poor => "较差",
        }
    }
}

impl std::fmt::Display for HealthTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 健康度快照（按需推导，不落盘）
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub success_rate: f64,
    pub avg_latency_ms: u64,
    /// 从最新事件往回数的连续失败次数
    pub consecutive_failures: usize,
    pub recent_successes: usize,
    pub recent_failures: usize,
    pub tier: HealthTier,
    /// 窗口内成功上传的样本总数
    pub total_samples_uploaded: u64,
    /// 最近的失败事件，新的在前
    pub recent_failure_events: Vec<SyncEvent>,
}

/// 同步健康度分析器
#[derive(Debug)]
pub struct SyncAnalytics {
    capacity: usize,
    events: RwLock<VecDeque<SyncEvent>>,
}

impl SyncAnalytics {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: RwLock::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// 记录一次成功上传
    pub fn record_success(
        &self,
        source_type: &str,
        kind: BatchKind,
        sample_count: usize,
        duration_ms: u64,
    ) {
        self.push(SyncEvent {
            timestamp: Utc::now().timestamp(),
            kind,
            source_type: source_type.to_string(),
            success: true,
            sample_count,
            duration_ms,
            retry_count: None,
            error_kind: None,
        });
    }

    /// 记录一次失败上传
    pub fn record_failure(
        &self,
        source_type: &str,
        kind: BatchKind,
        sample_count: usize,
        duration_ms: u64,
        retry_count: Option<u32>,
        error_kind: &str,
    ) {
        self.push(SyncEvent {
            timestamp: Utc::now().timestamp(),
            kind,
            source_type: source_type.to_string(),
            success: false,
            sample_count,
            duration_ms,
            retry_count,
            error_kind: Some(error_kind.to_string()),
        });
    }

    fn push(&self, event: SyncEvent) {
        let mut events = self.events.write();
        events.push_back(event);
        // 超容时丢最老的事件
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// 窗口内成功率；没有事件时视为健康（1.0）
    pub fn success_rate(&self) -> f64 {
        let events = self.events.read();
        if events.is_empty() {
            return 1.0;
        }
        let successes = events.iter().filter(|e| e.success).count();
        successes as f64 / events.len() as f64
    }

    /// 当前健康档位
    pub fn tier(&self) -> HealthTier {
        HealthTier::from_success_rate(self.success_rate())
    }

    /// 从最新事件往回数的连续失败次数
    pub fn consecutive_failures(&self) -> usize {
        self.events
            .read()
            .iter()
            .rev()
            .take_while(|e| !e.success)
            .count()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// 清空事件环
    pub fn reset(&self) {
        self.events.write().clear();
    }

    /// 生成当前窗口的健康度快照
    pub fn snapshot(&self) -> HealthSnapshot {
        let events = self.events.read();
        let total = events.len();
        let recent_successes = events.iter().filter(|e| e.success).count();
        let recent_failures = total - recent_successes;
        let success_rate = if total == 0 {
            1.0
        } else {
            recent_successes as f64 / total as f64
        };
        let avg_latency_ms = if total == 0 {
            0
        } else {
            events.iter().map(|e| e.duration_ms).sum::<u64>() / total as u64
        };
        let consecutive_failures = events.iter().rev().take_while(|e| !e.success).count();
        let total_samples_uploaded = events
            .iter()
            .filter(|e| e.success)
            .map(|e| e.sample_count as u64)
            .sum();
        let recent_failure_events = events
            .iter()
            .rev()
            .filter(|e| !e.success)
            .take(RECENT_FAILURE_LIMIT)
            .cloned()
            .collect();

        HealthSnapshot {
            success_rate,
            avg_latency_ms,
            consecutive_failures,
            recent_successes,
            recent_failures,
            tier: HealthTier::from_success_rate(success_rate),
            total_samples_uploaded,
            recent_failure_events,
        }
    }

    /// 按简单阈值生成文字建议
    ///
    /// `pending_backlog` 来自队列统计，是唯一的外部输入。
    pub fn recommendations(&self, pending_backlog: u64) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut tips = Vec::new();

        if pending_backlog > 500 {
            tips.push(format!(
                "队列积压 {} 个批次，建议保持应用前台运行一段时间让队列清空",
                pending_backlog
            ));
        }
        if snapshot.consecutive_failures >= 5 {
            tips.push(format!(
                "已连续失败 {} 次，请检查网络连接与服务端状态",
                snapshot.consecutive_failures
            ));
        }
        if snapshot.avg_latency_ms > 10_000 {
            tips.push(format!(
                "平均上传耗时 {}ms，偏高，建议缩小批次或检查弱网环境",
                snapshot.avg_latency_ms
            ));
        }
        if snapshot.tier == HealthTier::Poor && tips.is_empty() {
            tips.push("近期同步成功率偏低，请关注失败原因分布".to_string());
        }

        tips
    }
}

impl Default for SyncAnalytics {
    fn default() -> Self {
        Self::new()
    }
}
