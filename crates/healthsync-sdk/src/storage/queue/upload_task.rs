use crate::sample::{AnchorToken, HealthSample};
use crate::storage::queue::priority::UploadPriority;
use crate::storage::queue::retry_policy::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 上传状态枚举
///
/// 状态机：pending → uploading → uploaded / failed，
/// failed 在退避窗口过后可重新回到 uploading。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待上传
    Pending,
    /// 正在上传（已被某次出队认领）
    Uploading,
    /// 上传完成，等待清理器回收
    Uploaded,
    /// 上传失败，按退避曲线等待重试
    Failed,
}

impl UploadStatus {
    /// 持久化到 status 列的字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Failed => "failed",
        }
    }

    /// 从 status 列解析
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "uploading" => Some(UploadStatus::Uploading),
            "uploaded" => Some(UploadStatus::Uploaded),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }

    /// 是否为终态（不再参与出队）
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Uploaded)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::Pending => write!(f, "等待上传"),
            UploadStatus::Uploading => write!(f, "正在上传"),
            UploadStatus::Uploaded => write!(f, "上传完成"),
            UploadStatus::Failed => write!(f, "上传失败"),
        }
    }
}

/// 队列中的一条上传任务（upload_queue 表的行模型）
///
/// 调度相关的派生量（评分、重试资格）都以"查询时刻"为参数计算，
/// 不落库，保证同一行在不同时刻可以得出不同的调度结论。
#[derive(Debug, Clone)]
pub struct QueuedUpload {
    /// SQLite 主键
    pub id: i64,
    /// 归属用户
    pub user_id: String,
    /// 数据源类型（steps / heartRate / ...）
    pub source_type: String,
    /// 批次内的样本（sample_data 列的 JSON 解码结果）
    pub samples: Vec<HealthSample>,
    /// 入队时的游标快照（anchor_data 列），仅诊断用途
    pub anchor_snapshot: Option<AnchorToken>,
    /// 入队时间（Unix 秒）
    pub created_at: i64,
    /// 已失败次数
    pub retry_count: u32,
    /// 最近一次出队认领时间（Unix 秒）
    pub last_attempt: Option<i64>,
    /// 当前状态
    pub status: UploadStatus,
    /// 上传优先级
    pub priority: UploadPriority,
}

impl QueuedUpload {
    /// 批次内样本数
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// 任务年龄（分钟），按给定时刻计算
    pub fn age_minutes_at(&self, now: i64) -> i64 {
        (now - self.created_at).max(0) / 60
    }

    /// 调度评分，按给定时刻计算
    ///
    /// 评分 = 优先级权重 * 1000 + min(年龄分钟数, 500) - 重试次数 * 50。
    /// 年龄加成封顶，避免陈旧的失败批次反超新的高优先级批次；
    /// 重试惩罚让屡败的批次逐渐让位给健康的批次。
    pub fn priority_score_at(&self, now: i64) -> i64 {
        self.priority.weight() * 1000 + self.age_minutes_at(now).min(500)
            - self.retry_count as i64 * 50
    }

    /// 按给定时刻判断是否可以出队
    ///
    /// - pending：总是可以
    /// - failed：未超出重试上限且已过退避窗口
    /// - uploading / uploaded：不可以
    pub fn is_eligible_at(&self, now: i64, policy: &RetryPolicy) -> bool {
        match self.status {
            UploadStatus::Pending => true,
            UploadStatus::Failed => {
                policy.should_retry(self.retry_count)
                    && now >= policy.next_attempt_at(self.last_attempt.unwrap_or(0), self.retry_count)
            }
            UploadStatus::Uploading | UploadStatus::Uploaded => false,
        }
    }

    /// 任务的摘要字符串（日志用）
    pub fn details(&self) -> String {
        format!(
            "QueuedUpload(id={}, user={}, source={}, samples={}, priority={}, status={}, retry={})",
            self.id,
            self.user_id,
            self.source_type,
            self.samples.len(),
            self.priority.name(),
            self.status.as_str(),
            self.retry_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_upload(
        priority: UploadPriority,
        status: UploadStatus,
        created_at: i64,
        retry_count: u32,
        last_attempt: Option<i64>,
    ) -> QueuedUpload {
        QueuedUpload {
            id: 1,
            user_id: "u1".to_string(),
            source_type: "steps".to_string(),
            samples: Vec::new(),
            anchor_snapshot: None,
            created_at,
            retry_count,
            last_attempt,
            status,
            priority,
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            UploadStatus::Pending,
            UploadStatus::Uploading,
            UploadStatus::Uploaded,
            UploadStatus::Failed,
        ] {
            assert_eq!(UploadStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(UploadStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_priority_dominates_age() {
        let now = 1_000_000;
        // 刚入队的关键批次
        let critical = make_upload(UploadPriority::Critical, UploadStatus::Pending, now, 0, None);
        // 已经排队 600 分钟的普通批次（年龄加成封顶 500）
        let stale_normal = make_upload(
            UploadPriority::Normal,
            UploadStatus::Pending,
            now - 600 * 60,
            0,
            None,
        );

        assert_eq!(critical.priority_score_at(now), 3000);
        assert_eq!(stale_normal.priority_score_at(now), 1500);
        assert!(critical.priority_score_at(now) > stale_normal.priority_score_at(now));
    }

    #[test]
    fn test_age_bonus_caps_at_500() {
        let now = 1_000_000;
        let old = make_upload(
            UploadPriority::Normal,
            UploadStatus::Pending,
            now - 10_000 * 60,
            0,
            None,
        );
        assert_eq!(old.priority_score_at(now), 1000 + 500);
    }

    #[test]
    fn test_retry_penalty_lowers_score() {
        let now = 1_000_000;
        let fresh = make_upload(UploadPriority::High, UploadStatus::Pending, now, 0, None);
        let beaten = make_upload(UploadPriority::High, UploadStatus::Failed, now, 2, Some(now));
        assert_eq!(fresh.priority_score_at(now) - beaten.priority_score_at(now), 100);
    }

    #[test]
    fn test_eligibility_by_status() {
        let policy = RetryPolicy::default();
        let now = 1_000_000;

        let pending = make_upload(UploadPriority::Normal, UploadStatus::Pending, now, 0, None);
        assert!(pending.is_eligible_at(now, &policy));

        let uploading = make_upload(UploadPriority::Normal, UploadStatus::Uploading, now, 0, None);
        assert!(!uploading.is_eligible_at(now, &policy));

        let uploaded = make_upload(UploadPriority::Normal, UploadStatus::Uploaded, now, 0, None);
        assert!(!uploaded.is_eligible_at(now, &policy));
    }

    #[test]
    fn test_failed_waits_for_backoff_window() {
        let policy = RetryPolicy::default();
        let failed_at = 1_000_000;
        let task = make_upload(
            UploadPriority::Normal,
            UploadStatus::Failed,
            failed_at - 100,
            1,
            Some(failed_at),
        );

        // 第 1 次失败后的退避是 120 秒
        assert!(!task.is_eligible_at(failed_at + 119, &policy));
        assert!(task.is_eligible_at(failed_at + 120, &policy));
    }

    #[test]
    fn test_failed_beyond_max_retries_never_eligible() {
        let policy = RetryPolicy::default();
        let now = 1_000_000;
        let task = make_upload(
            UploadPriority::Critical,
            UploadStatus::Failed,
            now - 10_000,
            3,
            Some(now - 9_000),
        );
        // 即使退避窗口早已过去，超过上限就永远不再出队
        assert!(!task.is_eligible_at(now + 1_000_000, &policy));
    }
}
