//! 持久化上传队列
//!
//! 本模块提供：
//! - UploadQueue：基于 SQLite 的持久化优先级队列（单写者 Actor 之上的门面）
//! - UploadPriority / UploadStatus / QueuedUpload：队列的行模型
//! - RetryPolicy：读取时现场推导重试资格的退避策略
//!
//! 队列对上层承诺：
//! - 入队吞掉一切存储错误（调用方在数据回调热路径上，不能被本地盘问题打断），
//!   丢失的批次由前台对账补偿
//! - 出队即认领：返回的行已翻转为 uploading，进程崩溃后由下次启动回收
//! - mark_uploaded / mark_failed 幂等，迟到的槽位回调不会二次计数

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error};

use crate::error::Result;
use crate::sample::{AnchorToken, HealthSample};
use crate::storage::db_actor::QueueDbHandle;

pub mod priority;
pub mod retry_policy;
pub mod upload_task;

// 重新导出核心类型
pub use priority::UploadPriority;
pub use retry_policy::{RetryPolicy, UploadFailureReason};
pub use upload_task::{QueuedUpload, UploadStatus};

/// 队列统计信息（按状态分桶的行数）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub pending: u64,
    pub uploading: u64,
    pub uploaded: u64,
    pub failed: u64,
    /// status 列出现未知值的行数（正常情况下恒为 0）
    pub unknown: u64,
}

impl QueueStatistics {
    /// 队列总行数
    pub fn total(&self) -> u64 {
        self.pending + self.uploading + self.uploaded + self.failed + self.unknown
    }

    /// 尚未完成上传的行数（pending + uploading + failed）
    pub fn backlog(&self) -> u64 {
        self.pending + self.uploading + self.failed
    }
}

/// 持久化上传队列
#[derive(Debug)]
pub struct UploadQueue {
    db: QueueDbHandle,
    policy: RetryPolicy,
}

impl UploadQueue {
    /// 打开（必要时创建）队列数据库
    ///
    /// 打开过程包含 schema 迁移与孤儿行回收，失败直接返回错误，
    /// 队列不可用时 SDK 不应继续初始化。
    pub fn open(db_path: &Path, policy: RetryPolicy) -> Result<Self> {
        let db = QueueDbHandle::open(db_path)?;
        Ok(Self { db, policy })
    }

    /// 当前生效的重试策略
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 入队一个批次，返回行 id
    ///
    /// 任何失败（序列化、落盘）都被吞掉并记日志，返回 None。
    /// 调用方不需要也不应该处理入队失败：锚点没有推进，
    /// 丢掉的样本会在下次前台对账时重新读出来。
    pub async fn enqueue(
        &self,
        user_id: &str,
        source_type: &str,
        samples: &[HealthSample],
        anchor_snapshot: Option<AnchorToken>,
        priority: UploadPriority,
    ) -> Option<i64> {
        if samples.is_empty() {
            debug!("⏭️ [UploadQueue] 空批次不入队: source={}", source_type);
            return None;
        }

        let sample_data = match serde_json::to_string(samples) {
            Ok(json) => json,
            Err(e) => {
                debug!(
                    "⚠️ [UploadQueue] 样本序列化失败，丢弃批次: source={}, error={}",
                    source_type, e
                );
                return None;
            }
        };

        match self
            .db
            .enqueue(
                user_id.to_string(),
                source_type.to_string(),
                sample_data,
                anchor_snapshot,
                priority.value(),
                Utc::now().timestamp(),
            )
            .await
        {
            Ok(id) => {
                debug!(
                    "📥 [UploadQueue] 批次已入队: id={}, source={}, samples={}, priority={}",
                    id,
                    source_type,
                    samples.len(),
                    priority.name()
                );
                Some(id)
            }
            Err(e) => {
                error!(
                    "❌ [UploadQueue] 入队失败，批次丢弃（等待前台对账补偿）: source={}, error={}",
                    source_type, e
                );
                None
            }
        }
    }

    /// 出队至多 limit 条可执行批次并认领为 uploading
    ///
    /// 可执行 = pending，或 failed 且未超重试上限且退避窗口已过。
    /// 排序按调度评分降序，同分按入队先后。
    pub async fn dequeue_eligible(&self, limit: u32) -> Result<Vec<QueuedUpload>> {
        self.db
            .dequeue_eligible(limit, Utc::now().timestamp(), self.policy.clone())
            .await
    }

    /// 标记上传成功；该行之前确实处于 uploading 时返回 true
    pub async fn mark_uploaded(&self, id: i64) -> Result<bool> {
        self.db.mark_uploaded(id).await
    }

    /// 标记上传失败并消耗一次重试；该行之前确实处于 uploading 时返回 true
    pub async fn mark_failed(&self, id: i64) -> Result<bool> {
        self.db.mark_failed(id, Utc::now().timestamp()).await
    }

    /// 释放被认领但未实际尝试的行（槽位到期时的剩余批次），不消耗重试
    pub async fn release(&self, id: i64) -> Result<bool> {
        self.db.release(id).await
    }

    /// 按状态统计行数
    pub async fn statistics(&self) -> Result<QueueStatistics> {
        self.db.statistics().await
    }

    /// 清理入队时间早于 older_than 之前的已上传行，返回删除数
    pub async fn reap_uploaded(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - older_than.as_secs() as i64;
        self.db.reap(cutoff).await
    }

    /// 停止底层 DB Actor（幂等）
    pub fn shutdown(&self) {
        self.db.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_sample(sample_type: &str, value: f64) -> HealthSample {
        HealthSample {
            uuid: uuid::Uuid::new_v4().to_string(),
            sample_type: sample_type.to_string(),
            value: Some(value),
            unit: Some("count".to_string()),
            start_date: Utc::now(),
            end_date: Utc::now(),
            source_name: Some("UnitTest".to_string()),
            metadata: None,
            series_data: None,
            s3_key: None,
        }
    }

    fn open_queue(dir: &TempDir, policy: RetryPolicy) -> UploadQueue {
        UploadQueue::open(&dir.path().join("queue.db"), policy).unwrap()
    }

    /// 立即可重试的策略，测试不用等真实时钟
    fn immediate_retry_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_secs: 0,
            max_delay_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_dequeue_claims_rows() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir, RetryPolicy::default());

        let id = queue
            .enqueue(
                "u1",
                "steps",
                &[make_sample("steps", 120.0)],
                None,
                UploadPriority::Normal,
            )
            .await
            .unwrap();
        assert!(id > 0);

        let claimed = queue.dequeue_eligible(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, UploadStatus::Uploading);
        assert_eq!(claimed[0].samples.len(), 1);
        assert_eq!(claimed[0].samples[0].sample_type, "steps");

        // 已认领的行不会被再次出队
        let again = queue.dequeue_eligible(10).await.unwrap();
        assert!(again.is_empty());

        let stats = queue.statistics().await.unwrap();
        assert_eq!(stats.uploading, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_dequeue_orders_by_priority_then_insertion() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir, RetryPolicy::default());

        let normal = queue
            .enqueue("u1", "steps", &[make_sample("steps", 1.0)], None, UploadPriority::Normal)
            .await
            .unwrap();
        let critical = queue
            .enqueue(
                "u1",
                "electrocardiogram",
                &[make_sample("electrocardiogram", 0.0)],
                None,
                UploadPriority::Critical,
            )
            .await
            .unwrap();
        let high = queue
            .enqueue("u1", "heartRate", &[make_sample("heartRate", 72.0)], None, UploadPriority::High)
            .await
            .unwrap();

        let claimed = queue.dequeue_eligible(10).await.unwrap();
        let ids: Vec<i64> = claimed.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![critical, high, normal]);
    }

    #[tokio::test]
    async fn test_same_priority_keeps_insertion_order() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir, RetryPolicy::default());

        let mut expected = Vec::new();
        for n in 0..3 {
            let id = queue
                .enqueue(
                    "u1",
                    "steps",
                    &[make_sample("steps", n as f64)],
                    None,
                    UploadPriority::Normal,
                )
                .await
                .unwrap();
            expected.push(id);
        }

        let claimed = queue.dequeue_eligible(10).await.unwrap();
        let ids: Vec<i64> = claimed.iter().map(|t| t.id).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_mark_uploaded_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir, RetryPolicy::default());

        queue
            .enqueue("u1", "steps", &[make_sample("steps", 1.0)], None, UploadPriority::Normal)
            .await
            .unwrap();
        let claimed = queue.dequeue_eligible(1).await.unwrap();
        let id = claimed[0].id;

        assert!(queue.mark_uploaded(id).await.unwrap());
        // 第二次是迟到的重复回调，必须不再生效
        assert!(!queue.mark_uploaded(id).await.unwrap());
        // 已完成的行也不能再被标记失败
        assert!(!queue.mark_failed(id).await.unwrap());

        let stats = queue.statistics().await.unwrap();
        assert_eq!(stats.uploaded, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_failed_row_waits_out_backoff_window() {
        let dir = TempDir::new().unwrap();
        // 真实退避：失败后 60 秒内不可重试
        let queue = open_queue(&dir, RetryPolicy::default());

        queue
            .enqueue("u1", "steps", &[make_sample("steps", 1.0)], None, UploadPriority::Normal)
            .await
            .unwrap();
        let claimed = queue.dequeue_eligible(1).await.unwrap();
        assert!(queue.mark_failed(claimed[0].id).await.unwrap());

        // 退避窗口内出队为空
        let again = queue.dequeue_eligible(10).await.unwrap();
        assert!(again.is_empty());

        let stats = queue.statistics().await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_excludes_row_forever() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir, immediate_retry_policy());

        queue
            .enqueue("u1", "heartRate", &[make_sample("heartRate", 60.0)], None, UploadPriority::High)
            .await
            .unwrap();

        // 连败 3 次耗尽重试
        for attempt in 0..3 {
            let claimed = queue.dequeue_eligible(1).await.unwrap();
            assert_eq!(claimed.len(), 1, "第 {} 次应该仍可出队", attempt + 1);
            assert_eq!(claimed[0].retry_count, attempt);
            assert!(queue.mark_failed(claimed[0].id).await.unwrap());
        }

        // 即使退避为 0，超过上限的行也永远不再出队
        let after = queue.dequeue_eligible(10).await.unwrap();
        assert!(after.is_empty());

        let stats = queue.statistics().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_release_does_not_consume_retry() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir, RetryPolicy::default());

        queue
            .enqueue("u1", "steps", &[make_sample("steps", 1.0)], None, UploadPriority::Normal)
            .await
            .unwrap();
        let claimed = queue.dequeue_eligible(1).await.unwrap();
        assert!(queue.release(claimed[0].id).await.unwrap());

        // 释放后立即可再出队，且重试计数不变
        let again = queue.dequeue_eligible(1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_reap_removes_only_uploaded_rows() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir, RetryPolicy::default());

        queue
            .enqueue("u1", "steps", &[make_sample("steps", 1.0)], None, UploadPriority::Normal)
            .await
            .unwrap();
        queue
            .enqueue("u1", "heartRate", &[make_sample("heartRate", 70.0)], None, UploadPriority::Normal)
            .await
            .unwrap();

        let claimed = queue.dequeue_eligible(1).await.unwrap();
        queue.mark_uploaded(claimed[0].id).await.unwrap();

        // older_than 为 0 表示清理所有已上传行
        let reaped = queue.reap_uploaded(Duration::ZERO).await.unwrap();
        assert_eq!(reaped, 1);

        let stats = queue.statistics().await.unwrap();
        assert_eq!(stats.uploaded, 0);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_enqueued() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir, RetryPolicy::default());

        assert!(queue
            .enqueue("u1", "steps", &[], None, UploadPriority::Normal)
            .await
            .is_none());

        let stats = queue.statistics().await.unwrap();
        assert_eq!(stats.total(), 0);
    }

    #[tokio::test]
    async fn test_reopen_reclaims_interrupted_uploads() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("queue.db");

        {
            let queue = UploadQueue::open(&db_path, RetryPolicy::default()).unwrap();
            queue
                .enqueue("u1", "steps", &[make_sample("steps", 1.0)], None, UploadPriority::Normal)
                .await
                .unwrap();
            // 认领后模拟进程退出：不做任何标记
            let claimed = queue.dequeue_eligible(1).await.unwrap();
            assert_eq!(claimed.len(), 1);
            queue.shutdown();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reopened = UploadQueue::open(&db_path, RetryPolicy::default()).unwrap();
        let stats = reopened.statistics().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.uploading, 0);

        // 回收的行保留原重试计数，可正常出队
        let claimed = reopened.dequeue_eligible(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_statistics_counts_sum_to_total() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir, immediate_retry_policy());

        for n in 0..4 {
            queue
                .enqueue(
                    "u1",
                    "steps",
                    &[make_sample("steps", n as f64)],
                    None,
                    UploadPriority::Normal,
                )
                .await
                .unwrap();
        }

        let claimed = queue.dequeue_eligible(3).await.unwrap();
        queue.mark_uploaded(claimed[0].id).await.unwrap();
        queue.mark_failed(claimed[1].id).await.unwrap();
        // claimed[2] 留在 uploading

        let stats = queue.statistics().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.uploading, 1);
        assert_eq!(stats.uploaded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unknown, 0);
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.backlog(), 3);
    }
}
