use std::time::Duration;

/// 重试策略配置
///
/// 队列不持久化"下次可重试时间"，而是在每次出队查询时用本策略
/// 现场推导：`下次可重试时间 = last_attempt + min(base << retry_count, max)`。
/// 这样调整策略参数后立即对存量失败行生效，无需迁移数据。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数，达到后该行不再出队
    pub max_retries: u32,
    /// 退避基数（秒）
    pub base_delay_secs: u64,
    /// 退避上限（秒）
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,       // 队列层 3 次，叠加上传器内部 3 次尝试
            base_delay_secs: 60,  // 首次失败后等 1 分钟
            max_delay_secs: 3600, // 封顶 1 小时
        }
    }
}

impl RetryPolicy {
    /// 计算第 retry_count 次失败后的退避时长
    ///
    /// 退避曲线：base * 2^retry_count，封顶 max_delay_secs。
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let shifted = self
            .base_delay_secs
            .checked_shl(retry_count.min(32))
            .unwrap_or(u64::MAX);
        Duration::from_secs(shifted.min(self.max_delay_secs))
    }

    /// 检查失败 retry_count 次后是否还允许重试
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// 计算下次允许出队的时间点（Unix 秒）
    pub fn next_attempt_at(&self, last_attempt: i64, retry_count: u32) -> i64 {
        last_attempt.saturating_add(self.backoff_delay(retry_count).as_secs() as i64)
    }
}

/// 上传失败原因
///
/// 上传器把底层错误归类成失败原因，用于决定是否继续尝试以及
/// 统计各类失败的占比。
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadFailureReason {
    #[error("网络错误: {0}")]
    Network(String),

    #[error("请求超时（{timeout_secs}s）")]
    Timeout { timeout_secs: u64 },

    #[error("服务端拒绝: HTTP {status} - {message}")]
    ServerRejected { status: u16, message: String },

    #[error("负载序列化失败: {0}")]
    Serialization(String),
}

impl UploadFailureReason {
    /// 把任意 SDK 错误归类为失败原因
    pub fn from_error(error: &crate::error::HealthSyncError, timeout_secs: u64) -> Self {
        use crate::error::HealthSyncError;
        match error {
            HealthSyncError::Timeout(_) => UploadFailureReason::Timeout { timeout_secs },
            HealthSyncError::ServerRejected { status, message } => {
                UploadFailureReason::ServerRejected {
                    status: *status,
                    message: message.clone(),
                }
            }
            HealthSyncError::Serialization(msg) | HealthSyncError::JsonError(msg) => {
                UploadFailureReason::Serialization(msg.clone())
            }
            other => UploadFailureReason::Network(other.to_string()),
        }
    }

    /// 失败后继续尝试是否有意义
    ///
    /// 4xx（除 408 请求超时、429 限流外）说明请求本身有问题，
    /// 重发同样的负载不会有不同结果。
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadFailureReason::Network(_) => true,
            UploadFailureReason::Timeout { .. } => true,
            UploadFailureReason::ServerRejected { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            UploadFailureReason::Serialization(_) => false,
        }
    }

    /// 统计用的短标签
    pub fn kind(&self) -> &'static str {
        match self {
            UploadFailureReason::Network(_) => "network",
            UploadFailureReason::Timeout { .. } => "timeout",
            UploadFailureReason::ServerRejected { .. } => "server_rejected",
            UploadFailureReason::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_delay(0), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(120));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(240));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(1920));
        // 60 * 2^6 = 3840，封顶到 3600
        assert_eq!(policy.backoff_delay(6), Duration::from_secs(3600));
        assert_eq!(policy.backoff_delay(60), Duration::from_secs(3600));

        // 曲线单调不减
        let mut prev = Duration::ZERO;
        for n in 0..20 {
            let d = policy.backoff_delay(n);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[test]
    fn test_should_retry_boundary() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_zero_base_delay_is_immediate() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_secs: 0,
            max_delay_secs: 3600,
        };
        assert_eq!(policy.backoff_delay(5), Duration::ZERO);
        assert_eq!(policy.next_attempt_at(1_000, 5), 1_000);
    }

    #[test]
    fn test_failure_reason_retryable() {
        assert!(UploadFailureReason::Network("dns".into()).is_retryable());
        assert!(UploadFailureReason::Timeout { timeout_secs: 60 }.is_retryable());
        assert!(UploadFailureReason::ServerRejected {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(UploadFailureReason::ServerRejected {
            status: 429,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(!UploadFailureReason::ServerRejected {
            status: 400,
            message: "bad payload".into()
        }
        .is_retryable());
        assert!(!UploadFailureReason::Serialization("nan".into()).is_retryable());
    }
}
