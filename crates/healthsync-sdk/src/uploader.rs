//! 上传器模块 - 样本批次的 HTTP 上送
//!
//! 本模块提供批次上传能力，使用 reqwest 作为底层 HTTP 客户端：
//! - 主包络：POST {api_url}/upload-health-data，JSON 包络一次携带整批样本
//! - 旁路直传：超大序列（如心电电压）先申请预签名地址直传对象存储，
//!   主包络中以 s3_key 引用替代原始序列
//! - 尝试语义：单次 upload_batch 内部最多尝试 max_attempts 次，
//!   每次尝试独立限时，尝试间指数退避；4xx 类失败立即放弃

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{HealthSyncError, Result};
use crate::sample::{BatchKind, HealthSample};
use crate::sdk::UploaderConfig;
use crate::storage::queue::UploadFailureReason;

/// 批次元数据（包络的 metadata 字段）
#[derive(Debug, Clone, Serialize)]
pub struct BatchMetadata {
    pub total_samples: usize,
    pub batch_type: String,
    /// ISO8601 时间戳
    pub timestamp: String,
}

/// 上传包络（POST /upload-health-data 的请求体）
#[derive(Debug, Clone, Serialize)]
pub struct UploadRequest {
    pub user_id: String,
    pub samples: Vec<HealthSample>,
    pub metadata: BatchMetadata,
}

/// 上传响应
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub samples_received: Option<u64>,
}

/// 预签名申请（POST /get-presigned-url 的请求体）
#[derive(Debug, Clone, Serialize)]
pub struct PresignRequest {
    pub user_id: String,
    pub sample_uuid: String,
    pub estimated_size: usize,
}

/// 预签名响应
#[derive(Debug, Clone, Deserialize)]
pub struct PresignResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    pub s3_key: String,
    pub upload_url: String,
    /// 直传表单的策略字段，必须原样出现在 file 之前
    #[serde(default)]
    pub upload_fields: HashMap<String, String>,
    #[serde(default)]
    pub expires_in_minutes: Option<u32>,
}

/// 批次传输抽象
///
/// 执行协调器只依赖这个 trait，测试时可以用桩实现替代真实 HTTP。
/// 不同执行面的预算不同，单次尝试的超时由调用方给定。
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// 上传一批同源样本；Ok 表示服务端已确认收到
    async fn upload_batch(
        &self,
        user_id: &str,
        samples: Vec<HealthSample>,
        kind: BatchKind,
        attempt_timeout: Duration,
    ) -> Result<()>;
}

/// 样本批次上传器
pub struct Uploader {
    client: Client,
    /// 服务端基础地址，运行时可切换（灰度/区域迁移）
    api_url: RwLock<String>,
    /// 随主包络与预签名申请一起发送的鉴权头
    auth_headers: RwLock<HashMap<String, String>>,
    /// 单次 upload_batch 内最多尝试次数
    max_attempts: u32,
    /// series_data 超过该字节数时走旁路直传
    series_offload_threshold: usize,
}

impl Uploader {
    /// 创建新的上传器
    pub fn new(config: &UploaderConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            // 移动网络在尝试之间经常切换，复用闲置连接容易黑洞，每次都新建
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| HealthSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ 上传器已创建 (api_url: {})", config.api_url);

        Ok(Self {
            client,
            api_url: RwLock::new(config.api_url.trim_end_matches('/').to_string()),
            auth_headers: RwLock::new(config.auth_headers.clone()),
            max_attempts: config.max_attempts,
            series_offload_threshold: config.series_offload_threshold_bytes,
        })
    }

    /// 当前生效的服务端地址
    pub fn api_url(&self) -> String {
        self.api_url.read().clone()
    }

    /// 运行时切换服务端地址（对进行中的尝试不生效，从下一次尝试开始）
    pub fn set_api_url(&self, api_url: &str) {
        let normalized = api_url.trim_end_matches('/').to_string();
        info!("🔧 上传器切换服务端地址: {}", normalized);
        *self.api_url.write() = normalized;
    }

    /// 运行时替换鉴权头（token 轮换）
    pub fn set_auth_headers(&self, headers: HashMap<String, String>) {
        *self.auth_headers.write() = headers;
    }

    /// 给请求附上当前鉴权头
    fn with_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in self.auth_headers.read().iter() {
            request = request.header(name, value);
        }
        request
    }

    /// 尝试间的退避时长（第 attempt 次尝试失败后）
    fn attempt_backoff(attempt: u32) -> Duration {
        Duration::from_secs(2u64.saturating_pow(attempt))
    }

    /// 判断样本是否需要旁路直传
    fn needs_offload(sample: &HealthSample, threshold: usize) -> bool {
        sample.series_data.is_some() && sample.series_size_estimate() > threshold
    }

    /// 把底层错误归类为失败原因
    fn classify(error: &HealthSyncError, timeout_secs: u64) -> UploadFailureReason {
        UploadFailureReason::from_error(error, timeout_secs)
    }

    /// 申请预签名地址并直传单个样本的序列数据
    ///
    /// 成功后样本就地改写：series_data 清空，s3_key 指向对象存储。
    async fn offload_series(&self, user_id: &str, sample: &mut HealthSample) -> Result<()> {
        let estimated_size = sample.series_size_estimate();

        info!(
            "📦 序列数据超限，申请旁路直传: uuid={}, estimated={} bytes",
            sample.uuid, estimated_size
        );

        // 1. 申请预签名上传地址
        let presign_url = format!("{}/get-presigned-url", self.api_url());
        let request = PresignRequest {
            user_id: user_id.to_string(),
            sample_uuid: sample.uuid.clone(),
            estimated_size,
        };

        let response = self
            .with_auth(self.client.post(&presign_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| HealthSyncError::Network(format!("申请预签名地址失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            return Err(HealthSyncError::ServerRejected {
                status: status.as_u16(),
                message: format!("预签名申请被拒绝: {}", error_text),
            });
        }

        let presign: PresignResponse = response
            .json()
            .await
            .map_err(|e| HealthSyncError::Serialization(format!("解析预签名响应失败: {}", e)))?;

        if presign.status != "success" {
            return Err(HealthSyncError::Upload(format!(
                "预签名申请失败: {}",
                presign.message.unwrap_or_else(|| "服务端未说明原因".to_string())
            )));
        }

        // 2. 序列数据编码为独立 JSON 文件
        let series = sample
            .series_data
            .take()
            .ok_or_else(|| HealthSyncError::InvalidData("样本没有序列数据".to_string()))?;
        let series_bytes = serde_json::to_vec(&series).map_err(|e| {
            // 放回去，失败的样本保持原样进入重试
            sample.series_data = Some(series.clone());
            HealthSyncError::Serialization(format!("序列数据编码失败: {}", e))
        })?;

        // 3. 构建直传表单：策略字段在前，file 必须是最后一个 part
        let mut form = multipart::Form::new();
        for (key, value) in &presign.upload_fields {
            form = form.text(key.clone(), value.clone());
        }
        let part = multipart::Part::bytes(series_bytes)
            .file_name(format!("{}.json", sample.uuid))
            .mime_str("application/json")
            .map_err(|e| {
                sample.series_data = Some(series.clone());
                HealthSyncError::Other(format!("创建 multipart part 失败: {}", e))
            })?;
        form = form.part("file", part);

        // 4. 直传对象存储
        let upload_result = self
            .client
            .post(&presign.upload_url)
            .multipart(form)
            .send()
            .await;

        let response = match upload_result {
            Ok(response) => response,
            Err(e) => {
                sample.series_data = Some(series);
                return Err(HealthSyncError::Network(format!("序列直传失败: {}", e)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            sample.series_data = Some(series);
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            return Err(HealthSyncError::ServerRejected {
                status: status.as_u16(),
                message: format!("序列直传被拒绝: {}", error_text),
            });
        }

        // 5. 主包络中以对象键引用替代原始序列
        sample.s3_key = Some(presign.s3_key.clone());

        info!(
            "✅ 序列直传完成: uuid={}, s3_key={}, expires_in={:?}min",
            sample.uuid, presign.s3_key, presign.expires_in_minutes
        );
        Ok(())
    }

    /// 发送一次主包络（单次尝试，不含超时与重试）
    async fn send_envelope(&self, request: &UploadRequest) -> Result<UploadResponse> {
        let url = format!("{}/upload-health-data", self.api_url());

        let response = self
            .with_auth(self.client.post(&url))
            .json(request)
            .send()
            .await
            .map_err(|e| HealthSyncError::Network(format!("上传请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ 上传被拒绝，HTTP 状态码: {}, 错误: {}", status, error_text);
            return Err(HealthSyncError::ServerRejected {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let result: UploadResponse = response
            .json()
            .await
            .map_err(|e| HealthSyncError::Serialization(format!("解析上传响应失败: {}", e)))?;

        if !result.success {
            return Err(HealthSyncError::Upload(
                result
                    .message
                    .unwrap_or_else(|| "服务端未说明原因".to_string()),
            ));
        }

        Ok(result)
    }
}

#[async_trait]
impl BatchTransport for Uploader {
    async fn upload_batch(
        &self,
        user_id: &str,
        mut samples: Vec<HealthSample>,
        kind: BatchKind,
        attempt_timeout: Duration,
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        // 1. 旁路直传只做一次：每次重试不重复传已经落到对象存储的序列
        for sample in samples.iter_mut() {
            if Self::needs_offload(sample, self.series_offload_threshold) {
                self.offload_series(user_id, sample).await?;
            }
        }

        // 2. 组装主包络
        let request = UploadRequest {
            user_id: user_id.to_string(),
            metadata: BatchMetadata {
                total_samples: samples.len(),
                batch_type: kind.as_str().to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
            samples,
        };

        info!(
            "📤 开始上传批次: user={}, samples={}, kind={}",
            user_id, request.metadata.total_samples, kind
        );

        // 3. 限时尝试循环：每次尝试独立限时，尝试间指数退避，最后一次不等待
        let mut last_error = HealthSyncError::Upload("上传未开始".to_string());
        for attempt in 1..=self.max_attempts {
            let outcome = match tokio::time::timeout(attempt_timeout, self.send_envelope(&request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(HealthSyncError::Timeout(format!(
                    "第 {} 次尝试超时（{}s）",
                    attempt,
                    attempt_timeout.as_secs()
                ))),
            };

            match outcome {
                Ok(response) => {
                    info!(
                        "✅ 批次上传成功: user={}, received={:?} (第 {} 次尝试)",
                        user_id, response.samples_received, attempt
                    );
                    return Ok(());
                }
                Err(e) => {
                    let reason = Self::classify(&e, attempt_timeout.as_secs());
                    warn!(
                        "⚠️ 第 {}/{} 次尝试失败 [{}]: {}",
                        attempt,
                        self.max_attempts,
                        reason.kind(),
                        e
                    );

                    let abort = !reason.is_retryable();
                    last_error = e;
                    if abort {
                        debug!("🚫 失败原因不可重试，放弃剩余尝试");
                        break;
                    }
                    if attempt < self.max_attempts {
                        tokio::time::sleep(Self::attempt_backoff(attempt)).await;
                    }
                }
            }
        }

        error!("❌ 批次上传失败: user={}, error={}", user_id, last_error);
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn make_sample(series: Option<serde_json::Value>) -> HealthSample {
        HealthSample {
            uuid: "abc-123".to_string(),
            sample_type: "heartRate".to_string(),
            value: Some(72.0),
            unit: Some("count/min".to_string()),
            start_date: Utc::now(),
            end_date: Utc::now(),
            source_name: Some("UnitTest".to_string()),
            metadata: None,
            series_data: series,
            s3_key: None,
        }
    }

    #[test]
    fn test_envelope_wire_field_names() {
        let request = UploadRequest {
            user_id: "u1".to_string(),
            samples: vec![make_sample(None)],
            metadata: BatchMetadata {
                total_samples: 1,
                batch_type: BatchKind::Realtime.as_str().to_string(),
                timestamp: "2024-01-01T00:00:00Z".to_string(),
            },
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["metadata"]["total_samples"], 1);
        assert_eq!(value["metadata"]["batch_type"], "realtime");
        assert!(value["metadata"]["timestamp"].is_string());
        assert_eq!(value["samples"][0]["type"], "heartRate");
        assert_eq!(value["samples"][0]["uuid"], "abc-123");
    }

    #[test]
    fn test_upload_response_tolerates_missing_fields() {
        let parsed: UploadResponse = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(parsed.success);
        assert!(parsed.message.is_none());
        assert!(parsed.samples_received.is_none());

        let parsed: UploadResponse = serde_json::from_value(json!({
            "success": false,
            "message": "quota exceeded",
            "samples_received": 0
        }))
        .unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.message.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn test_presign_response_parses_upload_fields() {
        let parsed: PresignResponse = serde_json::from_value(json!({
            "status": "success",
            "message": "ok",
            "s3_key": "ecg/u1/abc-123.json",
            "upload_url": "https://bucket.example.com",
            "upload_fields": {"key": "ecg/u1/abc-123.json", "policy": "b64"},
            "expires_in_minutes": 15
        }))
        .unwrap();

        assert_eq!(parsed.s3_key, "ecg/u1/abc-123.json");
        assert_eq!(parsed.upload_fields.len(), 2);
        assert_eq!(parsed.expires_in_minutes, Some(15));
    }

    #[test]
    fn test_needs_offload_threshold() {
        let small = make_sample(Some(json!([1, 2, 3])));
        assert!(!Uploader::needs_offload(&small, 1024));
        // 阈值为 0 时任何非空序列都要旁路
        assert!(Uploader::needs_offload(&small, 0));

        let none = make_sample(None);
        assert!(!Uploader::needs_offload(&none, 0));
    }

    #[test]
    fn test_attempt_backoff_doubles() {
        assert_eq!(Uploader::attempt_backoff(1), Duration::from_secs(2));
        assert_eq!(Uploader::attempt_backoff(2), Duration::from_secs(4));
        assert_eq!(Uploader::attempt_backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_classify_maps_to_retryability() {
        let rejected = Uploader::classify(
            &HealthSyncError::ServerRejected {
                status: 400,
                message: "bad".to_string(),
            },
            60,
        );
        assert!(!rejected.is_retryable());

        let throttled = Uploader::classify(
            &HealthSyncError::ServerRejected {
                status: 429,
                message: "slow down".to_string(),
            },
            60,
        );
        assert!(throttled.is_retryable());

        let network = Uploader::classify(&HealthSyncError::Network("dns".to_string()), 60);
        assert!(network.is_retryable());

        let timeout = Uploader::classify(&HealthSyncError::Timeout("60s".to_string()), 60);
        assert!(timeout.is_retryable());
        assert!(matches!(
            timeout,
            UploadFailureReason::Timeout { timeout_secs: 60 }
        ));
    }
}
