//! 健康样本数据模型 - 上传管道贯穿始终的核心类型
//!
//! 本模块提供：
//! - HealthSample：与服务端约定的样本 JSON 结构
//! - BatchKind：批次来源分类（仅用于观测与超时调参）
//! - FetchDelta：宿主健康库增量查询的返回值
//! - sources：常用数据源类型常量

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 不透明锚点令牌：宿主健康库游标的序列化字节，SDK 只负责保存与回传
pub type AnchorToken = Vec<u8>;

/// 单条健康样本（与服务端 ingestion 接口的 JSON 字段一一对应）
///
/// `series_data` 承载高频原始序列（如心电电压），体积可达数十 MB，
/// 超过阈值时走预签名直传旁路，主包络中以 `s3_key` 引用替代。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    /// 样本唯一标识，服务端按此去重（至多一次语义由服务端兜底）
    pub uuid: String,
    /// 样本类型，如 "heartRate" / "steps"
    #[serde(rename = "type")]
    pub sample_type: String,
    /// 数值（部分类型如睡眠分段没有单一数值）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// 单位，如 "count/min"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "startDate")]
    pub start_date: DateTime<Utc>,
    #[serde(rename = "endDate")]
    pub end_date: DateTime<Utc>,
    /// 采集设备/App 名称
    #[serde(rename = "sourceName", skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    /// 宿主健康库附带的元数据，SDK 不解析，原样透传
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// 高频原始序列（如 ECG 电压点），超限时被旁路直传剥离
    #[serde(rename = "seriesData", default, skip_serializing_if = "Option::is_none")]
    pub series_data: Option<serde_json::Value>,
    /// 旁路直传完成后的对象引用键，替代 series_data 出现在主包络中
    #[serde(rename = "s3Key", default, skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,
}

impl HealthSample {
    /// 序列化后 series_data 的估算字节数（用于旁路阈值判断与预签名申请）
    pub fn series_size_estimate(&self) -> usize {
        self.series_data
            .as_ref()
            .and_then(|v| serde_json::to_vec(v).ok())
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

/// 批次来源分类（随包络上报，服务端按此归档；本地仅用于观测与超时调参）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    /// 实时变更回调触发
    Realtime,
    /// 前台对账触发
    Foreground,
    /// OS 后台执行窗口触发
    Background,
    /// 历史数据回补（全量重同步后）
    Historical,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Realtime => "realtime",
            BatchKind::Foreground => "foreground",
            BatchKind::Background => "background",
            BatchKind::Historical => "historical",
        }
    }

    /// 中文描述（日志展示用）
    pub fn display_name(&self) -> &'static str {
        match self {
            BatchKind::Realtime => "实时",
            BatchKind::Foreground => "前台",
            BatchKind::Background => "后台",
            BatchKind::Historical => "历史",
        }
    }
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for BatchKind {
    fn default() -> Self {
        BatchKind::Background
    }
}

/// 宿主健康库一次增量查询的结果
#[derive(Debug, Clone, Default)]
pub struct FetchDelta {
    /// 自上一锚点以来新增的样本
    pub added: Vec<HealthSample>,
    /// 自上一锚点以来被宿主删除的样本 UUID
    pub deleted_ids: Vec<String>,
    /// 查询后的新锚点；调用方必须在样本妥善落地后才持久化
    pub new_anchor: AnchorToken,
}

impl FetchDelta {
    /// 本次增量是否为空（无新增也无删除）
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted_ids.is_empty()
    }
}

/// 常用的数据源类型常量
///
/// source_type 是开放字符串而非封闭枚举：宿主健康库的类型集合随系统版本扩展，
/// SDK 不应该为新增类型发版。
pub mod sources {
    /// 步数
    pub const STEPS: &str = "steps";
    /// 心率
    pub const HEART_RATE: &str = "heartRate";
    /// 睡眠分析
    pub const SLEEP_ANALYSIS: &str = "sleepAnalysis";
    /// 活动能量
    pub const ACTIVE_ENERGY: &str = "activeEnergy";
    /// 心电图（含高频电压序列，走旁路直传）
    pub const ELECTROCARDIOGRAM: &str = "electrocardiogram";
    /// 血氧饱和度
    pub const OXYGEN_SATURATION: &str = "oxygenSaturation";

    /// 默认监控的数据源集合
    pub fn defaults() -> Vec<String> {
        vec![
            STEPS.to_string(),
            HEART_RATE.to_string(),
            SLEEP_ANALYSIS.to_string(),
            ACTIVE_ENERGY.to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(uuid: &str) -> HealthSample {
        HealthSample {
            uuid: uuid.to_string(),
            sample_type: sources::HEART_RATE.to_string(),
            value: Some(72.0),
            unit: Some("count/min".to_string()),
            start_date: Utc::now(),
            end_date: Utc::now(),
            source_name: Some("Watch".to_string()),
            metadata: None,
            series_data: None,
            s3_key: None,
        }
    }

    #[test]
    fn test_sample_wire_field_names() {
        let s = sample("abc-123");
        let v = serde_json::to_value(&s).unwrap();

        // 服务端约定的字段名：type / startDate / endDate / sourceName
        assert_eq!(v["uuid"], "abc-123");
        assert_eq!(v["type"], "heartRate");
        assert!(v.get("startDate").is_some());
        assert!(v.get("endDate").is_some());
        assert_eq!(v["sourceName"], "Watch");
        // 空的可选字段不应出现在 JSON 中
        assert!(v.get("seriesData").is_none());
        assert!(v.get("s3Key").is_none());
        assert!(v.get("metadata").is_none());
    }

    #[test]
    fn test_batch_kind_wire_values() {
        assert_eq!(BatchKind::Realtime.as_str(), "realtime");
        assert_eq!(BatchKind::Foreground.as_str(), "foreground");
        assert_eq!(BatchKind::Background.as_str(), "background");
        assert_eq!(BatchKind::Historical.as_str(), "historical");

        // serde 序列化与 as_str 保持一致
        let v = serde_json::to_value(BatchKind::Realtime).unwrap();
        assert_eq!(v, json!("realtime"));
    }

    #[test]
    fn test_series_size_estimate() {
        let mut s = sample("ecg-1");
        assert_eq!(s.series_size_estimate(), 0);

        s.series_data = Some(json!({ "voltage": [1.0, 2.0, 3.0] }));
        assert!(s.series_size_estimate() > 10);
    }

    #[test]
    fn test_fetch_delta_is_empty() {
        let mut delta = FetchDelta::default();
        assert!(delta.is_empty());

        delta.deleted_ids.push("gone".to_string());
        assert!(!delta.is_empty());
    }
}
