use serde::{Deserialize, Serialize};
use std::fmt;

/// 上传优先级枚举
///
/// 优先级决定了样本批次在上传队列中的出队顺序：
/// - Critical: 最高优先级，立即上传（用户主动触发的导出、临床相关数据）
/// - High: 高优先级，优先上传（前台补偿重传、近实时的心率等数据）
/// - Normal: 普通优先级，正常上传（后台增量同步产生的常规批次）
///
/// 数值直接持久化到队列表的 priority 列，并作为调度评分的权重参与
/// `priority * 1000` 的计算，因此数值越大优先级越高。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UploadPriority {
    Normal = 1,   // 后台增量批次
    High = 2,     // 前台补传、实时数据
    Critical = 3, // 用户显式触发
}

impl UploadPriority {
    /// 根据样本类型获取优先级
    ///
    /// 临床敏感的数据类型（心电、血氧）默认高优先级，其余普通优先级。
    pub fn from_source_type(source_type: &str) -> Self {
        match source_type {
            "electrocardiogram" | "oxygenSaturation" => UploadPriority::High,
            _ => UploadPriority::Normal,
        }
    }

    /// 获取优先级的数值（持久化列值，同时是评分权重）
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// 获取评分权重
    ///
    /// 调度评分 = weight * 1000 + 年龄加成 - 重试惩罚
    pub fn weight(&self) -> i64 {
        self.value() as i64
    }

    /// 从数值创建优先级
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(UploadPriority::Normal),
            2 => Some(UploadPriority::High),
            3 => Some(UploadPriority::Critical),
            _ => None,
        }
    }

    /// 获取优先级的显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            UploadPriority::Normal => "普通",
            UploadPriority::High => "高",
            UploadPriority::Critical => "关键",
        }
    }

    /// 获取优先级的英文名称
    pub fn name(&self) -> &'static str {
        match self {
            UploadPriority::Normal => "normal",
            UploadPriority::High => "high",
            UploadPriority::Critical => "critical",
        }
    }

    /// 检查是否为紧急优先级（High 或 Critical）
    pub fn is_urgent(&self) -> bool {
        matches!(self, UploadPriority::High | UploadPriority::Critical)
    }

    /// 获取所有优先级的列表
    pub fn all() -> Vec<Self> {
        vec![
            UploadPriority::Normal,
            UploadPriority::High,
            UploadPriority::Critical,
        ]
    }
}

impl fmt::Display for UploadPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl Default for UploadPriority {
    fn default() -> Self {
        UploadPriority::Normal
    }
}

impl From<u8> for UploadPriority {
    fn from(value: u8) -> Self {
        UploadPriority::from_value(value).unwrap_or(UploadPriority::Normal)
    }
}

impl From<UploadPriority> for u8 {
    fn from(priority: UploadPriority) -> Self {
        priority.value()
    }
}
