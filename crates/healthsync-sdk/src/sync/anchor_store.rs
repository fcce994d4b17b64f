//! 锚点存储 - 各数据源增量游标的持久化
//!
//! 锚点是宿主健康库返回的不透明游标。本模块只负责保存与回读，
//! 不理解其内容；推进时机由执行协调器控制（妥善送达或持久入队之后）。
//!
//! 损坏的锚点记录按「不存在」处理：下一次增量查询退化为全量拉取，
//! 宁可多传不可漏传，服务端按 uuid 去重。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::Tree;
use tracing::{debug, info, warn};

use crate::error::{HealthSyncError, Result};
use crate::sample::AnchorToken;
use crate::storage::KvStore;

/// 锚点所在的命名 Tree（按用户前缀隔离，见 KvStore::named_tree）
const ANCHOR_TREE: &str = "anchors";
const ANCHOR_KEY_PREFIX: &str = "sync_anchor:";

/// 单个数据源的锚点记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub source_type: String,
    /// 宿主健康库的游标字节，原样保存
    pub cursor: AnchorToken,
    /// 最近一次推进的时间戳（unix 秒）
    pub advanced_at: i64,
}

/// 锚点存储
#[derive(Debug, Clone)]
pub struct AnchorStore {
    tree: Tree,
}

impl AnchorStore {
    /// 在当前用户的命名空间内打开锚点存储
    pub async fn open(kv: &KvStore) -> Result<Self> {
        let tree = kv.named_tree(ANCHOR_TREE).await?;
        Ok(Self { tree })
    }

    fn key(source_type: &str) -> Vec<u8> {
        format!("{}{}", ANCHOR_KEY_PREFIX, source_type).into_bytes()
    }

    /// 读取某数据源的当前锚点；损坏的记录会被清除并返回 None
    pub fn get(&self, source_type: &str) -> Result<Option<AnchorToken>> {
        let key = Self::key(source_type);
        let bytes = self
            .tree
            .get(&key)
            .map_err(|e| HealthSyncError::KvStore(format!("读取锚点失败: {}", e)))?;

        match bytes {
            Some(bytes) => match bincode::deserialize::<AnchorRecord>(&bytes) {
                Ok(record) => Ok(Some(record.cursor)),
                Err(e) => {
                    warn!("⚠️ 锚点记录损坏，按无锚点处理: source={}, error={}", source_type, e);
                    self.tree
                        .remove(&key)
                        .map_err(|e| HealthSyncError::KvStore(format!("清除损坏锚点失败: {}", e)))?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// 推进某数据源的锚点
    ///
    /// 调用方保证此时本批样本已送达服务端或已持久入队。
    pub fn advance(&self, source_type: &str, cursor: AnchorToken) -> Result<()> {
        let record = AnchorRecord {
            source_type: source_type.to_string(),
            cursor,
            advanced_at: Utc::now().timestamp(),
        };
        let bytes = bincode::serialize(&record)
            .map_err(|e| HealthSyncError::Serialization(format!("编码锚点记录失败: {}", e)))?;

        self.tree
            .insert(Self::key(source_type), bytes)
            .map_err(|e| HealthSyncError::KvStore(format!("写入锚点失败: {}", e)))?;

        debug!("⚓ 锚点已推进: source={}", source_type);
        Ok(())
    }

    /// 清除某数据源的锚点，返回是否确实存在过
    pub fn clear(&self, source_type: &str) -> Result<bool> {
        let removed = self
            .tree
            .remove(Self::key(source_type))
            .map_err(|e| HealthSyncError::KvStore(format!("清除锚点失败: {}", e)))?;
        Ok(removed.is_some())
    }

    /// 清除所有数据源的锚点（全量重同步入口），返回清除数量
    pub fn clear_all(&self) -> Result<usize> {
        let mut keys = Vec::new();
        for entry in self.tree.scan_prefix(ANCHOR_KEY_PREFIX.as_bytes()) {
            let (key, _) =
                entry.map_err(|e| HealthSyncError::KvStore(format!("扫描锚点失败: {}", e)))?;
            keys.push(key);
        }

        for key in &keys {
            self.tree
                .remove(key)
                .map_err(|e| HealthSyncError::KvStore(format!("清除锚点失败: {}", e)))?;
        }

        if !keys.is_empty() {
            info!("🧹 已清除全部锚点: count={}", keys.len());
        }
        Ok(keys.len())
    }

    /// 列出所有锚点记录（诊断用）
    pub fn list(&self) -> Result<Vec<AnchorRecord>> {
        let mut records = Vec::new();
        for entry in self.tree.scan_prefix(ANCHOR_KEY_PREFIX.as_bytes()) {
            let (_, bytes) =
                entry.map_err(|e| HealthSyncError::KvStore(format!("扫描锚点失败: {}", e)))?;
            if let Ok(record) = bincode::deserialize::<AnchorRecord>(&bytes) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
