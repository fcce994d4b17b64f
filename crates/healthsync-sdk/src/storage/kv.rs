//! KV 存储 - 同步状态与锚点的落地层（sled）
//!
//! 队列库管批次，这里管其余的一切小状态：
//! - 同步开关、最近同步时间等标量（JSON 编码，按用户 Tree 隔离）
//! - 锚点存储所需的命名 Tree 出借（自管编码的组件直接拿 Tree）
//!
//! 多账号设备上同一 sled 库按 `user_{uid}` / `user_{uid}_{name}`
//! 命名 Tree 切分，切换用户不重开库。

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tokio::sync::RwLock;

use crate::error::{HealthSyncError, Result};
use crate::storage::KvStats;

/// 进程重启瞬间旧实例可能还握着 sled 的文件锁，重试带指数退避
const OPEN_RETRIES: u32 = 8;
const OPEN_BACKOFF_BASE_MS: u64 = 300;

/// 每个键值对的粗略体积估算（sled Tree 不提供精确值）
const APPROX_ENTRY_BYTES: u64 = 256;

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    db: Db,
    /// 已打开的用户主 Tree 缓存
    user_trees: RwLock<HashMap<String, Tree>>,
    /// 当前绑定的用户 ID
    current_user: RwLock<Option<String>>,
}

impl KvStore {
    /// 在 `base_path/kv` 打开（不存在则创建）存储
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| HealthSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        let db = open_with_lock_retry(&kv_path).await?;

        Ok(Self {
            db,
            user_trees: RwLock::new(HashMap::new()),
            current_user: RwLock::new(None),
        })
    }

    /// 绑定当前用户；首次见到该用户时顺带打开其主 Tree
    pub async fn switch_user(&self, uid: &str) -> Result<()> {
        {
            let mut trees = self.user_trees.write().await;
            if !trees.contains_key(uid) {
                let tree = self
                    .db
                    .open_tree(format!("user_{}", uid))
                    .map_err(|e| HealthSyncError::KvStore(format!("打开用户 Tree 失败: {}", e)))?;
                trees.insert(uid.to_string(), tree);
                tracing::info!("用户 KV Tree 就绪: {}", uid);
            }
        }

        *self.current_user.write().await = Some(uid.to_string());
        Ok(())
    }

    /// 出借一棵命名 Tree（锚点存储等自管编码的组件使用）
    ///
    /// Tree 名称按当前用户加前缀隔离。
    pub async fn named_tree(&self, name: &str) -> Result<Tree> {
        let uid = self.require_user().await?;
        self.db
            .open_tree(format!("user_{}_{}", uid, name))
            .map_err(|e| HealthSyncError::KvStore(format!("打开命名 Tree 失败: {}: {}", name, e)))
    }

    /// 写入键值（JSON 编码）
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.current_tree().await?;
        let bytes = serde_json::to_vec(value)
            .map_err(|e| HealthSyncError::Serialization(format!("序列化值失败: {}", e)))?;
        tree.insert(key.as_ref(), bytes)
            .map_err(|e| kv_err("写入", key.as_ref(), e))?;
        Ok(())
    }

    /// 读取键值，不存在返回 None
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.current_tree().await?;
        let Some(bytes) = tree
            .get(key.as_ref())
            .map_err(|e| kv_err("读取", key.as_ref(), e))?
        else {
            return Ok(None);
        };

        let value = serde_json::from_slice(&bytes).map_err(|e| {
            HealthSyncError::Serialization(format!(
                "反序列化值失败: key={}: {}",
                String::from_utf8_lossy(key.as_ref()),
                e
            ))
        })?;
        Ok(Some(value))
    }

    /// 删除键，返回被删的原始字节
    pub async fn delete<K>(&self, key: K) -> Result<Option<Vec<u8>>>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await?;
        let removed = tree
            .remove(key.as_ref())
            .map_err(|e| kv_err("删除", key.as_ref(), e))?;
        Ok(removed.map(|v| v.to_vec()))
    }

    /// 键是否存在
    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await?;
        tree.contains_key(key.as_ref())
            .map_err(|e| kv_err("查询", key.as_ref(), e))
    }

    /// 按前缀扫描当前用户的键值对
    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.current_tree().await?;
        let mut results = Vec::new();
        for entry in tree.scan_prefix(prefix) {
            let (key, bytes) = entry.map_err(|e| kv_err("扫描", prefix, e))?;
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| HealthSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
            results.push((key.to_vec(), value));
        }
        Ok(results)
    }

    /// 将缓冲数据刷入磁盘（进入后台 / 关停前调用）
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| HealthSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    /// 当前用户的存储统计（诊断接口用）
    pub async fn get_stats(&self) -> Result<KvStats> {
        let uid = self.require_user().await?;
        let tree = self.current_tree().await?;
        let key_count = tree.len() as u64;

        // 聚合该用户的全部 Tree：主 Tree + 各命名 Tree
        let main_name = format!("user_{}", uid);
        let named_prefix = format!("user_{}_", uid);
        let mut total_keys = 0u64;
        for name in self.db.tree_names() {
            let name_str = String::from_utf8_lossy(&name);
            if name_str == main_name || name_str.starts_with(&named_prefix) {
                let t = self
                    .db
                    .open_tree(&name)
                    .map_err(|e| HealthSyncError::KvStore(format!("打开 Tree 失败: {}", e)))?;
                total_keys += t.len() as u64;
            }
        }

        let storage_size = self
            .db
            .size_on_disk()
            .map_err(|e| HealthSyncError::KvStore(format!("读取磁盘占用失败: {}", e)))?;

        Ok(KvStats {
            tree_size: key_count * APPROX_ENTRY_BYTES,
            key_count,
            total_keys,
            storage_size,
        })
    }

    async fn require_user(&self) -> Result<String> {
        self.current_user
            .read()
            .await
            .clone()
            .ok_or_else(|| HealthSyncError::NotInitialized("KV 存储尚未绑定用户".to_string()))
    }

    async fn current_tree(&self) -> Result<Tree> {
        let uid = self.require_user().await?;
        let trees = self.user_trees.read().await;
        trees
            .get(&uid)
            .cloned()
            .ok_or_else(|| HealthSyncError::KvStore(format!("用户 Tree 不存在: {}", uid)))
    }
}

fn kv_err(op: &str, key: &[u8], e: sled::Error) -> HealthSyncError {
    HealthSyncError::KvStore(format!(
        "{}键失败: key={}: {}",
        op,
        String::from_utf8_lossy(key),
        e
    ))
}

/// 带退避的 sled 打开：只对文件锁冲突重试，其他错误立刻返回
async fn open_with_lock_retry(path: &Path) -> Result<Db> {
    let mut attempt = 0u32;
    loop {
        match sled::open(path) {
            Ok(db) => return Ok(db),
            Err(e) if is_lock_contention(&e) && attempt + 1 < OPEN_RETRIES => {
                let delay = OPEN_BACKOFF_BASE_MS << attempt;
                tracing::debug!("sled 文件锁被占用，{}ms 后重试: {}", delay, e);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(HealthSyncError::KvStore(format!(
                    "打开 sled 数据库失败: {}",
                    e
                )))
            }
        }
    }
}

fn is_lock_contention(e: &sled::Error) -> bool {
    let msg = e.to_string();
    msg.contains("could not acquire lock")
        || msg.contains("Resource temporarily unavailable")
        || msg.contains("WouldBlock")
}

/// 同步状态键
pub mod keys {
    /// 最近一次成功同步的时间戳（unix 秒）
    pub const LAST_SYNC_AT: &str = "sync_status:last_sync_at";
    /// 后台同步是否已由用户启用（跨重启恢复激活态）
    pub const SYNC_ENABLED: &str = "sync_status:enabled";
    /// 最近一次全量重同步的时间戳
    pub const LAST_FULL_RESYNC: &str = "sync_status:last_full_resync";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();
        store.switch_user("test_user").await.unwrap();

        let test_data = json!({
            "name": "test",
            "value": 123
        });

        store.set("test_key", &test_data).await.unwrap();
        let retrieved: serde_json::Value = store.get("test_key").await.unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        assert!(store.exists("test_key").await.unwrap());
        assert!(!store.exists("non_existent_key").await.unwrap());

        store.delete("test_key").await.unwrap();
        let deleted: Option<serde_json::Value> = store.get("test_key").await.unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_kv_store_requires_user_binding() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        // 未 switch_user 前任何读写都应失败
        let result = store.get::<_, i64>(keys::LAST_SYNC_AT).await;
        assert!(matches!(result, Err(HealthSyncError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_kv_store_user_isolation() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        store.switch_user("user_a").await.unwrap();
        store.set(keys::LAST_SYNC_AT, &1_700_000_000i64).await.unwrap();

        // 切到另一个用户后应看不到前者的状态
        store.switch_user("user_b").await.unwrap();
        let other: Option<i64> = store.get(keys::LAST_SYNC_AT).await.unwrap();
        assert!(other.is_none());

        // 切回来数据仍在
        store.switch_user("user_a").await.unwrap();
        let back: Option<i64> = store.get(keys::LAST_SYNC_AT).await.unwrap();
        assert_eq!(back, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_kv_store_named_tree() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        store.switch_user("test_user").await.unwrap();

        let tree = store.named_tree("anchors").await.unwrap();
        tree.insert(b"k", b"v".to_vec()).unwrap();

        // 主 Tree 不应看到命名 Tree 的键
        assert!(!store.exists("k").await.unwrap());

        let again = store.named_tree("anchors").await.unwrap();
        assert_eq!(again.get(b"k").unwrap().map(|v| v.to_vec()), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_kv_store_prefix_scan() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        store.switch_user("test_user").await.unwrap();

        store.set("sync_status:a", &json!(1)).await.unwrap();
        store.set("sync_status:b", &json!(2)).await.unwrap();
        store.set("other:c", &json!(3)).await.unwrap();

        let results: Vec<(Vec<u8>, serde_json::Value)> =
            store.scan_prefix(b"sync_status:").await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_kv_stats_aggregate_all_user_trees() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        store.switch_user("u1").await.unwrap();
        store.set("a", &json!(1)).await.unwrap();
        let tree = store.named_tree("anchors").await.unwrap();
        tree.insert(b"x", b"y".to_vec()).unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.key_count, 1);
        assert_eq!(stats.total_keys, 2);
    }
}
