//! 队列数据库 Actor - 单线程数据库访问模型
//!
//! 核心设计：
//! - SQLite Connection 永远只在一个专用线程中
//! - 所有队列操作通过 channel 发送命令
//! - 无跨线程使用，无锁竞争
//! - 出队认领 + 状态翻转在同一个事务内完成

use crossbeam_channel::{unbounded, Receiver, Sender};
use rusqlite::{params, Connection};
use std::path::Path;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::error::{HealthSyncError, Result};
use crate::storage::migrate;
use crate::storage::queue::retry_policy::RetryPolicy;
use crate::storage::queue::upload_task::{QueuedUpload, UploadStatus};
use crate::storage::queue::QueueStatistics;

/// 出队查询：pending 行直接可出队，failed 行需满足重试上限与退避窗口，
/// 按调度评分降序、入队时间升序排列。
///
/// 退避用移位代替乘方（SQLite 无 POWER），位移量封顶防止溢出归零。
const DEQUEUE_SQL: &str = r#"
    SELECT id, user_id, source_type, sample_data, anchor_data,
           created_at, retry_count, last_attempt, status, priority
    FROM upload_queue
    WHERE status = 'pending'
       OR (status = 'failed'
           AND retry_count < :max_retries
           AND :now >= COALESCE(last_attempt, 0)
                       + MIN(:base_delay << MIN(retry_count, 32), :max_delay))
    ORDER BY (priority * 1000
              + MIN(MAX((:now - created_at) / 60, 0), 500)
              - retry_count * 50) DESC,
             created_at ASC,
             id ASC
    LIMIT :limit
"#;

/// 队列数据库命令
pub enum QueueDbCommand {
    /// 入队一个批次
    Enqueue {
        user_id: String,
        source_type: String,
        sample_data: String,
        anchor_data: Option<Vec<u8>>,
        priority: u8,
        created_at: i64,
        respond_to: tokio::sync::oneshot::Sender<Result<i64>>,
    },

    /// 出队可执行的批次（认领为 uploading）
    DequeueEligible {
        limit: u32,
        now: i64,
        policy: RetryPolicy,
        respond_to: tokio::sync::oneshot::Sender<Result<Vec<QueuedUpload>>>,
    },

    /// 标记上传成功（仅对 uploading 行生效）
    MarkUploaded {
        id: i64,
        respond_to: tokio::sync::oneshot::Sender<Result<bool>>,
    },

    /// 标记上传失败并累加重试计数（仅对 uploading 行生效）
    MarkFailed {
        id: i64,
        now: i64,
        respond_to: tokio::sync::oneshot::Sender<Result<bool>>,
    },

    /// 释放被认领但未实际尝试的行（uploading -> pending，不计重试）
    Release {
        id: i64,
        respond_to: tokio::sync::oneshot::Sender<Result<bool>>,
    },

    /// 按状态统计行数
    Statistics {
        respond_to: tokio::sync::oneshot::Sender<Result<QueueStatistics>>,
    },

    /// 清理早于 cutoff 入队的已上传行
    Reap {
        cutoff: i64,
        respond_to: tokio::sync::oneshot::Sender<Result<usize>>,
    },

    /// 停止 Actor
    Shutdown,
}

/// 队列数据库 Actor（运行在独立线程）
pub struct QueueDbActor {
    /// 唯一的数据库连接
    conn: Connection,
    /// 接收命令的 channel
    receiver: Receiver<QueueDbCommand>,
    /// 当前线程 ID（用于调试）
    thread_id: thread::ThreadId,
}

impl QueueDbActor {
    fn new(conn: Connection, receiver: Receiver<QueueDbCommand>) -> Self {
        let thread_id = thread::current().id();
        info!("🚀 [Thread {:?}] QueueDbActor 已启动", thread_id);

        Self {
            conn,
            receiver,
            thread_id,
        }
    }

    /// 运行 Actor 主循环
    fn run(mut self) {
        info!("🔄 [Thread {:?}] QueueDbActor 开始处理命令", self.thread_id);

        while let Ok(command) = self.receiver.recv() {
            match command {
                QueueDbCommand::Shutdown => {
                    info!("🛑 [Thread {:?}] QueueDbActor 收到停止信号", self.thread_id);
                    break;
                }

                QueueDbCommand::Enqueue {
                    user_id,
                    source_type,
                    sample_data,
                    anchor_data,
                    priority,
                    created_at,
                    respond_to,
                } => {
                    let result = self.handle_enqueue(
                        &user_id,
                        &source_type,
                        &sample_data,
                        anchor_data.as_deref(),
                        priority,
                        created_at,
                    );
                    let _ = respond_to.send(result);
                }

                QueueDbCommand::DequeueEligible {
                    limit,
                    now,
                    policy,
                    respond_to,
                } => {
                    let result = self.handle_dequeue_eligible(limit, now, &policy);
                    let _ = respond_to.send(result);
                }

                QueueDbCommand::MarkUploaded { id, respond_to } => {
                    let result = self.handle_mark_uploaded(id);
                    let _ = respond_to.send(result);
                }

                QueueDbCommand::MarkFailed {
                    id,
                    now,
                    respond_to,
                } => {
                    let result = self.handle_mark_failed(id, now);
                    let _ = respond_to.send(result);
                }

                QueueDbCommand::Release { id, respond_to } => {
                    let result = self.handle_release(id);
                    let _ = respond_to.send(result);
                }

                QueueDbCommand::Statistics { respond_to } => {
                    let result = self.handle_statistics();
                    let _ = respond_to.send(result);
                }

                QueueDbCommand::Reap { cutoff, respond_to } => {
                    let result = self.handle_reap(cutoff);
                    let _ = respond_to.send(result);
                }
            }
        }

        info!("✅ [Thread {:?}] QueueDbActor 已停止", self.thread_id);
    }

    /// 处理：入队
    fn handle_enqueue(
        &mut self,
        user_id: &str,
        source_type: &str,
        sample_data: &str,
        anchor_data: Option<&[u8]>,
        priority: u8,
        created_at: i64,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO upload_queue
                (user_id, source_type, sample_data, anchor_data, created_at, retry_count, status, priority)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending', ?6)
            "#,
            params![user_id, source_type, sample_data, anchor_data, created_at, priority],
        )?;

        let id = self.conn.last_insert_rowid();
        debug!(
            "📥 [QueueDbActor] 入队: id={}, user={}, source={}, priority={}",
            id, user_id, source_type, priority
        );
        Ok(id)
    }

    /// 处理：出队可执行批次
    ///
    /// 在同一事务内：选出可执行行，剔除无法解码的脏行，
    /// 把选中行翻转为 uploading 并记录认领时间。
    fn handle_dequeue_eligible(
        &mut self,
        limit: u32,
        now: i64,
        policy: &RetryPolicy,
    ) -> Result<Vec<QueuedUpload>> {
        struct RawRow {
            id: i64,
            user_id: String,
            source_type: String,
            sample_data: String,
            anchor_data: Option<Vec<u8>>,
            created_at: i64,
            retry_count: i64,
            last_attempt: Option<i64>,
            status: String,
            priority: i64,
        }

        let tx = self.conn.transaction()?;

        let raw_rows: Vec<RawRow> = {
            let mut stmt = tx.prepare_cached(DEQUEUE_SQL)?;
            let rows = stmt.query_map(
                rusqlite::named_params! {
                    ":max_retries": policy.max_retries,
                    ":now": now,
                    ":base_delay": policy.base_delay_secs as i64,
                    ":max_delay": policy.max_delay_secs as i64,
                    ":limit": limit,
                },
                |row| {
                    Ok(RawRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        source_type: row.get(2)?,
                        sample_data: row.get(3)?,
                        anchor_data: row.get(4)?,
                        created_at: row.get(5)?,
                        retry_count: row.get(6)?,
                        last_attempt: row.get(7)?,
                        status: row.get(8)?,
                        priority: row.get(9)?,
                    })
                },
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(raw_rows.len());
        let mut malformed: Vec<i64> = Vec::new();

        for raw in raw_rows {
            let samples = match serde_json::from_str(&raw.sample_data) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(
                        "⚠️ [QueueDbActor] 样本数据无法解码，删除脏行: id={}, error={}",
                        raw.id, e
                    );
                    malformed.push(raw.id);
                    continue;
                }
            };
            let status = match UploadStatus::from_str(&raw.status) {
                Some(status) => status,
                None => {
                    warn!(
                        "⚠️ [QueueDbActor] 未知状态值，删除脏行: id={}, status={}",
                        raw.id, raw.status
                    );
                    malformed.push(raw.id);
                    continue;
                }
            };

            claimed.push(QueuedUpload {
                id: raw.id,
                user_id: raw.user_id,
                source_type: raw.source_type,
                samples,
                anchor_snapshot: raw.anchor_data,
                created_at: raw.created_at,
                retry_count: raw.retry_count.max(0) as u32,
                last_attempt: raw.last_attempt,
                status,
                priority: (raw.priority.clamp(0, u8::MAX as i64) as u8).into(),
            });
        }

        for id in &malformed {
            tx.execute("DELETE FROM upload_queue WHERE id = ?1", params![id])?;
        }

        for task in &mut claimed {
            tx.execute(
                "UPDATE upload_queue SET status = 'uploading', last_attempt = ?1 WHERE id = ?2",
                params![now, task.id],
            )?;
            task.status = UploadStatus::Uploading;
            task.last_attempt = Some(now);
        }

        tx.commit()?;

        debug!(
            "📤 [QueueDbActor] 出队: 认领 {} 条, 清除脏行 {} 条 (limit={})",
            claimed.len(),
            malformed.len(),
            limit
        );
        Ok(claimed)
    }

    /// 处理：标记上传成功
    ///
    /// 只有 uploading 状态的行会被翻转，重复调用返回 false，保证幂等。
    fn handle_mark_uploaded(&mut self, id: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE upload_queue SET status = 'uploaded' WHERE id = ?1 AND status = 'uploading'",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// 处理：标记上传失败
    fn handle_mark_failed(&mut self, id: i64, now: i64) -> Result<bool> {
        let affected = self.conn.execute(
            r#"
            UPDATE upload_queue
            SET status = 'failed', retry_count = retry_count + 1, last_attempt = ?1
            WHERE id = ?2 AND status = 'uploading'
            "#,
            params![now, id],
        )?;
        Ok(affected > 0)
    }

    /// 处理：释放未尝试的认领行（不计重试）
    fn handle_release(&mut self, id: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE upload_queue SET status = 'pending' WHERE id = ?1 AND status = 'uploading'",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// 处理：按状态统计
    fn handle_statistics(&mut self) -> Result<QueueStatistics> {
        let mut stats = QueueStatistics::default();

        let mut stmt = self
            .conn
            .prepare_cached("SELECT status, COUNT(*) FROM upload_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            let count = count.max(0) as u64;
            match UploadStatus::from_str(&status) {
                Some(UploadStatus::Pending) => stats.pending = count,
                Some(UploadStatus::Uploading) => stats.uploading = count,
                Some(UploadStatus::Uploaded) => stats.uploaded = count,
                Some(UploadStatus::Failed) => stats.failed = count,
                None => stats.unknown += count,
            }
        }

        Ok(stats)
    }

    /// 处理：清理已上传的历史行
    fn handle_reap(&mut self, cutoff: i64) -> Result<usize> {
        let affected = self.conn.execute(
            "DELETE FROM upload_queue WHERE status = 'uploaded' AND created_at <= ?1",
            params![cutoff],
        )?;

        if affected > 0 {
            info!("🧹 [QueueDbActor] 清理已上传批次: {} 条", affected);
        }
        Ok(affected)
    }
}

/// 队列数据库 Actor 句柄（用于异步调用）
#[derive(Clone)]
pub struct QueueDbHandle {
    sender: Sender<QueueDbCommand>,
}

impl std::fmt::Debug for QueueDbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDbHandle")
            .field("sender", &"<channel>")
            .finish()
    }
}

impl QueueDbHandle {
    /// 打开队列数据库并启动 Actor
    ///
    /// 在调用线程完成打开、迁移和孤儿行回收（上次进程退出时卡在
    /// uploading 的行回到 pending），随后把连接移交给专用线程。
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(db_path).map_err(|e| {
            error!("❌ [QueueDbHandle] 打开队列数据库失败: {}", e);
            HealthSyncError::Database(format!("打开队列数据库失败: {}", e))
        })?;

        migrate::init_db(&mut conn)?;

        // 上次运行中断时卡在 uploading 的行，重新回到 pending
        let reclaimed = conn.execute(
            "UPDATE upload_queue SET status = 'pending' WHERE status = 'uploading'",
            [],
        )?;
        if reclaimed > 0 {
            info!("♻️ [QueueDbHandle] 回收中断的上传任务: {} 条", reclaimed);
        }

        let (sender, receiver) = unbounded();

        thread::Builder::new()
            .name("queue-db-actor".to_string())
            .spawn(move || {
                let actor = QueueDbActor::new(conn, receiver);
                actor.run();
            })
            .map_err(|e| HealthSyncError::Other(format!("无法启动队列 DB Actor 线程: {}", e)))?;

        info!("✅ [QueueDbHandle] 队列数据库已就绪: {}", db_path.display());
        Ok(Self { sender })
    }

    /// 入队一个批次
    pub async fn enqueue(
        &self,
        user_id: String,
        source_type: String,
        sample_data: String,
        anchor_data: Option<Vec<u8>>,
        priority: u8,
        created_at: i64,
    ) -> Result<i64> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.sender
            .send(QueueDbCommand::Enqueue {
                user_id,
                source_type,
                sample_data,
                anchor_data,
                priority,
                created_at,
                respond_to: tx,
            })
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 已停止".to_string()))?;

        rx.await
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 响应失败".to_string()))?
    }

    /// 出队可执行批次
    pub async fn dequeue_eligible(
        &self,
        limit: u32,
        now: i64,
        policy: RetryPolicy,
    ) -> Result<Vec<QueuedUpload>> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.sender
            .send(QueueDbCommand::DequeueEligible {
                limit,
                now,
                policy,
                respond_to: tx,
            })
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 已停止".to_string()))?;

        rx.await
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 响应失败".to_string()))?
    }

    /// 标记上传成功
    pub async fn mark_uploaded(&self, id: i64) -> Result<bool> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.sender
            .send(QueueDbCommand::MarkUploaded { id, respond_to: tx })
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 已停止".to_string()))?;

        rx.await
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 响应失败".to_string()))?
    }

    /// 标记上传失败
    pub async fn mark_failed(&self, id: i64, now: i64) -> Result<bool> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.sender
            .send(QueueDbCommand::MarkFailed {
                id,
                now,
                respond_to: tx,
            })
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 已停止".to_string()))?;

        rx.await
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 响应失败".to_string()))?
    }

    /// 释放未尝试的认领行
    pub async fn release(&self, id: i64) -> Result<bool> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.sender
            .send(QueueDbCommand::Release { id, respond_to: tx })
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 已停止".to_string()))?;

        rx.await
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 响应失败".to_string()))?
    }

    /// 按状态统计
    pub async fn statistics(&self) -> Result<QueueStatistics> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.sender
            .send(QueueDbCommand::Statistics { respond_to: tx })
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 已停止".to_string()))?;

        rx.await
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 响应失败".to_string()))?
    }

    /// 清理早于 cutoff 的已上传行
    pub async fn reap(&self, cutoff: i64) -> Result<usize> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.sender
            .send(QueueDbCommand::Reap {
                cutoff,
                respond_to: tx,
            })
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 已停止".to_string()))?;

        rx.await
            .map_err(|_| HealthSyncError::ShuttingDown("队列 DB Actor 响应失败".to_string()))?
    }

    /// 停止 Actor（幂等，Actor 已停止时静默忽略）
    pub fn shutdown(&self) {
        let _ = self.sender.send(QueueDbCommand::Shutdown);
    }
}
