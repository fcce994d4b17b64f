//! 基础同步流程演示
//!
//! 用一个模拟的宿主健康数据源走通完整管道：
//! 授权 → 启用同步 → 实时变更 → 前台对账 → 后台执行窗口 → 诊断输出
//!
//! 不需要真实服务端：上传失败的批次会落进持久队列等待重试，
//! 正好演示离线优先的行为。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use healthsync_sdk::{
    sources, FetchDelta, HealthDataSource, HealthSample, HealthSyncClient, HealthSyncConfig,
    Result, SlotKind,
};

/// 模拟宿主健康库：每次增量查询产出 3 条心率样本
struct SimulatedSource {
    live_tx: broadcast::Sender<String>,
    next_uuid: AtomicU64,
}

impl SimulatedSource {
    fn new() -> (Arc<Self>, broadcast::Sender<String>) {
        let (live_tx, _) = broadcast::channel(16);
        let source = Arc::new(Self {
            live_tx: live_tx.clone(),
            next_uuid: AtomicU64::new(1),
        });
        (source, live_tx)
    }

    fn make_sample(&self, source_type: &str) -> HealthSample {
        let n = self.next_uuid.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        HealthSample {
            uuid: format!("demo-{:06}", n),
            sample_type: source_type.to_string(),
            value: Some(60.0 + (n % 40) as f64),
            unit: Some("count/min".to_string()),
            start_date: now,
            end_date: now,
            source_name: Some("basic_sync_demo".to_string()),
            metadata: None,
            series_data: None,
            s3_key: None,
        }
    }
}

#[async_trait]
impl HealthDataSource for SimulatedSource {
    async fn authorize(&self, source_types: &[String]) -> Result<()> {
        println!("  (宿主) 授权读取: {:?}", source_types);
        Ok(())
    }

    async fn incremental_fetch(
        &self,
        source_type: &str,
        _anchor: Option<Vec<u8>>,
    ) -> Result<FetchDelta> {
        let added: Vec<HealthSample> = (0..3).map(|_| self.make_sample(source_type)).collect();
        let new_anchor = self.next_uuid.load(Ordering::SeqCst).to_le_bytes().to_vec();
        Ok(FetchDelta {
            added,
            deleted_ids: vec![],
            new_anchor,
        })
    }

    fn live_changes(&self) -> broadcast::Receiver<String> {
        self.live_tx.subscribe()
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("========================================");
    println!("HealthSync 基础同步演示");
    println!("========================================\n");

    // === 1. 初始化 SDK ===

    let (source, live_tx) = SimulatedSource::new();

    let config = HealthSyncConfig::builder()
        .data_dir("/tmp/healthsync_demo")
        .api_url("http://127.0.0.1:8080/app")
        .monitored_sources([sources::HEART_RATE, sources::STEPS])
        .build();

    let client = HealthSyncClient::initialize("demo_user", source, config).await?;
    println!("✅ SDK 初始化完成\n");

    // === 2. 授权并启用同步 ===

    println!("🔐 请求健康数据读取授权...");
    client.request_authorization().await?;

    client.set_sync_enabled(true).await?;
    println!("✅ 同步已启用\n");

    // === 3. 实时变更 ===

    println!("========================================");
    println!("实时变更");
    println!("========================================\n");

    println!("📡 宿主广播一次心率变更...");
    let _ = live_tx.send(sources::HEART_RATE.to_string());
    sleep(Duration::from_millis(300)).await;

    // === 4. 前台对账 ===

    println!("\n========================================");
    println!("前台对账");
    println!("========================================\n");

    match client.sync_now().await {
        Ok(report) => {
            println!("✅ 前台对账完成:");
            println!("  认领批次:   {}", report.claimed);
            println!("  上送成功:   {}", report.uploaded_items);
            println!("  上送失败:   {}", report.failed_items);
            println!("  补查入站:   {}", report.recheck_uploaded + report.recheck_queued);
        }
        Err(e) => println!("❌ 前台对账失败: {}", e),
    }

    // === 5. 后台执行窗口（带到期令牌） ===

    println!("\n========================================");
    println!("短执行窗口");
    println!("========================================\n");

    let expiration = CancellationToken::new();
    let guard = expiration.clone();
    tokio::spawn(async move {
        // 模拟 OS 在 5 秒后收回执行窗口
        sleep(Duration::from_secs(5)).await;
        guard.cancel();
    });

    match client.run_slot(SlotKind::Short, expiration).await {
        Ok(report) => {
            println!("✅ 短窗口结束: 认领 {} / 成功 {} / 到期中断 {}",
                     report.claimed, report.uploaded_items, report.expired);
        }
        Err(e) => println!("❌ 短窗口失败: {}", e),
    }

    // === 6. 诊断输出 ===

    println!("\n========================================");
    println!("诊断");
    println!("========================================\n");

    let status = client.sync_status().await?;
    println!("同步状态:");
    println!("  启用:       {}", status.enabled);
    println!("  阶段:       {:?}", status.phase);
    println!("  待送批次:   {}", status.queued_batches);
    if let Some(err) = &status.last_error {
        println!("  最近错误:   {}", err);
    }

    let report = client.storage_report().await?;
    println!("\n本地存储:");
    println!("  队列总批次: {}", report.queue.total());
    println!("  KV 键数:    {}", report.kv.key_count);

    let snapshot = client.health_snapshot();
    println!("\n同步健康度:");
    println!("  分层:       {:?}", snapshot.tier);
    println!("  成功率:     {:.1}%", snapshot.success_rate * 100.0);

    let recommendations = client.recommendations().await?;
    if recommendations.is_empty() {
        println!("\n💡 暂无调优建议");
    } else {
        println!("\n💡 调优建议:");
        for r in &recommendations {
            println!("  - {}", r);
        }
    }

    // === 7. 清理 ===

    println!("\n========================================");
    println!("清理");
    println!("========================================\n");

    println!("🛑 正在关闭 SDK...");
    client.shutdown().await?;
    println!("✅ 已关闭");

    println!("\n✅ 演示完成！");

    Ok(())
}
