//! SDK 生命周期管理
//!
//! 管理 App 前后台切换等一级生命周期事件，统一触发各模块的状态切换。

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// App 的两个一级状态切换方向
#[derive(Debug, Clone, Copy)]
enum Transition {
    Background,
    Foreground,
}

impl Transition {
    fn label(&self) -> &'static str {
        match self {
            Transition::Background => "后台",
            Transition::Foreground => "前台",
        }
    }
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// 已注册的 Hook 数量
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    pub async fn notify_background(&self) -> Result<()> {
        self.dispatch(Transition::Background).await
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        self.dispatch(Transition::Foreground).await
    }

    /// 按注册顺序走一遍全部 Hook；单个失败不阻断后续，最后上抛第一个错误
    async fn dispatch(&self, transition: Transition) -> Result<()> {
        info!("🔄 App 进入{}，通知 {} 个 Hook", transition.label(), self.hooks.len());

        let mut first_err = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            let outcome = match transition {
                Transition::Background => hook.on_background().await,
                Transition::Foreground => hook.on_foreground().await,
            };
            if let Err(e) = outcome {
                warn!("⚠️ Hook #{} {}切换失败: {}", index, transition.label(), e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!("✅ 所有模块{}切换完成", transition.label());
                Ok(())
            }
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

// 同步 Hook 模块（SDK 内部自动注册）
mod sync_hook;
pub use sync_hook::SyncLifecycleHook;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HealthSyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        background_calls: AtomicUsize,
        foreground_calls: AtomicUsize,
        fail: bool,
    }

    impl CountingHook {
        fn new(fail: bool) -> Self {
            Self {
                background_calls: AtomicUsize::new(0),
                foreground_calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_background(&self) -> Result<()> {
            self.background_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HealthSyncError::Other("hook down".to_string()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.foreground_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HealthSyncError::Other("hook down".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notify_runs_every_hook() {
        let first = Arc::new(CountingHook::new(false));
        let second = Arc::new(CountingHook::new(false));

        let mut manager = LifecycleManager::new();
        manager.register_hook(first.clone());
        manager.register_hook(second.clone());
        assert_eq!(manager.hook_count(), 2);

        manager.notify_foreground().await.unwrap();
        manager.notify_background().await.unwrap();

        assert_eq!(first.foreground_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.foreground_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.background_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.background_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_hook_does_not_block_the_rest() {
        let failing = Arc::new(CountingHook::new(true));
        let healthy = Arc::new(CountingHook::new(false));

        let mut manager = LifecycleManager::new();
        manager.register_hook(failing.clone());
        manager.register_hook(healthy.clone());

        // 第一个 Hook 失败，第二个仍然要被执行，错误向上传递
        let result = manager.notify_foreground().await;
        assert!(result.is_err());
        assert_eq!(failing.foreground_calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.foreground_calls.load(Ordering::SeqCst), 1);
    }
}
