//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后：
//! - 停止自动保存并把缓存中的脏数据写回桶
//! - 断开与 Hub 的连接并清空传输层的回调（打破回调与会话之间的循环引用）

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::ThingValueStore;
use crate::transport::HubTransport;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 运行中出现无法恢复的错误
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 子任务（自动保存、SSE 读取等）使用的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 触发关闭；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut r) = self.reason.lock() {
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，每个任务有独立超时
pub struct ShutdownCoordinator {
    manager: ShutdownManager,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: ShutdownManager) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = std::time::Duration::from_secs(self.timeout_secs);
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup task '{}' completed", name),
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!(
                    "Cleanup task '{}' timed out after {}s",
                    name,
                    self.timeout_secs
                ),
            }
        }
    }

    pub fn manager(&self) -> &ShutdownManager {
        &self.manager
    }
}

/// 把缓存中尚未落盘的 Thing 值写回桶
pub struct ValueStoreCleanup {
    store: Arc<ThingValueStore>,
}

impl ValueStoreCleanup {
    pub fn new(store: Arc<ThingValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ValueStoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.save_changes()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ThingValueStore"
    }
}

/// 断开传输并清空回调
pub struct TransportCleanup {
    transport: Arc<dyn HubTransport>,
}

impl TransportCleanup {
    pub fn new(transport: Arc<dyn HubTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for TransportCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.transport.disconnect().await;
        self.transport.shutdown();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "HubTransport"
    }
}

/// 运行主任务直到其结束或收到关闭信号，然后执行清理
pub async fn run_until_shutdown<F>(coordinator: &ShutdownCoordinator, app: F)
where
    F: Future<Output = ()>,
{
    let manager = coordinator.manager().clone();
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("Application finished normally"),
        _ = manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received: {:?}", manager.reason());
        }
    }

    coordinator.run_cleanup().await;
}

/// 等待后台任务结束；任务 panic 或被中止时记录警告并返回 false
pub async fn join_background(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(task = name, "Background task failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::store::{Bucket, MemoryBucket};
    use crate::things::ThingMessage;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);

        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    struct CountingCleanup {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for CountingCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Counting"
        }
    }

    #[tokio::test]
    async fn test_run_until_shutdown_runs_cleanup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut coordinator = ShutdownCoordinator::new(ShutdownManager::new()).with_timeout(1);
        coordinator.register(CountingCleanup {
            calls: calls.clone(),
        });

        run_until_shutdown(&coordinator, async {}).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_value_store_cleanup_flushes_changes() {
        let bucket = Arc::new(MemoryBucket::new());
        let store = Arc::new(ThingValueStore::new(bucket.clone()));
        store.handle_add_value(ThingMessage::event("a", "t", "temp", "22", 1000));

        ValueStoreCleanup::new(store).cleanup().await.unwrap();
        assert!(bucket.get("a/t").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_join_background_reports_panicked_task() {
        let ok = tokio::spawn(async {});
        assert!(join_background("ok", ok).await);

        let panicked = tokio::spawn(async { panic!("autosave blew up") });
        assert!(!join_background("autosave", panicked).await);

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(!join_background("aborted", aborted).await);
    }
}
