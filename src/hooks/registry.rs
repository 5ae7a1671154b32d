//! Hook 注册表

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use super::types::{HookMetadata, NotifyEvent, OfflineNotifyHook};

struct RegistryEntry {
    metadata: HookMetadata,
    handler: Arc<dyn OfflineNotifyHook>,
}

impl Clone for RegistryEntry {
    fn clone(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

/// 离线通知 Hook 注册表
///
/// Hook 在启动阶段显式注册（kind -> handler 的显式表，而非运行时扫描）
#[derive(Default)]
pub struct HookRegistry {
    offline_notify: RwLock<Vec<RegistryEntry>>,
}

impl HookRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register_offline_notify(
        &self,
        metadata: HookMetadata,
        handler: Arc<dyn OfflineNotifyHook>,
    ) {
        let mut guard = self.offline_notify.write().await;
        guard.push(RegistryEntry { metadata, handler });
        guard.sort_by(|a, b| a.metadata.priority.cmp(&b.metadata.priority));
    }

    /// 是否存在已注册的离线通知 Hook
    pub async fn has_offline_notify(&self) -> bool {
        !self.offline_notify.read().await.is_empty()
    }

    /// 执行全部离线通知 Hook
    ///
    /// 单个 Hook 的失败或超时记录日志后继续执行后续 Hook，
    /// 返回成功执行的 Hook 数量
    pub async fn offer_offline_notify(&self, event: &NotifyEvent) -> usize {
        let entries: Vec<RegistryEntry> = self.offline_notify.read().await.clone();
        let mut acked = 0usize;
        for entry in entries {
            let fut = entry.handler.handle(event);
            match tokio::time::timeout(entry.metadata.timeout, fut).await {
                Ok(Ok(())) => acked += 1,
                Ok(Err(err)) => {
                    warn!(hook = %entry.metadata.name, error = %err, "offline notify hook failed");
                }
                Err(_) => {
                    warn!(hook = %entry.metadata.name, "offline notify hook timed out");
                }
            }
        }
        acked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmberError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHook {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl OfflineNotifyHook for CountingHook {
        async fn handle(&self, _event: &NotifyEvent) -> crate::error::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EmberError::Internal("hook failure".into()))
            } else {
                Ok(())
            }
        }
    }

    fn event() -> NotifyEvent {
        NotifyEvent {
            notification: Bytes::from_static(b"n"),
            all_recipients: vec![1, 2],
            offline_recipients: vec![2],
        }
    }

    #[tokio::test]
    async fn test_failed_hook_does_not_block_others() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry
            .register_offline_notify(
                HookMetadata::new("failing").with_priority(0),
                Arc::new(CountingHook {
                    calls: Arc::clone(&calls),
                    fail: true,
                }),
            )
            .await;
        registry
            .register_offline_notify(
                HookMetadata::new("ok").with_priority(1),
                Arc::new(CountingHook {
                    calls: Arc::clone(&calls),
                    fail: false,
                }),
            )
            .await;

        let acked = registry.offer_offline_notify(&event()).await;
        assert_eq!(acked, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_not_fatal() {
        struct SlowHook;

        #[async_trait]
        impl OfflineNotifyHook for SlowHook {
            async fn handle(&self, _event: &NotifyEvent) -> crate::error::Result<()> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }

        let registry = HookRegistry::new();
        registry
            .register_offline_notify(
                HookMetadata::new("slow").with_timeout(Duration::from_millis(10)),
                Arc::new(SlowHook),
            )
            .await;

        let acked = registry.offer_offline_notify(&event()).await;
        assert_eq!(acked, 0);
    }
}
