//! 推送领域服务（出站中继）
//!
//! 把一份编码好的通知扇出到全部接收方：
//! 1. 对照会话注册表快照划分本地在线 / 本地缺席
//! 2. 本地会话逐个非阻塞写入，任一写入被接受即记“至少送达一个”
//! 3. 本地缺席者按集群归属查询分拣，打包成投递任务发往目标节点（带超时等待应答）
//! 4. 哪都不在线的接收方交给扩展 Hook 尽力处理，不阻塞也不影响返回值
//!
//! 扇出迭代只操作注册表快照，任何 I/O 都不持有注册表锁；
//! 中继自身持有的信封引用最后释放

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ember_im_core::hooks::{HookRegistry, NotifyEvent};
use ember_im_core::metrics::GatewayMetrics;
use tracing::{debug, warn};

use crate::domain::model::NotificationEnvelope;
use crate::domain::repository::ClusterDirectory;
use crate::infrastructure::cluster::{ClusterClient, ClusterDeliveryTask, LocalDeliveryExecutor};
use crate::infrastructure::registry::SessionRegistry;

/// 出站中继
pub struct PushDomainService {
    node_id: String,
    registry: Arc<SessionRegistry>,
    directory: Arc<dyn ClusterDirectory>,
    cluster: Option<Arc<ClusterClient>>,
    hooks: Arc<HookRegistry>,
    metrics: Arc<GatewayMetrics>,
}

impl PushDomainService {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<SessionRegistry>,
        directory: Arc<dyn ClusterDirectory>,
        cluster: Option<Arc<ClusterClient>>,
        hooks: Arc<HookRegistry>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            registry,
            directory,
            cluster,
            hooks,
            metrics,
        }
    }

    /// 本地扇出
    ///
    /// 对每个本地在线接收方的每台设备：克隆信封引用（计数 +1）并
    /// 非阻塞写入其出站队列；引用随帧进入队列，在写出或丢弃时释放。
    /// 返回（是否至少送达一个，本地缺席的接收方）
    pub fn deliver_local(
        &self,
        envelope: &NotificationEnvelope,
        recipients: &[i64],
    ) -> (bool, Vec<i64>) {
        let mut delivered = false;
        let mut absent = Vec::new();

        for &user_id in recipients {
            let sessions = self.registry.lookup(user_id);
            if sessions.is_empty() {
                absent.push(user_id);
                continue;
            }
            for session in sessions {
                let guard = envelope.clone();
                if session.try_push(envelope.payload(), Some(guard)) {
                    delivered = true;
                    self.metrics
                        .notifications_delivered_total
                        .with_label_values(&["local"])
                        .inc();
                } else {
                    warn!(
                        user_id = user_id,
                        device_type = %session.device_type(),
                        "Outbound queue full, delivery attempt dropped"
                    );
                }
            }
        }

        (delivered, absent)
    }

    /// 扇出一份通知，返回是否至少有一个接收方在本节点或互联节点收到
    pub async fn deliver(&self, envelope: NotificationEnvelope, recipients: &[i64]) -> bool {
        let (mut delivered, absent) = self.deliver_local(&envelope, recipients);

        let mut offline = Vec::new();
        if !absent.is_empty() {
            let mut per_node: HashMap<String, Vec<i64>> = HashMap::new();
            for user_id in absent {
                match self.directory.owner_of(user_id).await {
                    Some(node) if node != self.node_id => {
                        per_node.entry(node).or_default().push(user_id);
                    }
                    _ => offline.push(user_id),
                }
            }

            for (node, user_ids) in per_node {
                delivered |= self.deliver_remote(&envelope, &node, user_ids, &mut offline).await;
            }
        }

        if !offline.is_empty() {
            self.offer_hooks(&envelope, recipients, offline, delivered);
        }

        // 中继自身的引用最后释放
        drop(envelope);
        delivered
    }

    /// 向单个节点投递；失败的接收方并入 offline
    async fn deliver_remote(
        &self,
        envelope: &NotificationEnvelope,
        node: &str,
        user_ids: Vec<i64>,
        offline: &mut Vec<i64>,
    ) -> bool {
        let Some(client) = &self.cluster else {
            offline.extend(user_ids);
            return false;
        };

        let task = match ClusterDeliveryTask::new(envelope.payload(), user_ids.clone(), None) {
            Ok(task) => task,
            Err(err) => {
                warn!(node = %node, error = %err, "Delivery task not constructible");
                offline.extend(user_ids);
                return false;
            }
        };

        match client.deliver(node, &task).await {
            Ok(ack) if ack.delivered => {
                self.metrics
                    .notifications_delivered_total
                    .with_label_values(&["remote"])
                    .inc();
                debug!(node = %node, recipients = user_ids.len(), "Remote delivery acknowledged");
                true
            }
            Ok(_) => {
                offline.extend(user_ids);
                false
            }
            Err(err) => {
                warn!(node = %node, error = %err, "Cluster delivery failed");
                self.metrics.cluster_rpc_failure_total.inc();
                offline.extend(user_ids);
                false
            }
        }
    }

    /// 把离线接收方交给扩展 Hook（派生任务执行，绝不阻塞扇出返回）
    fn offer_hooks(
        &self,
        envelope: &NotificationEnvelope,
        recipients: &[i64],
        offline: Vec<i64>,
        delivered: bool,
    ) {
        if !delivered {
            self.metrics.notifications_offline_total.inc();
        }

        let hooks = Arc::clone(&self.hooks);
        let event = NotifyEvent {
            notification: envelope.payload(),
            all_recipients: recipients.to_vec(),
            offline_recipients: offline,
        };
        tokio::spawn(async move {
            if hooks.has_offline_notify().await {
                let acked = hooks.offer_offline_notify(&event).await;
                debug!(
                    offline = event.offline_recipients.len(),
                    acked = acked,
                    "Offline recipients offered to hooks"
                );
            }
        });
    }
}

/// 目标节点以本地扇出的身份消费投递任务
#[async_trait]
impl LocalDeliveryExecutor for PushDomainService {
    async fn execute(&self, task: &ClusterDeliveryTask) -> bool {
        let envelope = NotificationEnvelope::new(task.payload().clone());
        let (delivered, _absent) = self.deliver_local(&envelope, task.recipients());
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{
        DeviceType, ReleaseHook, Session, SessionCreateParams, SinkCommand,
    };
    use crate::domain::repository::StaticClusterDirectory;
    use bytes::Bytes;
    use ember_im_core::hooks::{HookMetadata, OfflineNotifyHook};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn relay(registry: Arc<SessionRegistry>) -> PushDomainService {
        PushDomainService::new(
            "node-a",
            registry,
            Arc::new(StaticClusterDirectory::new()),
            None,
            HookRegistry::new(),
            Arc::new(GatewayMetrics::new()),
        )
    }

    fn online(
        registry: &SessionRegistry,
        user_id: i64,
        device_type: DeviceType,
    ) -> mpsc::Receiver<SinkCommand> {
        let (tx, rx) = mpsc::channel(8);
        registry
            .create_or_join(Arc::new(Session::new(SessionCreateParams {
                user_id,
                device_type,
                conn_id: format!("conn-{}-{}", user_id, device_type),
                location: None,
                device_detail: None,
                sink: tx,
                cancel: CancellationToken::new(),
            })))
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_deliver_true_when_one_recipient_online() {
        let registry = Arc::new(SessionRegistry::new());
        let mut rx = online(&registry, 1, DeviceType::Desktop);
        let relay = relay(Arc::clone(&registry));

        let envelope = NotificationEnvelope::new(Bytes::from_static(b"hello"));
        // u1 在线、u2 缺席：至少送达一个 => true
        assert!(relay.deliver(envelope, &[1, 2]).await);

        match rx.recv().await.unwrap() {
            SinkCommand::Frame { bytes, guard } => {
                assert_eq!(&bytes[..], b"hello");
                assert!(guard.is_some());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deliver_false_when_nobody_online() {
        let registry = Arc::new(SessionRegistry::new());
        let relay = relay(registry);

        let envelope = NotificationEnvelope::new(Bytes::from_static(b"hello"));
        assert!(!relay.deliver(envelope, &[3]).await);
    }

    #[tokio::test]
    async fn test_fanout_covers_all_device_types() {
        let registry = Arc::new(SessionRegistry::new());
        let mut desktop_rx = online(&registry, 1, DeviceType::Desktop);
        let mut web_rx = online(&registry, 1, DeviceType::Web);
        let relay = relay(Arc::clone(&registry));

        let envelope = NotificationEnvelope::new(Bytes::from_static(b"n"));
        assert!(relay.deliver(envelope, &[1]).await);

        // 同一用户的每台设备都收到同一份字节
        let a = match desktop_rx.recv().await.unwrap() {
            SinkCommand::Frame { bytes, .. } => bytes,
            other => panic!("unexpected command: {:?}", other),
        };
        let b = match web_rx.recv().await.unwrap() {
            SinkCommand::Frame { bytes, .. } => bytes,
            other => panic!("unexpected command: {:?}", other),
        };
        assert_eq!(a, b);
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    struct CountingRelease {
        releases: AtomicUsize,
    }

    impl ReleaseHook for CountingRelease {
        fn on_release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_envelope_released_exactly_once_after_fanout() {
        let registry = Arc::new(SessionRegistry::new());
        let mut rx1 = online(&registry, 1, DeviceType::Desktop);
        let mut rx2 = online(&registry, 2, DeviceType::Web);
        let relay = relay(Arc::clone(&registry));

        let hook = Arc::new(CountingRelease {
            releases: AtomicUsize::new(0),
        });
        let envelope = NotificationEnvelope::with_release_hook(
            Bytes::from_static(b"n"),
            hook.clone(),
        );

        assert!(relay.deliver(envelope, &[1, 2, 3]).await);
        // 中继自身的引用已释放，帧内 guard 仍在队列里
        assert_eq!(hook.releases.load(Ordering::SeqCst), 0);

        // 写出（此处以消费命令模拟）完成后计数归零，释放恰好一次
        let _ = rx1.recv().await.unwrap();
        let _ = rx2.recv().await.unwrap();
        drop(rx1);
        drop(rx2);
        tokio::task::yield_now().await;
        assert_eq!(hook.releases.load(Ordering::SeqCst), 1);
    }

    struct CollectingHook {
        tx: mpsc::Sender<NotifyEvent>,
    }

    #[async_trait]
    impl OfflineNotifyHook for CollectingHook {
        async fn handle(&self, event: &NotifyEvent) -> ember_im_core::error::Result<()> {
            let _ = self.tx.send(event.clone()).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_offline_recipients_offered_to_hook() {
        let registry = Arc::new(SessionRegistry::new());
        let _rx = online(&registry, 1, DeviceType::Desktop);

        let hooks = HookRegistry::new();
        let (tx, mut events) = mpsc::channel(1);
        hooks
            .register_offline_notify(HookMetadata::new("collect"), Arc::new(CollectingHook { tx }))
            .await;

        let relay = PushDomainService::new(
            "node-a",
            Arc::clone(&registry),
            Arc::new(StaticClusterDirectory::new()),
            None,
            hooks,
            Arc::new(GatewayMetrics::new()),
        );

        let envelope = NotificationEnvelope::new(Bytes::from_static(b"n"));
        assert!(relay.deliver(envelope, &[1, 5, 6]).await);

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.all_recipients, vec![1, 5, 6]);
        assert_eq!(event.offline_recipients, vec![5, 6]);
        assert_eq!(&event.notification[..], b"n");
    }

    #[tokio::test]
    async fn test_executor_consumes_task_as_local_fanout() {
        let registry = Arc::new(SessionRegistry::new());
        let mut rx = online(&registry, 10, DeviceType::Android);
        let relay = relay(Arc::clone(&registry));

        let task =
            ClusterDeliveryTask::new(Bytes::from_static(b"remote"), vec![10, 11], None).unwrap();
        assert!(relay.execute(&task).await);

        match rx.recv().await.unwrap() {
            SinkCommand::Frame { bytes, .. } => assert_eq!(&bytes[..], b"remote"),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
