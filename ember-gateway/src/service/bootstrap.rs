//! 启动装配
//!
//! 外部协作者（认证后端、业务处理器、集群归属、扩展 Hook、原因存储）
//! 在启动阶段显式注入，缺省时使用内置实现

use std::sync::Arc;

use ember_im_core::error::{EmberError, Result};
use ember_im_core::hooks::HookRegistry;
use ember_im_core::metrics::{GatewayMetrics, REGISTRY};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GatewaySettings;
use crate::domain::repository::{
    Authenticator, ClusterDirectory, HandlerRegistry, ReasonStore, StaticClusterDirectory,
};
use crate::domain::service::{PushDomainService, SessionDomainService};
use crate::infrastructure::auth::DigestAuthenticator;
use crate::infrastructure::cluster::rpc::serve_cluster;
use crate::infrastructure::cluster::{ClusterClient, DedupWindow, LocalDeliveryExecutor};
use crate::infrastructure::reason_cache::{MemoryReasonStore, ReasonCache};
use crate::infrastructure::registry::SessionRegistry;
use crate::interface::server::{serve_tcp, serve_ws};
use crate::service::GatewayContext;

/// 网关装配器
pub struct GatewayBuilder {
    settings: GatewaySettings,
    authenticator: Option<Arc<dyn Authenticator>>,
    handlers: HandlerRegistry,
    directory: Option<Arc<dyn ClusterDirectory>>,
    hooks: Option<Arc<HookRegistry>>,
    reason_store: Option<Arc<dyn ReasonStore>>,
}

impl GatewayBuilder {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings,
            authenticator: None,
            handlers: HandlerRegistry::new(),
            directory: None,
            hooks: None,
            reason_store: None,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn ClusterDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_reason_store(mut self, store: Arc<dyn ReasonStore>) -> Self {
        self.reason_store = Some(store);
        self
    }

    pub fn build(self) -> Result<GatewayServer> {
        let settings = self.settings;

        let metrics = Arc::new(GatewayMetrics::new());
        if let Err(err) = metrics.register_to(&REGISTRY) {
            // 重复注册（如多实例测试）不致命
            warn!(error = %err, "Metrics registration skipped");
        }

        let registry = Arc::new(SessionRegistry::new());
        let sessions = Arc::new(SessionDomainService::new(
            Arc::clone(&registry),
            settings.conflict_policy,
            Arc::clone(&metrics),
        ));

        let cluster = if settings.cluster_peers.is_empty() {
            None
        } else {
            Some(Arc::new(ClusterClient::new(
                settings.cluster_peers.clone(),
                settings.rpc_timeout,
            )))
        };

        let directory: Arc<dyn ClusterDirectory> = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticClusterDirectory::new()));
        let hooks = self.hooks.unwrap_or_else(HookRegistry::new);

        let relay = Arc::new(PushDomainService::new(
            settings.node_id.clone(),
            Arc::clone(&registry),
            directory,
            cluster,
            hooks,
            Arc::clone(&metrics),
        ));

        let authenticator: Arc<dyn Authenticator> = self
            .authenticator
            .unwrap_or_else(|| Arc::new(DigestAuthenticator::new(settings.auth_secret.clone())));

        let reason_store: Arc<dyn ReasonStore> = self
            .reason_store
            .unwrap_or_else(|| Arc::new(MemoryReasonStore::new()));
        let login_reasons = Arc::new(ReasonCache::new(
            "login",
            settings.login_reason_policy.clone(),
            Arc::clone(&reason_store),
        ));
        let disconnect_reasons = Arc::new(ReasonCache::new(
            "disconnect",
            settings.disconnect_reason_policy.clone(),
            reason_store,
        ));

        let ctx = Arc::new(GatewayContext {
            settings,
            registry,
            sessions,
            relay,
            handlers: Arc::new(self.handlers),
            authenticator,
            login_reasons,
            disconnect_reasons,
            metrics,
        });

        Ok(GatewayServer {
            ctx,
            cancel: CancellationToken::new(),
        })
    }
}

/// 网关服务
pub struct GatewayServer {
    ctx: Arc<GatewayContext>,
    cancel: CancellationToken,
}

impl GatewayServer {
    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 请求停机
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// 绑定监听并运行至停机
    pub async fn run(&self) -> Result<()> {
        let settings = &self.ctx.settings;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        if let Some(addr) = &settings.tcp_bind {
            let listener = bind(addr).await?;
            info!(addr = %addr, "TCP access enabled");
            tasks.push(tokio::spawn(serve_tcp(
                Arc::clone(&self.ctx),
                listener,
                self.cancel.clone(),
            )));
        }

        if let Some(addr) = &settings.ws_bind {
            let listener = bind(addr).await?;
            info!(addr = %addr, "WebSocket access enabled");
            tasks.push(tokio::spawn(serve_ws(
                Arc::clone(&self.ctx),
                listener,
                self.cancel.clone(),
            )));
        }

        if let Some(addr) = &settings.cluster_listen {
            let listener = bind(addr).await?;
            info!(addr = %addr, node_id = %settings.node_id, "Cluster delivery enabled");
            let executor: Arc<dyn LocalDeliveryExecutor> = self.ctx.relay.clone();
            tasks.push(tokio::spawn(serve_cluster(
                listener,
                executor,
                Arc::new(DedupWindow::new(settings.dedup_ttl)),
                self.cancel.clone(),
            )));
        }

        if tasks.is_empty() {
            return Err(EmberError::Configuration(
                "no listener configured, nothing to serve".into(),
            ));
        }

        self.cancel.cancelled().await;
        info!("Shutting down listeners");
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| EmberError::Configuration(format!("failed to bind {}: {}", addr, err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_with_defaults() {
        let mut settings = GatewaySettings::default();
        settings.cluster_peers
            .insert("node-b".to_string(), "127.0.0.1:1".to_string());

        let server = GatewayBuilder::new(settings).build().unwrap();
        let ctx = server.context();
        assert_eq!(ctx.registry.count_online(), 0);
        assert!(ctx.handlers.is_empty());
    }

    #[tokio::test]
    async fn test_run_requires_some_listener() {
        let mut settings = GatewaySettings::default();
        settings.tcp_bind = None;
        settings.ws_bind = None;
        settings.cluster_listen = None;

        let server = GatewayBuilder::new(settings).build().unwrap();
        assert!(matches!(
            server.run().await,
            Err(EmberError::Configuration(_))
        ));
    }
}
