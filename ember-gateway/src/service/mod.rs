//! 服务装配

pub mod bootstrap;

pub use bootstrap::{GatewayBuilder, GatewayServer};

use std::sync::Arc;

use ember_im_core::metrics::GatewayMetrics;

use crate::config::GatewaySettings;
use crate::domain::repository::{Authenticator, HandlerRegistry};
use crate::domain::service::{PushDomainService, SessionDomainService};
use crate::infrastructure::reason_cache::ReasonCache;
use crate::infrastructure::registry::SessionRegistry;

/// 网关运行上下文
///
/// 连接调度器与各监听循环共享的全部依赖
pub struct GatewayContext {
    pub settings: GatewaySettings,
    pub registry: Arc<SessionRegistry>,
    pub sessions: Arc<SessionDomainService>,
    pub relay: Arc<PushDomainService>,
    pub handlers: Arc<HandlerRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    pub login_reasons: Arc<ReasonCache>,
    pub disconnect_reasons: Arc<ReasonCache>,
    pub metrics: Arc<GatewayMetrics>,
}
