//! Ember IM Core 公共库
//!
//! 提供网关各组件共享的错误类型、状态码、配置加载、指标采集与扩展 Hook 注册能力

pub mod codes;
pub mod config;
pub mod error;
pub mod hooks;
pub mod metrics;

pub use codes::{CloseCode, StatusCode};
pub use config::{
    ClusterSectionConfig, ConfigManager, EmberAppConfig, GatewaySectionConfig,
    ReasonCacheCategoryConfig, ReasonCacheSectionConfig, load_config,
};
pub use error::*;
pub use hooks::*;
