//! 配置管理器 - 负责处理不同环境下的配置覆盖
//!
//! 该模块提供环境相关的配置能力：
//! - 从 EMBER_ENV 读取当前环境名
//! - 加载并合并 config/environments/{environment}.toml 中的覆盖项

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml::Value;

use super::EmberAppConfig;

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    ///
    /// 从环境变量 EMBER_ENV 获取，未设置时默认为 "development"
    pub fn get_environment() -> String {
        env::var("EMBER_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 根据环境加载特定配置并合并到基础配置中
    ///
    /// 读取 config/environments/{environment}.toml，仅覆盖其中出现的字段
    pub fn load_environment_config(base_config: &mut EmberAppConfig) -> Result<()> {
        let env = Self::get_environment();
        let env_config_path = format!("config/environments/{}.toml", env);

        if Path::new(&env_config_path).exists() {
            let env_config_content = fs::read_to_string(&env_config_path)
                .with_context(|| format!("无法读取环境配置文件: {}", env_config_path))?;
            let env_config: Value = toml::from_str(&env_config_content)
                .with_context(|| format!("无效的环境配置格式: {}", env_config_path))?;

            Self::merge_config_values(base_config, &env_config);
        }

        Ok(())
    }

    /// 合并环境配置中的覆盖项
    fn merge_config_values(base: &mut EmberAppConfig, env_config: &Value) {
        if let Some(gateway) = env_config.get("gateway") {
            if let Some(v) = gateway.get("tcp_bind").and_then(|v| v.as_str()) {
                base.gateway.tcp_bind = Some(v.to_string());
            }
            if let Some(v) = gateway.get("ws_bind").and_then(|v| v.as_str()) {
                base.gateway.ws_bind = Some(v.to_string());
            }
            if let Some(v) = gateway.get("heartbeat_timeout_secs").and_then(|v| v.as_integer()) {
                base.gateway.heartbeat_timeout_secs = v.max(0) as u64;
            }
            if let Some(v) = gateway.get("conflict_policy").and_then(|v| v.as_str()) {
                base.gateway.conflict_policy = v.to_string();
            }
            if let Some(v) = gateway.get("expose_error_detail").and_then(|v| v.as_bool()) {
                base.gateway.expose_error_detail = v;
            }
            if let Some(v) = gateway.get("auth_secret").and_then(|v| v.as_str()) {
                base.gateway.auth_secret = Some(v.to_string());
            }
        }

        if let Some(cluster) = env_config.get("cluster") {
            if let Some(v) = cluster.get("node_id").and_then(|v| v.as_str()) {
                base.cluster.node_id = v.to_string();
            }
            if let Some(v) = cluster.get("listen").and_then(|v| v.as_str()) {
                base.cluster.listen = Some(v.to_string());
            }
            if let Some(peers) = cluster.get("peers").and_then(|v| v.as_table()) {
                for (node, addr) in peers {
                    if let Some(addr) = addr.as_str() {
                        base.cluster.peers.insert(node.clone(), addr.to_string());
                    }
                }
            }
        }
    }
}
