//! Ember 接入网关
//!
//! 实时消息网关的连接与在线状态核心：
//! - 接入 TCP / WebSocket 长连接并完成会话认证
//! - 维护每用户每设备类型的会话注册表与心跳
//! - 将通知扇出到本节点与集群其他节点的会话
//! - 记录登录失败 / 断连原因供带外查询

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;
pub mod protocol;
pub mod service;
