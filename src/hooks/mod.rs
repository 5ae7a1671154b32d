//! 扩展 Hook
//!
//! 投递扇出完成后，将不在线接收方提供给已注册的扩展处理器（如离线推送）。
//! Hook 以尽力而为的方式执行：失败仅记录日志，绝不阻塞或影响投递结果。

mod registry;
mod types;

pub use registry::HookRegistry;
pub use types::{HookMetadata, NotifyEvent, OfflineNotifyHook};
