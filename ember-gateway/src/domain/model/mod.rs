pub mod device;
pub mod envelope;
pub mod session;

pub use device::DeviceType;
pub use envelope::{NotificationEnvelope, ReleaseHook};
pub use session::{GeoPoint, Session, SessionCreateParams, SinkCommand};

use std::str::FromStr;

/// 同设备类型重复登录时的冲突处理策略
///
/// 策略由部署配置决定，注册表本身永远只做“占用即拒绝”：
/// - Decline：拒绝新登录，已在线会话不受影响
/// - Notify：拒绝新登录，并向已在线会话推送重复登录提醒
/// - Kick：将已在线会话强制下线，接受新登录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    Decline,
    Notify,
    Kick,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "decline" => Ok(ConflictPolicy::Decline),
            "notify" => Ok(ConflictPolicy::Notify),
            "kick" => Ok(ConflictPolicy::Kick),
            other => Err(format!("unknown conflict policy: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_policy_parse() {
        assert_eq!("decline".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Decline);
        assert_eq!("Notify".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Notify);
        assert_eq!("KICK".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Kick);
        assert!("replace".parse::<ConflictPolicy>().is_err());
    }
}
