//! 设备类型

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 客户端设备类型（封闭枚举）
///
/// Unrecognized 是协议层哨兵值，永远不是合法的会话键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum DeviceType {
    Unrecognized = 0,
    Desktop = 1,
    Web = 2,
    Android = 3,
    Ios = 4,
    Ipad = 5,
}

impl DeviceType {
    /// 从数值恢复设备类型，未知数值归入 Unrecognized
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => DeviceType::Desktop,
            2 => DeviceType::Web,
            3 => DeviceType::Android,
            4 => DeviceType::Ios,
            5 => DeviceType::Ipad,
            _ => DeviceType::Unrecognized,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Unrecognized => "unrecognized",
            DeviceType::Desktop => "desktop",
            DeviceType::Web => "web",
            DeviceType::Android => "android",
            DeviceType::Ios => "ios",
            DeviceType::Ipad => "ipad",
        }
    }

    /// 是否为可建立会话的已识别设备类型
    pub fn is_recognized(self) -> bool {
        self != DeviceType::Unrecognized
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceType::Desktop),
            "web" => Ok(DeviceType::Web),
            "android" => Ok(DeviceType::Android),
            "ios" => Ok(DeviceType::Ios),
            "ipad" => Ok(DeviceType::Ipad),
            other => Err(format!("unknown device type: {}", other)),
        }
    }
}
