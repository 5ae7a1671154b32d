//! 集群投递任务编码
//!
//! 线格式（保持字段顺序与位语义）：
//!
//! ```text
//! +--------------+-----------------+------------------+----------+-------------------+
//! | schema 字    | 接收方数量       | 接收方 id         | 通知载荷  | 去重标签（可选）    |
//! | u16 大端     | 0 / 1 / 2 字节  | 每个 8 字节大端    | len 字节  | 8 字节大端         |
//! +--------------+-----------------+------------------+----------+-------------------+
//! ```
//!
//! schema 字高 2 位标记数量字段宽度：0 = 恰好一个接收方（无数量字节）、
//! 1 = 单字节数量（2–255）、2 = 双字节数量（256–65535）；
//! 低 14 位是载荷长度，超过 16383 字节是硬错误，绝不静默截断。
//! 流在载荷后干净结束表示无去重标签，不是截断错误

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// 快速路径载荷长度上限（14 位长度域）
pub const MAX_PAYLOAD_BYTES: usize = 0x3FFF;
/// 单任务接收方数量上限（双字节数量域）
pub const MAX_RECIPIENTS: usize = u16::MAX as usize;

const COUNT_MODE_SHIFT: u16 = 14;
const PAYLOAD_LEN_MASK: u16 = 0x3FFF;

/// 任务构造 / 编解码错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("delivery task requires at least one recipient")]
    NoRecipients,

    #[error("payload of {0} bytes exceeds fast-path limit of {MAX_PAYLOAD_BYTES}")]
    PayloadTooLarge(usize),

    #[error("recipient count {0} exceeds limit of {MAX_RECIPIENTS}")]
    TooManyRecipients(usize),

    #[error("invalid schema word")]
    BadSchema,

    #[error("truncated delivery task")]
    Truncated,
}

/// 跨节点投递任务
///
/// 构造即校验：零接收方或超限载荷的任务不可表示。
/// 构造后不可变，由目标节点的投递执行器恰好消费一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDeliveryTask {
    payload: Bytes,
    recipients: Vec<i64>,
    dedup_tag: Option<u64>,
}

impl ClusterDeliveryTask {
    pub fn new(
        payload: Bytes,
        recipients: Vec<i64>,
        dedup_tag: Option<u64>,
    ) -> Result<Self, TaskError> {
        if recipients.is_empty() {
            return Err(TaskError::NoRecipients);
        }
        if recipients.len() > MAX_RECIPIENTS {
            return Err(TaskError::TooManyRecipients(recipients.len()));
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(TaskError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            payload,
            recipients,
            dedup_tag,
        })
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn recipients(&self) -> &[i64] {
        &self.recipients
    }

    pub fn dedup_tag(&self) -> Option<u64> {
        self.dedup_tag
    }

    fn count_mode(&self) -> u16 {
        match self.recipients.len() {
            1 => 0,
            2..=255 => 1,
            _ => 2,
        }
    }

    /// 编码为线格式
    pub fn encode(&self) -> Bytes {
        let mode = self.count_mode();
        let mut buf = BytesMut::with_capacity(
            2 + 2 + self.recipients.len() * 8 + self.payload.len() + 8,
        );

        let schema = (mode << COUNT_MODE_SHIFT) | (self.payload.len() as u16 & PAYLOAD_LEN_MASK);
        buf.put_u16(schema);
        match mode {
            0 => {}
            1 => buf.put_u8(self.recipients.len() as u8),
            _ => buf.put_u16(self.recipients.len() as u16),
        }
        for recipient in &self.recipients {
            buf.put_i64(*recipient);
        }
        buf.extend_from_slice(&self.payload);
        if let Some(tag) = self.dedup_tag {
            buf.put_u64(tag);
        }
        buf.freeze()
    }

    /// 从线格式还原
    pub fn decode(mut buf: Bytes) -> Result<Self, TaskError> {
        if buf.remaining() < 2 {
            return Err(TaskError::Truncated);
        }
        let schema = buf.get_u16();
        let mode = schema >> COUNT_MODE_SHIFT;
        let payload_len = (schema & PAYLOAD_LEN_MASK) as usize;

        let count = match mode {
            0 => 1usize,
            1 => {
                if buf.remaining() < 1 {
                    return Err(TaskError::Truncated);
                }
                buf.get_u8() as usize
            }
            2 => {
                if buf.remaining() < 2 {
                    return Err(TaskError::Truncated);
                }
                buf.get_u16() as usize
            }
            _ => return Err(TaskError::BadSchema),
        };
        if count == 0 {
            return Err(TaskError::NoRecipients);
        }

        if buf.remaining() < count * 8 {
            return Err(TaskError::Truncated);
        }
        let mut recipients = Vec::with_capacity(count);
        for _ in 0..count {
            recipients.push(buf.get_i64());
        }

        if buf.remaining() < payload_len {
            return Err(TaskError::Truncated);
        }
        let payload = buf.split_to(payload_len);

        // 载荷后干净结束 => 无去重标签；不满 8 字节的尾部才是截断
        let dedup_tag = match buf.remaining() {
            0 => None,
            8 => Some(buf.get_u64()),
            _ => return Err(TaskError::Truncated),
        };

        Self::new(payload, recipients, dedup_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_three_recipients_no_tag() {
        let payload = Bytes::from(vec![0xABu8; 37]);
        let task =
            ClusterDeliveryTask::new(payload.clone(), vec![10, 11, 12], None).unwrap();

        let decoded = ClusterDeliveryTask::decode(task.encode()).unwrap();
        assert_eq!(decoded.recipients().len(), 3);
        assert_eq!(decoded.payload(), &payload);
        assert_eq!(decoded.dedup_tag(), None);
    }

    #[test]
    fn test_single_recipient_omits_count_byte() {
        let task =
            ClusterDeliveryTask::new(Bytes::from_static(b"abc"), vec![99], None).unwrap();
        let encoded = task.encode();
        // schema(2) + id(8) + payload(3)
        assert_eq!(encoded.len(), 13);
        assert_eq!(ClusterDeliveryTask::decode(encoded).unwrap(), task);
    }

    #[test]
    fn test_count_width_boundaries() {
        for count in [2usize, 255, 256, 4096] {
            let recipients: Vec<i64> = (0..count as i64).collect();
            let task =
                ClusterDeliveryTask::new(Bytes::from_static(b"x"), recipients, None).unwrap();
            let decoded = ClusterDeliveryTask::decode(task.encode()).unwrap();
            assert_eq!(decoded.recipients().len(), count);
        }
    }

    #[test]
    fn test_dedup_tag_roundtrip() {
        let task = ClusterDeliveryTask::new(
            Bytes::from_static(b"notify"),
            vec![1, 2],
            Some(0xDEAD_BEEF_CAFE_F00D),
        )
        .unwrap();
        let decoded = ClusterDeliveryTask::decode(task.encode()).unwrap();
        assert_eq!(decoded.dedup_tag(), Some(0xDEAD_BEEF_CAFE_F00D));
    }

    #[test]
    fn test_construction_rejects_invalid() {
        assert_eq!(
            ClusterDeliveryTask::new(Bytes::from_static(b"x"), vec![], None),
            Err(TaskError::NoRecipients)
        );
        assert_eq!(
            ClusterDeliveryTask::new(Bytes::from(vec![0u8; MAX_PAYLOAD_BYTES + 1]), vec![1], None),
            Err(TaskError::PayloadTooLarge(MAX_PAYLOAD_BYTES + 1))
        );
        assert_eq!(
            ClusterDeliveryTask::new(
                Bytes::from_static(b"x"),
                vec![0; MAX_RECIPIENTS + 1],
                None
            ),
            Err(TaskError::TooManyRecipients(MAX_RECIPIENTS + 1))
        );
    }

    #[test]
    fn test_payload_at_limit_roundtrips() {
        let payload = Bytes::from(vec![7u8; MAX_PAYLOAD_BYTES]);
        let task = ClusterDeliveryTask::new(payload.clone(), vec![1], None).unwrap();
        let decoded = ClusterDeliveryTask::decode(task.encode()).unwrap();
        assert_eq!(decoded.payload().len(), MAX_PAYLOAD_BYTES);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let task = ClusterDeliveryTask::new(
            Bytes::from_static(b"payload"),
            vec![1, 2, 3],
            Some(42),
        )
        .unwrap();
        let encoded = task.encode();

        // 掐掉尾部若干字节：去重标签被截成 1..=7 字节必须报截断
        for cut in 1..8 {
            let truncated = encoded.slice(..encoded.len() - cut);
            assert_eq!(
                ClusterDeliveryTask::decode(truncated),
                Err(TaskError::Truncated),
                "cut {} bytes",
                cut
            );
        }

        // 空输入
        assert_eq!(
            ClusterDeliveryTask::decode(Bytes::new()),
            Err(TaskError::Truncated)
        );
    }

    #[test]
    fn test_decode_rejects_bad_schema() {
        let mut buf = BytesMut::new();
        // 数量模式 3 不存在
        buf.put_u16(0b11 << 14);
        assert_eq!(
            ClusterDeliveryTask::decode(buf.freeze()),
            Err(TaskError::BadSchema)
        );
    }
}
