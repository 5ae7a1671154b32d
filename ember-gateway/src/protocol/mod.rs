//! 客户端帧协议
//!
//! 帧格式：4 字节大端长度前缀 + 载荷。零长度帧即心跳，无任何载荷；
//! 非零帧为 protobuf 编码的请求/应答信封。
//! 信封只约定最小结构：请求号 + kind 判别值 + 不透明业务载荷，
//! 网关不理解具体 kind 的业务含义，只负责路由与结果包装。

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// kind 未设置哨兵值，出现即视为协议违规
pub const KIND_UNSET: i32 = 0;
/// 会话创建（握手）
pub const KIND_SESSION_CREATE: i32 = 1;
/// 会话删除（登出）
pub const KIND_SESSION_DELETE: i32 = 2;
/// 服务端通知：检测到同设备类型的重复登录尝试
pub const KIND_DUPLICATE_LOGIN: i32 = 3;
/// 服务端通知：会话被强制下线
pub const KIND_FORCED_OFFLINE: i32 = 4;
/// 服务端通知：连接即将关闭（TCP 接入的关闭原因载体）
pub const KIND_CLOSE_NOTICE: i32 = 5;

/// 协议层错误
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] prost::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 请求信封
#[derive(Clone, PartialEq, Message)]
pub struct RequestEnvelope {
    /// 客户端请求号，应答通知原样携带
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    /// 请求类别判别值
    #[prost(int32, tag = "2")]
    pub kind: i32,
    /// 不透明业务载荷
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
    /// 附加元数据
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
}

/// 应答/通知信封
#[derive(Clone, PartialEq, Message)]
pub struct ResponseEnvelope {
    /// 对应请求号；服务端主动通知为 0
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    /// 类别判别值（与请求一致，或服务端通知类别）
    #[prost(int32, tag = "2")]
    pub kind: i32,
    /// 应用层状态码
    #[prost(int32, tag = "3")]
    pub code: i32,
    /// 人类可读说明（可为空）
    #[prost(string, tag = "4")]
    pub message: ::prost::alloc::string::String,
    /// 不透明业务载荷
    #[prost(bytes = "bytes", tag = "5")]
    pub payload: Bytes,
}

/// 会话创建载荷（TCP 接入的首帧；WS 接入由握手头合成）
#[derive(Clone, PartialEq, Message)]
pub struct SessionCreatePayload {
    #[prost(int64, tag = "1")]
    pub user_id: i64,
    #[prost(string, tag = "2")]
    pub credential: ::prost::alloc::string::String,
    /// 设备类型数值，见 DeviceType
    #[prost(int32, tag = "3")]
    pub device_type: i32,
    /// 地理位置，"longitude:latitude" 形式，可为空
    #[prost(string, tag = "4")]
    pub location: ::prost::alloc::string::String,
    /// 设备细节描述，可为空
    #[prost(string, tag = "5")]
    pub device_detail: ::prost::alloc::string::String,
}

/// 解码请求信封
pub fn decode_request(bytes: &Bytes) -> Result<RequestEnvelope, ProtocolError> {
    Ok(RequestEnvelope::decode(bytes.clone())?)
}

/// 编码应答信封
pub fn encode_response(response: &ResponseEnvelope) -> Bytes {
    let mut buf = BytesMut::with_capacity(response.encoded_len());
    response
        .encode(&mut buf)
        .expect("BytesMut grows on demand, encode cannot fail");
    buf.freeze()
}

/// 构造携带状态码的应答
pub fn response_status(
    request_id: i64,
    kind: i32,
    code: i32,
    message: impl Into<String>,
) -> ResponseEnvelope {
    ResponseEnvelope {
        request_id,
        kind,
        code,
        message: message.into(),
        payload: Bytes::new(),
    }
}

/// 构造携带业务载荷的成功应答
pub fn response_payload(request_id: i64, kind: i32, code: i32, payload: Bytes) -> ResponseEnvelope {
    ResponseEnvelope {
        request_id,
        kind,
        code,
        message: String::new(),
        payload,
    }
}

/// 构造服务端主动通知
pub fn server_notice(kind: i32, code: i32, message: impl Into<String>) -> Bytes {
    encode_response(&response_status(0, kind, code, message))
}

/// 客户端帧编解码器
///
/// 长度前缀为无符号 32 位大端整数；帧体超过上限立即报错，
/// 不会静默截断
#[derive(Debug)]
pub struct ClientFrameCodec {
    max_frame_bytes: usize,
}

impl ClientFrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

const LENGTH_PREFIX: usize = 4;

impl Decoder for ClientFrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                limit: self.max_frame_bytes,
            });
        }

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for ClientFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                limit: self.max_frame_bytes,
            });
        }
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
