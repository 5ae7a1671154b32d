//! 连接调度器
//!
//! 每连接一份的协议状态机：握手认证、请求解析、心跳识别、
//! 业务路由与结果包装。
//!
//! 错误边界约束：处理一帧的任何失败都在这里收敛为应答通知或关闭动作，
//! 绝不向传输层抛出异步错误。唯一的例外是协议违规（无法解析的信封、
//! kind 未设置、kind 未注册）——不应答，直接以 bad data 原因强制断开

use std::sync::Arc;

use bytes::Bytes;
use ember_im_core::codes::{CloseCode, StatusCode};
use ember_im_core::error::EmberError;
use prost::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::model::{DeviceType, GeoPoint, Session, SessionCreateParams, SinkCommand};
use crate::domain::repository::SessionIdentity;
use crate::domain::service::LoginOutcome;
use crate::protocol::{
    self, KIND_SESSION_CREATE, KIND_SESSION_DELETE, KIND_UNSET, RequestEnvelope,
    ResponseEnvelope, SessionCreatePayload,
};
use crate::service::GatewayContext;

/// 握手字段（TCP 首帧载荷或 WS 握手头）
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub request_id: i64,
    pub user_id: i64,
    pub credential: String,
    pub device_type: DeviceType,
    pub location: Option<GeoPoint>,
    pub device_detail: Option<String>,
}

impl HandshakeInfo {
    pub fn from_payload(payload: &SessionCreatePayload, request_id: i64) -> Self {
        let location = if payload.location.is_empty() {
            None
        } else {
            match payload.location.parse::<GeoPoint>() {
                Ok(point) => Some(point),
                Err(err) => {
                    debug!(error = %err, "Ignoring malformed location");
                    None
                }
            }
        };
        Self {
            request_id,
            user_id: payload.user_id,
            credential: payload.credential.clone(),
            device_type: DeviceType::from_i32(payload.device_type),
            location,
            device_detail: if payload.device_detail.is_empty() {
                None
            } else {
                Some(payload.device_detail.clone())
            },
        }
    }
}

/// 一帧处理结果（总是 resolve，绝不向传输层抛错）
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Close(CloseCode),
}

enum ConnState {
    Unauthenticated,
    Authenticated(Arc<Session>),
    Closed,
}

/// 连接调度器
pub struct ClientConnection {
    ctx: Arc<GatewayContext>,
    conn_id: String,
    sink: mpsc::Sender<SinkCommand>,
    cancel: CancellationToken,
    state: ConnState,
}

impl ClientConnection {
    pub fn new(
        ctx: Arc<GatewayContext>,
        sink: mpsc::Sender<SinkCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            conn_id: Uuid::new_v4().to_string(),
            sink,
            cancel,
            state: ConnState::Unauthenticated,
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        match &self.state {
            ConnState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    /// 处理一帧入站数据
    pub async fn on_frame(&mut self, frame: Bytes) -> FrameOutcome {
        if matches!(self.state, ConnState::Closed) {
            return FrameOutcome::Close(CloseCode::Normal);
        }

        if frame.is_empty() {
            return self.on_heartbeat();
        }

        let request = match protocol::decode_request(&frame) {
            Ok(request) => request,
            Err(err) => {
                warn!(conn_id = %self.conn_id, error = %err, "Undecodable frame");
                return self.violation();
            }
        };
        if request.kind == KIND_UNSET {
            warn!(conn_id = %self.conn_id, "Envelope without kind");
            return self.violation();
        }

        match &self.state {
            ConnState::Unauthenticated => self.on_unauthenticated(request).await,
            ConnState::Authenticated(session) => {
                // 任何入站帧都刷新心跳
                let session = Arc::clone(session);
                session.touch();
                self.on_authenticated(session, request).await
            }
            ConnState::Closed => FrameOutcome::Close(CloseCode::Normal),
        }
    }

    /// 心跳：仅刷新时间戳并回以空帧，不触达其他任何状态
    fn on_heartbeat(&mut self) -> FrameOutcome {
        match &self.state {
            ConnState::Authenticated(session) => {
                session.touch();
                self.ctx.metrics.heartbeats_total.inc();
                if self
                    .sink
                    .try_send(SinkCommand::Frame {
                        bytes: Bytes::new(),
                        guard: None,
                    })
                    .is_err()
                {
                    debug!(conn_id = %self.conn_id, "Heartbeat ack dropped, outbound queue full");
                }
                FrameOutcome::Continue
            }
            // 认证前只接受会话创建请求
            _ => self.violation(),
        }
    }

    async fn on_unauthenticated(&mut self, request: RequestEnvelope) -> FrameOutcome {
        if request.kind != KIND_SESSION_CREATE {
            self.reply(protocol::response_status(
                request.request_id,
                request.kind,
                StatusCode::Unauthorized.as_i32(),
                "authentication required",
            ));
            return FrameOutcome::Close(CloseCode::Rejected);
        }

        let payload = match SessionCreatePayload::decode(request.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(conn_id = %self.conn_id, error = %err, "Undecodable session create payload");
                return self.violation();
            }
        };
        self.authenticate(HandshakeInfo::from_payload(&payload, request.request_id))
            .await
    }

    /// 握手认证并登记会话
    ///
    /// WS 接入在连接建立时以握手头直接调用；TCP 接入经由首帧到达
    #[instrument(skip(self, info), fields(conn_id = %self.conn_id, user_id = info.user_id))]
    pub async fn authenticate(&mut self, info: HandshakeInfo) -> FrameOutcome {
        if !info.device_type.is_recognized() {
            self.reply(protocol::response_status(
                info.request_id,
                KIND_SESSION_CREATE,
                StatusCode::InvalidParameter.as_i32(),
                "unrecognized device type",
            ));
            return FrameOutcome::Close(CloseCode::Rejected);
        }

        if let Err(err) = self
            .ctx
            .authenticator
            .authenticate(info.user_id, &info.credential, info.device_type)
            .await
        {
            info!(
                conn_id = %self.conn_id,
                user_id = info.user_id,
                device_type = %info.device_type,
                error = %err,
                "Authentication failed"
            );
            let status = StatusCode::Unauthorized.as_i32();
            self.record_login_reason(&info, status).await;
            self.reply(protocol::response_status(
                info.request_id,
                KIND_SESSION_CREATE,
                status,
                err.to_string(),
            ));
            return FrameOutcome::Close(CloseCode::Rejected);
        }

        let params = SessionCreateParams {
            user_id: info.user_id,
            device_type: info.device_type,
            conn_id: self.conn_id.clone(),
            location: info.location,
            device_detail: info.device_detail.clone(),
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
        };

        match self.ctx.sessions.login(params) {
            Ok(LoginOutcome::Accepted(session)) => {
                info!(
                    conn_id = %self.conn_id,
                    user_id = info.user_id,
                    device_type = %info.device_type,
                    "Session established"
                );
                self.state = ConnState::Authenticated(session);
                self.reply(protocol::response_status(
                    info.request_id,
                    KIND_SESSION_CREATE,
                    StatusCode::Ok.as_i32(),
                    "",
                ));
                FrameOutcome::Continue
            }
            Ok(LoginOutcome::Declined { .. }) => {
                let status = StatusCode::Conflict.as_i32();
                self.record_login_reason(&info, status).await;
                self.reply(protocol::response_status(
                    info.request_id,
                    KIND_SESSION_CREATE,
                    status,
                    "device already online",
                ));
                FrameOutcome::Close(CloseCode::Rejected)
            }
            Err(err) => {
                let status = err.status_code();
                self.record_login_reason(&info, status).await;
                self.reply(protocol::response_status(
                    info.request_id,
                    KIND_SESSION_CREATE,
                    status,
                    err.to_string(),
                ));
                FrameOutcome::Close(CloseCode::Rejected)
            }
        }
    }

    async fn on_authenticated(
        &mut self,
        session: Arc<Session>,
        request: RequestEnvelope,
    ) -> FrameOutcome {
        match request.kind {
            KIND_SESSION_CREATE => {
                self.reply(protocol::response_status(
                    request.request_id,
                    request.kind,
                    StatusCode::InvalidParameter.as_i32(),
                    "already authenticated",
                ));
                FrameOutcome::Continue
            }
            KIND_SESSION_DELETE => {
                self.reply(protocol::response_status(
                    request.request_id,
                    request.kind,
                    StatusCode::Ok.as_i32(),
                    "",
                ));
                info!(
                    conn_id = %self.conn_id,
                    user_id = session.user_id(),
                    "Session delete requested"
                );
                FrameOutcome::Close(CloseCode::Normal)
            }
            kind => self.dispatch_business(session, kind, request).await,
        }
    }

    /// 按 kind 路由到业务处理器并包装结果
    async fn dispatch_business(
        &mut self,
        session: Arc<Session>,
        kind: i32,
        request: RequestEnvelope,
    ) -> FrameOutcome {
        let Some(handler) = self.ctx.handlers.get(kind) else {
            warn!(conn_id = %self.conn_id, kind = kind, "Unregistered request kind");
            return self.violation();
        };

        let identity = SessionIdentity {
            user_id: session.user_id(),
            device_type: session.device_type(),
            conn_id: self.conn_id.clone(),
        };

        let response = match handler.handle(&identity, &request).await {
            Ok(Some(payload)) => protocol::response_payload(
                request.request_id,
                kind,
                StatusCode::Ok.as_i32(),
                payload,
            ),
            Ok(None) => {
                protocol::response_status(request.request_id, kind, StatusCode::Ok.as_i32(), "")
            }
            Err(EmberError::Business { code, message }) => {
                protocol::response_status(request.request_id, kind, code, message)
            }
            Err(err) => {
                error!(
                    conn_id = %self.conn_id,
                    kind = kind,
                    error = %err,
                    "Business handler failed"
                );
                let message = if self.ctx.settings.expose_error_detail {
                    err.to_string()
                } else {
                    String::new()
                };
                protocol::response_status(
                    request.request_id,
                    kind,
                    StatusCode::ServerError.as_i32(),
                    message,
                )
            }
        };

        self.reply(response);
        FrameOutcome::Continue
    }

    fn reply(&self, response: ResponseEnvelope) {
        let bytes = protocol::encode_response(&response);
        if self
            .sink
            .try_send(SinkCommand::Frame { bytes, guard: None })
            .is_err()
        {
            warn!(conn_id = %self.conn_id, "Reply dropped, outbound queue full");
        }
    }

    /// 协议违规：不应答，强制断开
    fn violation(&mut self) -> FrameOutcome {
        self.ctx.metrics.protocol_violations_total.inc();
        FrameOutcome::Close(CloseCode::BadData)
    }

    async fn record_login_reason(&self, info: &HandshakeInfo, status: i32) {
        let correlation = info.request_id.to_string();
        let cache = &self.ctx.login_reasons;
        if cache.should_cache(info.user_id, info.device_type, &correlation, status) {
            if let Err(err) = cache
                .cache(info.user_id, info.device_type, &correlation, status)
                .await
            {
                warn!(error = %err, "Failed to cache login failure reason");
            }
        }
    }

    /// 连接收尾
    ///
    /// 摘除仍绑定在本连接上的会话，并按策略记录断连原因
    #[instrument(skip(self, code), fields(conn_id = %self.conn_id, code = code.as_i32()))]
    pub async fn teardown(&mut self, code: CloseCode) {
        let state = std::mem::replace(&mut self.state, ConnState::Closed);
        if let ConnState::Authenticated(session) = state {
            self.ctx
                .sessions
                .detach(session.user_id(), session.device_type(), &self.conn_id);

            let cache = &self.ctx.disconnect_reasons;
            if cache.should_cache(
                session.user_id(),
                session.device_type(),
                &self.conn_id,
                code.as_i32(),
            ) {
                if let Err(err) = cache
                    .cache(
                        session.user_id(),
                        session.device_type(),
                        &self.conn_id,
                        code.as_i32(),
                    )
                    .await
                {
                    warn!(error = %err, "Failed to cache disconnect reason");
                }
            }
            info!(
                conn_id = %self.conn_id,
                user_id = session.user_id(),
                code = code.as_i32(),
                "Connection torn down"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use crate::domain::model::ConflictPolicy;
    use crate::domain::repository::{BusinessHandler, HandlerRegistry, StaticClusterDirectory};
    use crate::domain::service::{PushDomainService, SessionDomainService};
    use crate::infrastructure::auth::DigestAuthenticator;
    use crate::infrastructure::reason_cache::{MemoryReasonStore, ReasonCache, ReasonCachePolicy};
    use crate::infrastructure::registry::SessionRegistry;
    use async_trait::async_trait;
    use ember_im_core::error::Result;
    use ember_im_core::hooks::HookRegistry;
    use ember_im_core::metrics::GatewayMetrics;
    use prost::Message;
    use sha2::{Digest, Sha256};

    const KIND_ECHO: i32 = 100;
    const KIND_FAIL: i32 = 101;
    const KIND_RULE: i32 = 102;

    struct EchoHandler;

    #[async_trait]
    impl BusinessHandler for EchoHandler {
        async fn handle(
            &self,
            _identity: &SessionIdentity,
            request: &RequestEnvelope,
        ) -> Result<Option<Bytes>> {
            Ok(Some(request.payload.clone()))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl BusinessHandler for FailingHandler {
        async fn handle(
            &self,
            _identity: &SessionIdentity,
            _request: &RequestEnvelope,
        ) -> Result<Option<Bytes>> {
            Err(EmberError::Internal("backend exploded".into()))
        }
    }

    struct RuleHandler;

    #[async_trait]
    impl BusinessHandler for RuleHandler {
        async fn handle(
            &self,
            _identity: &SessionIdentity,
            _request: &RequestEnvelope,
        ) -> Result<Option<Bytes>> {
            Err(EmberError::business(
                StatusCode::InvalidParameter,
                "rule violated",
            ))
        }
    }

    fn context(expose_detail: bool) -> Arc<GatewayContext> {
        let mut settings = GatewaySettings::default();
        settings.auth_secret = "test-secret".to_string();
        settings.expose_error_detail = expose_detail;

        let registry = Arc::new(SessionRegistry::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let sessions = Arc::new(SessionDomainService::new(
            Arc::clone(&registry),
            ConflictPolicy::Decline,
            Arc::clone(&metrics),
        ));
        let relay = Arc::new(PushDomainService::new(
            "node-a",
            Arc::clone(&registry),
            Arc::new(StaticClusterDirectory::new()),
            None,
            HookRegistry::new(),
            Arc::clone(&metrics),
        ));

        let mut handlers = HandlerRegistry::new();
        handlers.register(KIND_ECHO, Arc::new(EchoHandler)).unwrap();
        handlers.register(KIND_FAIL, Arc::new(FailingHandler)).unwrap();
        handlers.register(KIND_RULE, Arc::new(RuleHandler)).unwrap();

        let store: Arc<MemoryReasonStore> = Arc::new(MemoryReasonStore::new());
        let login_policy = ReasonCachePolicy {
            enabled: true,
            ttl: std::time::Duration::from_secs(60),
            degraded: std::collections::HashSet::from([DeviceType::Web]),
            ignore_codes: std::collections::HashSet::new(),
        };

        Arc::new(GatewayContext {
            login_reasons: Arc::new(ReasonCache::new(
                "login",
                login_policy.clone(),
                Arc::clone(&store) as Arc<dyn crate::domain::repository::ReasonStore>,
            )),
            disconnect_reasons: Arc::new(ReasonCache::new(
                "disconnect",
                login_policy,
                store,
            )),
            settings,
            registry,
            sessions,
            relay,
            handlers: Arc::new(handlers),
            authenticator: Arc::new(DigestAuthenticator::new("test-secret")),
            metrics,
        })
    }

    fn connection(
        ctx: &Arc<GatewayContext>,
    ) -> (ClientConnection, mpsc::Receiver<SinkCommand>) {
        let (tx, rx) = mpsc::channel(32);
        (
            ClientConnection::new(Arc::clone(ctx), tx, CancellationToken::new()),
            rx,
        )
    }

    fn credential(user_id: i64) -> String {
        hex::encode(Sha256::digest(format!("{}:test-secret", user_id).as_bytes()))
    }

    fn login_frame(user_id: i64, device_type: DeviceType, request_id: i64) -> Bytes {
        let payload = SessionCreatePayload {
            user_id,
            credential: credential(user_id),
            device_type: device_type.as_i32(),
            location: String::new(),
            device_detail: String::new(),
        };
        let mut body = bytes::BytesMut::new();
        payload.encode(&mut body).unwrap();
        let request = RequestEnvelope {
            request_id,
            kind: KIND_SESSION_CREATE,
            payload: body.freeze(),
            metadata: Default::default(),
        };
        let mut buf = bytes::BytesMut::new();
        request.encode(&mut buf).unwrap();
        buf.freeze()
    }

    fn business_frame(kind: i32, request_id: i64, payload: &'static [u8]) -> Bytes {
        let request = RequestEnvelope {
            request_id,
            kind,
            payload: Bytes::from_static(payload),
            metadata: Default::default(),
        };
        let mut buf = bytes::BytesMut::new();
        request.encode(&mut buf).unwrap();
        buf.freeze()
    }

    fn recv_response(rx: &mut mpsc::Receiver<SinkCommand>) -> ResponseEnvelope {
        match rx.try_recv().expect("expected a queued frame") {
            SinkCommand::Frame { bytes, .. } => ResponseEnvelope::decode(bytes).unwrap(),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    async fn authed_connection(
        ctx: &Arc<GatewayContext>,
    ) -> (ClientConnection, mpsc::Receiver<SinkCommand>) {
        let (mut conn, mut rx) = connection(ctx);
        let outcome = conn.on_frame(login_frame(1, DeviceType::Desktop, 1)).await;
        assert_eq!(outcome, FrameOutcome::Continue);
        let ok = recv_response(&mut rx);
        assert_eq!(ok.code, StatusCode::Ok.as_i32());
        (conn, rx)
    }

    #[tokio::test]
    async fn test_login_then_heartbeats_touch_nothing_else() {
        let ctx = context(false);
        let (mut conn, mut rx) = authed_connection(&ctx).await;

        let before = conn.session().unwrap().last_heartbeat_ms();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        for _ in 0..3 {
            assert_eq!(conn.on_frame(Bytes::new()).await, FrameOutcome::Continue);
        }

        // 只产生心跳应答（空帧），无其他出站通知
        for _ in 0..3 {
            match rx.try_recv().unwrap() {
                SinkCommand::Frame { bytes, guard } => {
                    assert!(bytes.is_empty());
                    assert!(guard.is_none());
                }
                other => panic!("unexpected command: {:?}", other),
            }
        }
        assert!(rx.try_recv().is_err());

        // 心跳只前移时间戳，会话仍在注册表中
        assert!(conn.session().unwrap().last_heartbeat_ms() >= before);
        assert_eq!(ctx.registry.count_online(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_without_reply() {
        let ctx = context(false);
        let (mut conn, mut rx) = authed_connection(&ctx).await;

        let outcome = conn.on_frame(Bytes::from_static(&[0xFF, 0xFF, 0xFF])).await;
        assert_eq!(outcome, FrameOutcome::Close(CloseCode::BadData));
        // 协议违规绝不应答
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.metrics.protocol_violations_total.get(), 1);
    }

    #[tokio::test]
    async fn test_kind_unset_is_protocol_violation() {
        let ctx = context(false);
        let (mut conn, mut rx) = authed_connection(&ctx).await;

        // request_id 非零但 kind 缺省
        let request = RequestEnvelope {
            request_id: 5,
            kind: KIND_UNSET,
            payload: Bytes::new(),
            metadata: Default::default(),
        };
        let mut buf = bytes::BytesMut::new();
        request.encode(&mut buf).unwrap();

        assert_eq!(
            conn.on_frame(buf.freeze()).await,
            FrameOutcome::Close(CloseCode::BadData)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_protocol_violation() {
        let ctx = context(false);
        let (mut conn, mut rx) = authed_connection(&ctx).await;

        assert_eq!(
            conn.on_frame(business_frame(999, 6, b"x")).await,
            FrameOutcome::Close(CloseCode::BadData)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_business_dispatch_wraps_outcomes() {
        let ctx = context(false);
        let (mut conn, mut rx) = authed_connection(&ctx).await;

        // 成功：载荷原样回带，request_id 对应
        assert_eq!(
            conn.on_frame(business_frame(KIND_ECHO, 7, b"ping")).await,
            FrameOutcome::Continue
        );
        let echo = recv_response(&mut rx);
        assert_eq!(echo.request_id, 7);
        assert_eq!(echo.code, StatusCode::Ok.as_i32());
        assert_eq!(&echo.payload[..], b"ping");

        // 业务规则错误：状态码与说明透传，连接保持
        assert_eq!(
            conn.on_frame(business_frame(KIND_RULE, 8, b"")).await,
            FrameOutcome::Continue
        );
        let rule = recv_response(&mut rx);
        assert_eq!(rule.code, StatusCode::InvalidParameter.as_i32());
        assert_eq!(rule.message, "rule violated");

        // 内部错误：通用服务端错误，默认不带诊断细节
        assert_eq!(
            conn.on_frame(business_frame(KIND_FAIL, 9, b"")).await,
            FrameOutcome::Continue
        );
        let failure = recv_response(&mut rx);
        assert_eq!(failure.code, StatusCode::ServerError.as_i32());
        assert!(failure.message.is_empty());
    }

    #[tokio::test]
    async fn test_internal_error_detail_gated_by_config() {
        let ctx = context(true);
        let (mut conn, mut rx) = authed_connection(&ctx).await;

        conn.on_frame(business_frame(KIND_FAIL, 9, b"")).await;
        let failure = recv_response(&mut rx);
        assert!(failure.message.contains("backend exploded"));
    }

    #[tokio::test]
    async fn test_session_delete_replies_then_closes() {
        let ctx = context(false);
        let (mut conn, mut rx) = authed_connection(&ctx).await;

        let delete = RequestEnvelope {
            request_id: 11,
            kind: KIND_SESSION_DELETE,
            payload: Bytes::new(),
            metadata: Default::default(),
        };
        let mut buf = bytes::BytesMut::new();
        delete.encode(&mut buf).unwrap();

        assert_eq!(
            conn.on_frame(buf.freeze()).await,
            FrameOutcome::Close(CloseCode::Normal)
        );
        let ok = recv_response(&mut rx);
        assert_eq!(ok.request_id, 11);
        assert_eq!(ok.code, StatusCode::Ok.as_i32());

        conn.teardown(CloseCode::Normal).await;
        assert_eq!(ctx.registry.count_online(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_replies_rejection_and_caches_reason() {
        let ctx = context(false);
        let (mut conn, mut rx) = connection(&ctx);

        // Web 属于受限设备类型，登录失败原因应入缓存
        let payload = SessionCreatePayload {
            user_id: 9,
            credential: "wrong".to_string(),
            device_type: DeviceType::Web.as_i32(),
            location: String::new(),
            device_detail: String::new(),
        };
        let mut body = bytes::BytesMut::new();
        payload.encode(&mut body).unwrap();
        let request = RequestEnvelope {
            request_id: 21,
            kind: KIND_SESSION_CREATE,
            payload: body.freeze(),
            metadata: Default::default(),
        };
        let mut buf = bytes::BytesMut::new();
        request.encode(&mut buf).unwrap();

        assert_eq!(
            conn.on_frame(buf.freeze()).await,
            FrameOutcome::Close(CloseCode::Rejected)
        );
        let rejection = recv_response(&mut rx);
        assert_eq!(rejection.code, StatusCode::Unauthorized.as_i32());

        let cached = ctx
            .login_reasons
            .get(9, DeviceType::Web, "21")
            .await
            .unwrap();
        assert_eq!(cached, Some(StatusCode::Unauthorized.as_i32()));
    }

    #[tokio::test]
    async fn test_conflict_login_declined_with_reason_cached() {
        let ctx = context(false);

        // 设备 A 先登录
        let (mut conn_a, mut rx_a) = connection(&ctx);
        assert_eq!(
            conn_a.on_frame(login_frame(9, DeviceType::Web, 1)).await,
            FrameOutcome::Continue
        );
        assert_eq!(recv_response(&mut rx_a).code, StatusCode::Ok.as_i32());

        // 设备 B 同键登录：decline 策略下拒绝，A 保持在线
        let (mut conn_b, mut rx_b) = connection(&ctx);
        assert_eq!(
            conn_b.on_frame(login_frame(9, DeviceType::Web, 2)).await,
            FrameOutcome::Close(CloseCode::Rejected)
        );
        let rejection = recv_response(&mut rx_b);
        assert_eq!(rejection.code, StatusCode::Conflict.as_i32());

        let survivor = ctx.registry.lookup_device(9, DeviceType::Web).unwrap();
        assert!(survivor.is_bound_to(conn_a.conn_id()));

        // B 的失败原因按受限设备类型规则入缓存
        let cached = ctx.login_reasons.get(9, DeviceType::Web, "2").await.unwrap();
        assert_eq!(cached, Some(StatusCode::Conflict.as_i32()));
    }

    #[tokio::test]
    async fn test_heartbeat_before_auth_is_violation() {
        let ctx = context(false);
        let (mut conn, mut rx) = connection(&ctx);

        assert_eq!(
            conn.on_frame(Bytes::new()).await,
            FrameOutcome::Close(CloseCode::BadData)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_business_request_before_auth_rejected() {
        let ctx = context(false);
        let (mut conn, mut rx) = connection(&ctx);

        assert_eq!(
            conn.on_frame(business_frame(KIND_ECHO, 3, b"hi")).await,
            FrameOutcome::Close(CloseCode::Rejected)
        );
        let rejection = recv_response(&mut rx);
        assert_eq!(rejection.code, StatusCode::Unauthorized.as_i32());
    }

    #[tokio::test]
    async fn test_teardown_caches_disconnect_reason() {
        let ctx = context(false);
        let (mut conn, _rx) = connection(&ctx);
        // Web 会话（受限设备类型）
        assert_eq!(
            conn.on_frame(login_frame(4, DeviceType::Web, 1)).await,
            FrameOutcome::Continue
        );
        let conn_id = conn.conn_id().to_string();

        conn.teardown(CloseCode::HeartbeatTimeout).await;
        assert_eq!(ctx.registry.count_online(), 0);

        let cached = ctx
            .disconnect_reasons
            .get(4, DeviceType::Web, &conn_id)
            .await
            .unwrap();
        assert_eq!(cached, Some(CloseCode::HeartbeatTimeout.as_i32()));
    }
}
