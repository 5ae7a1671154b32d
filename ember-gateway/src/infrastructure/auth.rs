//! 摘要认证器
//!
//! 默认的会话认证实现：客户端凭据为 hex(sha256("{user_id}:{secret}"))。
//! 生产部署通常替换为独立认证服务的客户端实现，核心只依赖 Authenticator trait

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::domain::model::DeviceType;
use crate::domain::repository::{AuthError, Authenticator};

/// 基于共享密钥摘要的认证器
pub struct DigestAuthenticator {
    secret: String,
}

impl DigestAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn expected_credential(&self, user_id: i64) -> String {
        let digest = Sha256::digest(format!("{}:{}", user_id, self.secret).as_bytes());
        hex::encode(digest)
    }
}

#[async_trait]
impl Authenticator for DigestAuthenticator {
    async fn authenticate(
        &self,
        user_id: i64,
        credential: &str,
        _device_type: DeviceType,
    ) -> Result<(), AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        if credential != self.expected_credential(user_id) {
            return Err(AuthError::InvalidCredential);
        }
        Ok(())
    }
}
