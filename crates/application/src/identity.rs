use async_trait::async_trait;
use domain::UserId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("credential rejected: {0}")]
    Rejected(String),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl IdentityError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// 把客户端提交的凭证解析为用户身份。凭证的签发不在本服务内。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId, IdentityError>;
}
