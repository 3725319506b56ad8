use async_trait::async_trait;
use domain::UserId;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("profile lookup failed: {0}")]
pub struct ProfileError(pub String);

/// 用户资料查询，会话列表用它补充对方的显示名
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, ProfileError>;
}

/// 没有资料服务时使用，显示名一律为空
#[derive(Debug, Default)]
pub struct NoProfiles;

#[async_trait]
impl ProfileDirectory for NoProfiles {
    async fn display_name(&self, _user_id: UserId) -> Result<Option<String>, ProfileError> {
        Ok(None)
    }
}
