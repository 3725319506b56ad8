//! JWT 认证
//!
//! 凭证由外部身份服务签发，这里只负责校验并取出用户 ID。
//! `JwtService` 同时是长连接网关使用的 `IdentityVerifier` 实现。

use application::{IdentityError, IdentityVerifier};
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use config::JwtConfig;
use domain::UserId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: i64, // 过期时间 (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    issuer: Option<String>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());
        let mut validation = Validation::default();
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            issuer: config.issuer,
            encoding_key,
            decoding_key,
            validation,
        }
    }

    /// 签发 token。生产环境由身份服务签发，这里供本地调试和测试使用。
    pub fn issue_token(&self, user_id: UserId, ttl: time::Duration) -> Result<String, ApiError> {
        let claims = Claims {
            sub: user_id.as_uuid(),
            exp: (OffsetDateTime::now_utc() + ttl).unix_timestamp(),
            iss: self.issuer.clone(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::internal_server_error(format!("token generation failed: {err}")))
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &self.validation).map(|data| data.claims)
    }
}

#[async_trait]
impl IdentityVerifier for JwtService {
    async fn verify(&self, credential: &str) -> Result<UserId, IdentityError> {
        self.verify_token(credential)
            .map(|claims| UserId::from(claims.sub))
            .map_err(|err| IdentityError::rejected(err.to_string()))
    }
}

/// 从 `Authorization: Bearer <token>` 中取出 token
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;

    auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("invalid authorization header format"))
}

/// 已认证的请求者
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        match state.identity.verify(token).await {
            Ok(user_id) => Ok(AuthUser(user_id)),
            Err(IdentityError::Unavailable(reason)) => {
                tracing::warn!(reason = %reason, "身份服务不可用");
                Err(ApiError::identity_unavailable())
            }
            Err(err) => {
                tracing::debug!(error = %err, "HTTP 请求认证失败");
                Err(ApiError::unauthorized("invalid credential"))
            }
        }
    }
}
