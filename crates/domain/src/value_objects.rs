use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = OffsetDateTime;

/// 附件 URL 的最大长度。
pub const MAX_ATTACHMENT_URL_LEN: usize = 2048;

/// 将时间戳截断到微秒精度，与 PostgreSQL `timestamptz` 保持一致，
/// 保证写入后再读出的时间戳与内存中的完全相等。
pub fn truncate_to_micros(ts: Timestamp) -> Timestamp {
    let nanos = ts.nanosecond() / 1_000 * 1_000;
    ts.replace_nanosecond(nanos).unwrap_or(ts)
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// 生成一个新的随机标识。
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| DomainError::invalid_argument(stringify!($name), "not a uuid"))
            }
        }
    };
}

uuid_id!(
    /// 用户唯一标识（由外部身份服务签发）。
    UserId
);
uuid_id!(
    /// 会话唯一标识。
    ConversationId
);
uuid_id!(
    /// 消息唯一标识。
    MessageId
);
uuid_id!(
    /// 长连接唯一标识，同一用户的每个设备各有一个。
    ConnectionId
);

/// 消息正文内容。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageContent(String);

impl MessageContent {
    /// 校验并构造消息内容，`max_bytes` 为 UTF-8 编码后的字节上限。
    pub fn parse(value: impl Into<String>, max_bytes: usize) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_argument("content", "cannot be empty"));
        }
        if value.len() > max_bytes {
            return Err(DomainError::ContentTooLong {
                len: value.len(),
                max: max_bytes,
            });
        }
        // 换行和制表符以外的控制字符（包括 NUL）一律拒绝
        if value
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            return Err(DomainError::invalid_argument(
                "content",
                "cannot contain control characters",
            ));
        }
        Ok(Self(value))
    }

    /// 从存储中还原，不再重复校验长度上限（上限可能在写入后被调整）。
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 附件引用。附件本身不经过本系统，只保存其 URL。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentUrl(String);

impl AttachmentUrl {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if !(value.starts_with("https://") || value.starts_with("http://")) {
            return Err(DomainError::invalid_argument(
                "attachments",
                "must be an http(s) url",
            ));
        }
        if value.len() > MAX_ATTACHMENT_URL_LEN {
            return Err(DomainError::invalid_argument("attachments", "url too long"));
        }
        if value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(DomainError::invalid_argument(
                "attachments",
                "url cannot contain whitespace or control characters",
            ));
        }
        Ok(Self(value))
    }

    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 无序的参与者二元组。
///
/// 内部始终按 `UserId` 排序保存，因此 (A, B) 与 (B, A) 相等，
/// 可直接作为"一对用户只有一个会话"的唯一键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantPair {
    first: UserId,
    second: UserId,
}

impl ParticipantPair {
    pub fn new(a: UserId, b: UserId) -> Result<Self, DomainError> {
        if a == b {
            return Err(DomainError::SelfConversation);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { first, second })
    }

    pub fn first(&self) -> UserId {
        self.first
    }

    pub fn second(&self) -> UserId {
        self.second
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.first == user_id || self.second == user_id
    }

    /// 返回另一方；`user_id` 不在二元组中时返回 `None`。
    pub fn other(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.first {
            Some(self.second)
        } else if user_id == self.second {
            Some(self.first)
        } else {
            None
        }
    }
}
