//! Websocket command framing
//!
//! Every frame is `command:param`. Channel frames are additionally prefixed
//! with the channel number, e.g. `0:c:[...]`. Heartbeats (`h:N`) and remote
//! log level requests (`log:N`) are not bound to a channel.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMMAND_INIT: &str = "init";
pub const COMMAND_AUTH: &str = "auth";
pub const COMMAND_INDEX: &str = "i";
pub const COMMAND_CHANGE: &str = "c";
pub const COMMAND_VERSION: &str = "cv";
pub const COMMAND_ENTITY: &str = "e";
pub const COMMAND_INDEX_STATE: &str = "index";
pub const COMMAND_HEARTBEAT: &str = "h";
pub const COMMAND_LOG: &str = "log";

pub const API_VERSION: &str = "1.1";
pub const INDEX_PAGE_SIZE: i64 = 50;

pub const EXPIRED_AUTH: &str = "expired";

/// Auth failure codes meaning the token is unusable
const AUTH_INVALID_TOKEN: i64 = 401;
const AUTH_MALFORMED_TOKEN: i64 = 400;

/// Remote log levels requested with `log:N`
pub const LOG_DISABLED: i32 = 0;
pub const LOG_INFO: i32 = 1;
pub const LOG_DEBUG: i32 = 2;

/// Splits `command:param` at the first colon.
pub fn split_command(message: &str) -> (&str, &str) {
    message.split_once(':').unwrap_or((message, ""))
}

/// Splits a channel frame `N:command:param` into the channel number and the
/// channel message.
pub fn split_channel(frame: &str) -> Option<(usize, &str)> {
    let (prefix, message) = frame.split_once(':')?;
    let channel = prefix.parse::<usize>().ok()?;
    Some((channel, message))
}

pub fn channel_frame(channel: usize, message: &str) -> String {
    format!("{channel}:{message}")
}

pub fn command(name: &str, param: impl Display) -> String {
    format!("{name}:{param}")
}

pub fn heartbeat(count: u64) -> String {
    command(COMMAND_HEARTBEAT, count)
}

/// Cursor for downloading the bucket index, `i::{mark}::{limit}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    pub mark: String,
    pub limit: i64,
}

impl IndexQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mark(mark: impl Into<String>) -> Self {
        Self {
            mark: mark.into(),
            ..Self::default()
        }
    }
}

impl Default for IndexQuery {
    fn default() -> Self {
        Self {
            mark: String::new(),
            limit: INDEX_PAGE_SIZE,
        }
    }
}

impl Display for IndexQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.limit > -1 {
            write!(f, "{}::{}::{}", COMMAND_INDEX, self.mark, self.limit)
        } else {
            write!(f, "{}::{}::", COMMAND_INDEX, self.mark)
        }
    }
}

/// Body of the `init:` command that starts a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    pub api: String,
    #[serde(rename = "clientid")]
    pub client_id: String,
    pub app_id: String,
    pub token: String,
    pub name: String,
    pub cmd: String,
    pub library: String,
    pub version: u32,
}

impl InitMessage {
    pub fn to_command(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_default();
        command(COMMAND_INIT, body)
    }
}

/// Outcome of an `auth:` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// `auth:expired`, nothing to do
    Expired,
    /// The token was rejected; the user must sign in again
    Unauthorized(i64),
    /// Any other failure code
    Failed(i64),
    /// Authorized as the given email
    Authorized(String),
}

impl AuthResponse {
    pub fn parse(param: &str) -> Self {
        let param = param.trim();
        if param == EXPIRED_AUTH {
            return AuthResponse::Expired;
        }
        if param.starts_with('{')
            && let Ok(Value::Object(body)) = serde_json::from_str::<Value>(param)
            && let Some(code) = body.get("code").and_then(Value::as_i64)
        {
            return if code == AUTH_INVALID_TOKEN || code == AUTH_MALFORMED_TOKEN {
                AuthResponse::Unauthorized(code)
            } else {
                AuthResponse::Failed(code)
            };
        }
        AuthResponse::Authorized(param.to_string())
    }
}

/// Client log line sent with `log:`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub log: String,
    pub bucket: String,
}

impl LogMessage {
    pub fn to_command(&self) -> String {
        command(COMMAND_LOG, serde_json::to_string(self).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("c:[{\"a\":\"b:c\"}]"), ("c", "[{\"a\":\"b:c\"}]"));
        assert_eq!(split_command("index"), ("index", ""));
        assert_eq!(split_command("cv:?"), ("cv", "?"));
    }

    #[test]
    fn test_split_channel() {
        assert_eq!(split_channel("2:auth:user@example.com"), Some((2, "auth:user@example.com")));
        assert_eq!(split_channel("h:12"), None);
        assert_eq!(channel_frame(1, "i::::50"), "1:i::::50");
    }

    #[test]
    fn test_index_query_format() {
        assert_eq!(IndexQuery::new().to_string(), "i::::50");
        assert_eq!(IndexQuery::from_mark("abc").to_string(), "i::abc::50");
        let unlimited = IndexQuery {
            mark: "m".to_string(),
            limit: -1,
        };
        assert_eq!(unlimited.to_string(), "i::m::");
    }

    #[test]
    fn test_auth_response_parse() {
        assert_eq!(AuthResponse::parse("expired"), AuthResponse::Expired);
        assert_eq!(AuthResponse::parse("{\"code\":401}"), AuthResponse::Unauthorized(401));
        assert_eq!(AuthResponse::parse("{\"code\":400}"), AuthResponse::Unauthorized(400));
        assert_eq!(AuthResponse::parse("{\"code\":500}"), AuthResponse::Failed(500));
        assert_eq!(
            AuthResponse::parse("{not json"),
            AuthResponse::Authorized("{not json".to_string())
        );
        assert_eq!(
            AuthResponse::parse("user@example.com"),
            AuthResponse::Authorized("user@example.com".to_string())
        );
    }

    #[test]
    fn test_init_message() {
        let init = InitMessage {
            api: API_VERSION.to_string(),
            client_id: "rust-abc123".to_string(),
            app_id: "app".to_string(),
            token: "token".to_string(),
            name: "notes".to_string(),
            cmd: IndexQuery::new().to_string(),
            library: "rust".to_string(),
            version: 0,
        };
        let message = init.to_command();
        let (name, body) = split_command(&message);
        assert_eq!(name, COMMAND_INIT);
        let parsed: Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["clientid"], "rust-abc123");
        assert_eq!(parsed["cmd"], "i::::50");
        assert_eq!(parsed["api"], "1.1");
    }

    #[test]
    fn test_log_message() {
        let message = LogMessage {
            log: "hello".to_string(),
            bucket: "notes".to_string(),
        };
        assert_eq!(message.to_command(), "log:{\"log\":\"hello\",\"bucket\":\"notes\"}");
        assert_eq!(heartbeat(4), "h:4");
    }
}
