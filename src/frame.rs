//! Wire frames exchanged with the local RPC endpoint.
//!
//! Every message in either direction has the same JSON shape:
//!
//! ```text
//! { "cmd": "AUTHORIZE", "nonce": "presence_1_1700000000000",
//!   "evt": null, "args": { ... }, "data": { ... } }
//! ```
//!
//! Outbound commands carry `cmd`, `nonce` and `args`. Responses echo the
//! nonce and carry `data`. Unsolicited dispatches use `cmd: "DISPATCH"` with
//! an `evt` name and no nonce.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command names the engine sends or recognizes.
pub mod cmd {
    /// Unsolicited event delivery from the host.
    pub const DISPATCH: &str = "DISPATCH";
    /// Request an authorization code for the application.
    pub const AUTHORIZE: &str = "AUTHORIZE";
    /// Present an access token for the session.
    pub const AUTHENTICATE: &str = "AUTHENTICATE";
    /// Publish or clear the presence activity.
    pub const SET_ACTIVITY: &str = "SET_ACTIVITY";
}

/// Event names carried in `evt`.
pub mod evt {
    /// Host finished its side of the connection handshake.
    pub const READY: &str = "READY";
    /// The frame reports a failure; details in `data.message`.
    pub const ERROR: &str = "ERROR";
}

/// One RPC message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Command name.
    pub cmd: String,
    /// Correlation token; absent on unsolicited dispatches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Event name for dispatches and error responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evt: Option<String>,
    /// Command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    /// Builds an outbound command frame.
    pub fn command(cmd: &str, nonce: String, args: Value) -> Self {
        Self {
            cmd: cmd.to_string(),
            nonce: Some(nonce),
            args: Some(args),
            ..Self::default()
        }
    }

    /// Parses a text frame.
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Serializes to the JSON text sent on the socket.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// `true` for the `DISPATCH/READY` handshake trigger.
    pub fn is_ready(&self) -> bool {
        self.cmd == cmd::DISPATCH && self.evt.as_deref() == Some(evt::READY)
    }

    /// `true` when `evt` is the `ERROR` sentinel.
    pub fn is_error(&self) -> bool {
        self.evt.as_deref() == Some(evt::ERROR)
    }

    /// Server-provided error text, falling back to the raw `data` payload.
    pub fn error_message(&self) -> String {
        match self.data.as_ref() {
            Some(data) => data
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| data.to_string(), str::to_string),
            None => "unknown rpc error".to_string(),
        }
    }

    /// Reads a string field from `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }

    /// Username announced in a `READY` dispatch.
    pub fn ready_user(&self) -> Option<&str> {
        self.data.as_ref()?.pointer("/user/username")?.as_str()
    }

    /// Short `cmd/evt` label for logs.
    pub fn label(&self) -> String {
        match &self.evt {
            Some(evt) => format!("{}/{}", self.cmd, evt),
            None => self.cmd.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_omits_empty_fields() {
        let frame = Frame::command(cmd::AUTHORIZE, "n1".into(), json!({"client_id": "42"}));
        let encoded: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(encoded["cmd"], "AUTHORIZE");
        assert_eq!(encoded["nonce"], "n1");
        assert!(encoded.get("evt").is_none());
        assert!(encoded.get("data").is_none());
    }

    #[test]
    fn test_decode_ready_dispatch_with_null_nonce() {
        let frame =
            Frame::decode(r#"{"cmd":"DISPATCH","evt":"READY","nonce":null,"data":{"v":1}}"#)
                .unwrap();
        assert!(frame.is_ready());
        assert!(frame.nonce.is_none());
    }

    #[test]
    fn test_ready_user_reads_nested_username() {
        let frame = Frame::decode(
            r#"{"cmd":"DISPATCH","evt":"READY","data":{"v":1,"user":{"id":"1","username":"tester"}}}"#,
        )
        .unwrap();
        assert_eq!(frame.ready_user(), Some("tester"));

        let bare = Frame::decode(r#"{"cmd":"DISPATCH","evt":"READY","data":{"v":1}}"#).unwrap();
        assert!(bare.ready_user().is_none());
    }

    #[test]
    fn test_error_message_prefers_message_field() {
        let frame = Frame::decode(
            r#"{"cmd":"AUTHENTICATE","evt":"ERROR","nonce":"n","data":{"code":4009,"message":"Invalid access token"}}"#,
        )
        .unwrap();
        assert!(frame.is_error());
        assert_eq!(frame.error_message(), "Invalid access token");
    }

    #[test]
    fn test_error_message_without_message_field() {
        let frame = Frame::decode(r#"{"cmd":"X","evt":"ERROR","data":{"code":1}}"#).unwrap();
        assert_eq!(frame.error_message(), r#"{"code":1}"#);
    }

    #[test]
    fn test_label() {
        let frame = Frame::decode(r#"{"cmd":"DISPATCH","evt":"READY"}"#).unwrap();
        assert_eq!(frame.label(), "DISPATCH/READY");
    }
}
