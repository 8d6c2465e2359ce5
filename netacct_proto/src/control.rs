//! Control channel frames. A client connects to the daemon's Unix socket
//! and sends a single JSON object, e.g. `{"action": "add", "ip":
//! "10.0.0.5"}`. No response payload is sent; the connection is closed
//! after the frame is handled.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ControlRequest {
    /// `add` or `del`. Kept as a string so an unknown action can be
    /// logged as such instead of failing the whole decode.
    pub action: String,
    /// Dotted-quad IPv4 address to start or stop tracking.
    pub ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_add_frame() {
        let req: ControlRequest =
            serde_json::from_str(r#"{"action": "add", "ip": "10.0.0.5"}"#).unwrap();
        assert_eq!(req.action, "add");
        assert_eq!(req.ip, "10.0.0.5");
    }

    #[test]
    fn missing_field_fails_decode() {
        let result = serde_json::from_str::<ControlRequest>(r#"{"action": "add"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_action_still_decodes() {
        // The daemon decides what to do with the action string; decode
        // must not reject values it hasn't seen before.
        let req: ControlRequest =
            serde_json::from_str(r#"{"action": "purge", "ip": "10.0.0.5"}"#).unwrap();
        assert_eq!(req.action, "purge");
    }
}
