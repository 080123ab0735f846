use std::time::SystemTime;

use serde_json::{Value, json};

pub const CALL: u64 = 2;
pub const CALL_RESULT: u64 = 3;
pub const CALL_ERROR: u64 = 4;

/// Call id used in a CallError when the offending frame did not carry a readable one.
pub const UNKNOWN_CALL_ID: &str = "-1";

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Call { call_id: String, action: String },
    /// CallResult or CallError sent by the charge point; nothing to answer.
    Response,
    Malformed { call_id: Option<String>, reason: &'static str },
}

pub fn classify(text: &str) -> Inbound {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) else {
        return Inbound::Malformed {
            call_id: None,
            reason: "frame is not a JSON array",
        };
    };

    let call_id = items.get(1).and_then(Value::as_str).map(str::to_string);
    match items.first().and_then(Value::as_u64) {
        Some(CALL) => {
            let action = items.get(2).and_then(Value::as_str);
            match (call_id, action, items.len()) {
                (Some(call_id), Some(action), 4) if !action.is_empty() => Inbound::Call {
                    call_id,
                    action: action.to_string(),
                },
                (call_id, _, _) => Inbound::Malformed {
                    call_id,
                    reason: "call must be [2, id, action, payload]",
                },
            }
        }
        Some(CALL_RESULT) | Some(CALL_ERROR) => Inbound::Response,
        _ => Inbound::Malformed {
            call_id,
            reason: "unknown message type",
        },
    }
}

/// CallResult payload for an accepted call. Actions without a canned answer get `{}`.
pub fn result_payload(action: &str, transaction_id: u64) -> Value {
    let now = humantime::format_rfc3339_millis(SystemTime::now()).to_string();
    match action {
        "BootNotification" => json!({ "status": "Accepted", "currentTime": now, "interval": 300 }),
        "Heartbeat" => json!({ "currentTime": now }),
        "Authorize" | "StopTransaction" => json!({ "idTagInfo": { "status": "Accepted" } }),
        "StartTransaction" => json!({
            "idTagInfo": { "status": "Accepted" },
            "transactionId": transaction_id,
        }),
        _ => json!({}),
    }
}

pub fn call_result(call_id: &str, payload: Value) -> String {
    json!([CALL_RESULT, call_id, payload]).to_string()
}

pub fn format_violation(call_id: Option<&str>, reason: &str) -> String {
    json!([
        CALL_ERROR,
        call_id.unwrap_or(UNKNOWN_CALL_ID),
        "FormatViolation",
        reason,
        {}
    ])
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_call_is_recognized() {
        assert_eq!(
            classify(r#"[2,"7","Heartbeat",{}]"#),
            Inbound::Call {
                call_id: "7".to_string(),
                action: "Heartbeat".to_string(),
            }
        );
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let frame = r#"[2,"6","Authorize",[2, "8", "Authorize", {"idTag": "x"}]"#;
        assert!(matches!(
            classify(frame),
            Inbound::Malformed { call_id: None, .. }
        ));
    }

    #[test]
    fn call_with_wrong_arity_keeps_its_id() {
        assert_eq!(
            classify(r#"[2,"9","Heartbeat"]"#),
            Inbound::Malformed {
                call_id: Some("9".to_string()),
                reason: "call must be [2, id, action, payload]",
            }
        );
    }

    #[test]
    fn charge_point_responses_are_not_answered() {
        assert_eq!(classify(r#"[3,"1",{}]"#), Inbound::Response);
        assert_eq!(
            classify(r#"[4,"1","NotImplemented","",{}]"#),
            Inbound::Response
        );
    }

    #[test]
    fn replies_are_compact_arrays() {
        assert_eq!(call_result("1", json!({})), r#"[3,"1",{}]"#);
        assert_eq!(
            format_violation(None, "bad"),
            r#"[4,"-1","FormatViolation","bad",{}]"#
        );
        let start = result_payload("StartTransaction", 12);
        assert_eq!(start["transactionId"], json!(12));
        assert_eq!(start["idTagInfo"]["status"], json!("Accepted"));
    }
}
