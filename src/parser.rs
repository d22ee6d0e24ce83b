use serde::Deserialize;

use crate::error::FeedbackError;
use crate::protocol::DOWNLINK_MARKER;
use crate::telemetry::{Downlink, FeedbackMessage};

/// Parse a downlink line.
/// Format: "mac_rx <port> <hexdata>"
pub fn parse_downlink(line: &str) -> Option<Downlink> {
    let mut parts = line.split_whitespace();
    if parts.next()? != DOWNLINK_MARKER {
        return None;
    }

    let port: u8 = parts.next()?.parse().ok()?;
    let bytes = hex::decode(parts.next()?).ok()?;

    Some(Downlink {
        port,
        message: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Parse the bare numeric reply of a `mac get` query.
pub fn parse_value(line: &str) -> Option<u8> {
    line.trim().parse().ok()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

impl NumberOrString {
    fn as_f64(&self) -> Option<f64> {
        match self {
            NumberOrString::Number(n) => Some(*n),
            NumberOrString::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct UplinkRecord {
    devaddr: String,
    best_gw: BestGateway,
}

#[derive(Deserialize)]
struct BestGateway {
    lsnr: NumberOrString,
    #[serde(default)]
    desc: Option<String>,
}

/// Parse a network-server uplink record.
/// Format: {"devaddr": "...", "best_gw": {"lsnr": <number|string>, "desc": "..."}, ...}
pub fn parse_feedback(json: &serde_json::Value) -> Result<FeedbackMessage, FeedbackError> {
    let record = UplinkRecord::deserialize(json)?;
    let snr = record.best_gw.lsnr.as_f64().ok_or_else(|| {
        <serde_json::Error as serde::de::Error>::custom("best_gw.lsnr is not a number")
    })?;

    Ok(FeedbackMessage {
        dev_addr: record.devaddr,
        snr,
        gateway: record.best_gw.desc.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_downlink_payload() {
        let downlink = parse_downlink("mac_rx 1 48656c6c6f").unwrap();
        assert_eq!(downlink.port, 1);
        assert_eq!(downlink.message, "Hello");
    }

    #[test]
    fn rejects_non_downlink_lines() {
        assert!(parse_downlink("mac_tx_ok").is_none());
        assert!(parse_downlink("mac_rx 1").is_none());
        assert!(parse_downlink("mac_rx 1 zz").is_none());
    }

    #[test]
    fn parses_query_values() {
        assert_eq!(parse_value("5"), Some(5));
        assert_eq!(parse_value(" 3 "), Some(3));
        assert_eq!(parse_value("invalid_param"), None);
    }

    use serde_json::json;

    #[test]
    fn parses_feedback_with_numeric_snr() {
        let record = json!({"devaddr": "260B1234", "best_gw": {"lsnr": -7.25, "desc": "gw-roof"}, "fcnt": 3});
        let msg = parse_feedback(&record).unwrap();
        assert_eq!(msg.dev_addr, "260B1234");
        assert_eq!(msg.snr, -7.25);
        assert_eq!(msg.gateway, "gw-roof");
    }

    #[test]
    fn parses_feedback_with_string_snr() {
        let record = json!({"devaddr": "260B1234", "best_gw": {"lsnr": "5.5"}});
        let msg = parse_feedback(&record).unwrap();
        assert_eq!(msg.snr, 5.5);
        assert_eq!(msg.gateway, "");
    }

    #[test]
    fn malformed_feedback_is_an_error() {
        assert!(parse_feedback(&json!("not a record")).is_err());
        assert!(parse_feedback(&json!({"devaddr": "260B1234"})).is_err());
        assert!(parse_feedback(&json!({"devaddr": "1", "best_gw": {"lsnr": "n/a"}})).is_err());
    }
}
