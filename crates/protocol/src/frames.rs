//! Tunnel frame schema: a tagged union keyed by `type`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One exposed service on a tunneled workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single tunnel frame. Wire field names are camelCase; body bytes travel
/// base64-encoded in `data` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TunnelFrame {
    /// First frame on a connection: the agent presents its tunnel JWT.
    Auth {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    /// Port announcement. Transitions the workspace to running on first
    /// receipt; later frames update the exposed-ports map.
    Open {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(
            default,
            rename = "exposedPorts",
            skip_serializing_if = "Option::is_none"
        )]
        exposed_ports: Option<HashMap<String, ExposedPort>>,
    },
    /// Cancel the in-flight exchange for `id`. The agent may abort its
    /// upstream fetch.
    Close { id: String },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    /// Broker → agent: forward one inbound HTTP request.
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        port: u16,
    },
    /// Agent → broker: upstream status and headers for `id`.
    Response {
        id: String,
        #[serde(rename = "statusCode")]
        status_code: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Body chunk for either direction. `final` marks the last chunk; an
    /// empty body is a single frame with `final=true` and no `data`.
    Data {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, rename = "final")]
        is_final: bool,
    },
    /// Non-fatal condition on one exchange, or connection-level when `id`
    /// is absent.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
    /// Forward-compatibility: unrecognized frame types parse to this variant
    /// and are dropped by both peers.
    #[serde(other)]
    Unknown,
}

impl TunnelFrame {
    /// Encode body bytes into a `data` frame.
    #[must_use]
    pub fn data(id: impl Into<String>, bytes: &[u8], is_final: bool) -> Self {
        use base64::Engine;
        let data = if bytes.is_empty() {
            None
        } else {
            Some(base64::engine::general_purpose::STANDARD.encode(bytes))
        };
        Self::Data {
            id: id.into(),
            data,
            is_final,
        }
    }

    /// Decode the payload of a `data` frame. Non-data frames and malformed
    /// base64 yield an empty buffer.
    #[must_use]
    pub fn data_bytes(&self) -> Vec<u8> {
        use base64::Engine;
        match self {
            Self::Data {
                data: Some(encoded),
                ..
            } => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_tag_on_type() {
        let frame = TunnelFrame::Request {
            id: "r1".into(),
            method: "GET".into(),
            path: "/healthz".into(),
            headers: HashMap::from([("host".into(), "api.demo.example.dev".into())]),
            port: 4000,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["port"], 4000);

        let back: TunnelFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn response_uses_camel_case_status() {
        let frame = TunnelFrame::Response {
            id: "r1".into(),
            status_code: 502,
            headers: HashMap::new(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["statusCode"], 502);
    }

    #[test]
    fn data_round_trip() {
        let frame = TunnelFrame::data("r1", b"hello body", true);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"final\":true"));

        let back: TunnelFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data_bytes(), b"hello body");
    }

    #[test]
    fn empty_body_omits_data_field() {
        let frame = TunnelFrame::data("r1", b"", true);
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("data").is_none());
        assert_eq!(frame.data_bytes(), Vec::<u8>::new());
    }

    #[test]
    fn unknown_type_parses_without_error() {
        let frame: TunnelFrame =
            serde_json::from_str(r#"{"type":"telemetry","id":"x","payload":{}}"#).unwrap();
        assert_eq!(frame, TunnelFrame::Unknown);
    }

    #[test]
    fn open_announcement_parses() {
        let frame: TunnelFrame = serde_json::from_str(
            r#"{"type":"open","port":3000,"exposedPorts":{"api":{"port":4000,"description":"backend"}}}"#,
        )
        .unwrap();
        let TunnelFrame::Open {
            port,
            exposed_ports,
        } = frame
        else {
            panic!("expected open frame");
        };
        assert_eq!(port, Some(3000));
        assert_eq!(exposed_ports.unwrap()["api"].port, 4000);
    }
}
