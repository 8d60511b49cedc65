//! Minimal ICAP responder logic (RFC 3507 subset).
//!
//! Every adaptation request is answered with `204 No Content`: content passes
//! through unmodified. Only the request line is inspected.

use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVICE: &str = "WatchSec DLP 1.0";
pub const DEFAULT_ISTAG: &str = "WatchSec-DLP-v1";

/// ICAP method named by a request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IcapMethod {
    Options,
    Reqmod,
    Respmod,
}

impl IcapMethod {
    /// Classify the first line of a request. Anything else is `None`.
    pub fn classify(request_line: &str) -> Option<Self> {
        if request_line.starts_with("OPTIONS") {
            Some(IcapMethod::Options)
        } else if request_line.starts_with("REQMOD") {
            Some(IcapMethod::Reqmod)
        } else if request_line.starts_with("RESPMOD") {
            Some(IcapMethod::Respmod)
        } else {
            None
        }
    }
}

/// Fixed capability descriptor advertised by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcapCapabilities {
    pub service: String,
    pub istag: String,
}

impl Default for IcapCapabilities {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            istag: DEFAULT_ISTAG.to_string(),
        }
    }
}

impl IcapCapabilities {
    /// Render the full response (status line, headers, blank line) for
    /// `method`, using CRLF line endings.
    pub fn respond(&self, method: IcapMethod) -> String {
        let lines: Vec<String> = match method {
            IcapMethod::Options => vec![
                "ICAP/1.0 200 OK".into(),
                "Methods: RESPMOD, REQMOD".into(),
                format!("Service: {}", self.service),
                format!("ISTag: \"{}\"", self.istag),
                "Allow: 204".into(),
                "Encapsulated: null-body=0".into(),
            ],
            IcapMethod::Reqmod | IcapMethod::Respmod => vec![
                "ICAP/1.0 204 No Content".into(),
                format!("ISTag: \"{}\"", self.istag),
                "Encapsulated: null-body=0".into(),
            ],
        };
        let mut out = lines.join("\r\n");
        out.push_str("\r\n\r\n");
        out
    }
}
