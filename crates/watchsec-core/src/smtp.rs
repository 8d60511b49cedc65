//! SMTP-like interception session.
//!
//! A deliberately small, non-pipelined subset of SMTP: enough for a mail
//! client to hand over one or more messages so their envelope and a short
//! preview can be logged. [`MailSession::feed`] is the whole state machine;
//! it takes one line (without its terminator) and returns the reply to write
//! plus any side effect the caller must carry out.

use serde::{Deserialize, Serialize};

/// Number of body characters kept in a message preview.
pub const BODY_PREVIEW_CHARS: usize = 100;

/// Upper bound on buffered body bytes per message.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

pub const REPLY_HELLO: &str = "250 Hello";
pub const REPLY_OK: &str = "250 OK";
pub const REPLY_START_DATA: &str = "354 end data with <CR><LF>.<CR><LF>";
pub const REPLY_ACCEPTED: &str = "250 OK message accepted";
pub const REPLY_BYE: &str = "221 bye";
pub const REPLY_UNRECOGNIZED: &str = "502 command not recognized";
pub const REPLY_IDLE_TIMEOUT: &str = "421 idle timeout";

/// Greeting written as soon as a connection is accepted.
pub fn greeting(banner: &str) -> String {
    format!("220 {banner}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailPhase {
    AwaitCommand,
    InData,
}

/// Envelope and preview of a completed message, ready to be timestamped
/// and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailEnvelope {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body_preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailEffect {
    /// A DATA block finished; persist it.
    Deliver(MailEnvelope),
    /// The client said QUIT; close after writing the reply.
    Close,
}

/// Result of feeding one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailStep {
    pub reply: Option<&'static str>,
    pub effect: Option<MailEffect>,
}

impl MailStep {
    fn reply(reply: &'static str) -> Self {
        Self {
            reply: Some(reply),
            effect: None,
        }
    }

    fn silent() -> Self {
        Self {
            reply: None,
            effect: None,
        }
    }
}

/// Per-connection session state.
#[derive(Debug, Clone)]
pub struct MailSession {
    phase: MailPhase,
    sender: String,
    recipient: String,
    subject: String,
    body: String,
    in_headers: bool,
    max_body_bytes: usize,
}

impl Default for MailSession {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_BYTES)
    }
}

impl MailSession {
    pub fn new(max_body_bytes: usize) -> Self {
        Self {
            phase: MailPhase::AwaitCommand,
            sender: String::new(),
            recipient: String::new(),
            subject: String::new(),
            body: String::new(),
            in_headers: true,
            max_body_bytes,
        }
    }

    pub fn phase(&self) -> MailPhase {
        self.phase
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Advance the session by one line.
    pub fn feed(&mut self, line: &str) -> MailStep {
        if line.starts_with("HELO") || line.starts_with("EHLO") {
            return MailStep::reply(REPLY_HELLO);
        }
        if line.starts_with("QUIT") {
            return MailStep {
                reply: Some(REPLY_BYE),
                effect: Some(MailEffect::Close),
            };
        }

        match self.phase {
            MailPhase::InData => self.feed_data(line),
            MailPhase::AwaitCommand => self.feed_command(line),
        }
    }

    fn feed_command(&mut self, line: &str) -> MailStep {
        if let Some(rest) = line.strip_prefix("MAIL FROM:") {
            self.sender = parse_address(rest);
            MailStep::reply(REPLY_OK)
        } else if let Some(rest) = line.strip_prefix("RCPT TO:") {
            self.recipient = parse_address(rest);
            MailStep::reply(REPLY_OK)
        } else if line.starts_with("DATA") {
            self.phase = MailPhase::InData;
            self.in_headers = true;
            MailStep::reply(REPLY_START_DATA)
        } else if line.starts_with("RSET") {
            self.reset_envelope();
            MailStep::reply(REPLY_OK)
        } else if line.starts_with("NOOP") {
            MailStep::reply(REPLY_OK)
        } else {
            MailStep::reply(REPLY_UNRECOGNIZED)
        }
    }

    fn feed_data(&mut self, line: &str) -> MailStep {
        if line == "." {
            let envelope = MailEnvelope {
                sender: std::mem::take(&mut self.sender),
                recipient: std::mem::take(&mut self.recipient),
                subject: std::mem::take(&mut self.subject),
                body_preview: preview(&self.body),
            };
            self.reset_envelope();
            return MailStep {
                reply: Some(REPLY_ACCEPTED),
                effect: Some(MailEffect::Deliver(envelope)),
            };
        }

        if self.in_headers {
            if line.is_empty() {
                self.in_headers = false;
            } else if let Some(subject) = strip_prefix_ignore_case(line, "Subject:") {
                self.subject = subject.trim().to_string();
            }
        }

        if self.body.len() + line.len() + 1 <= self.max_body_bytes {
            self.body.push_str(line);
            self.body.push('\n');
        }
        MailStep::silent()
    }

    fn reset_envelope(&mut self) {
        self.phase = MailPhase::AwaitCommand;
        self.sender.clear();
        self.recipient.clear();
        self.subject.clear();
        self.body.clear();
        self.in_headers = true;
    }
}

/// Extract the address from the argument of `MAIL FROM:` / `RCPT TO:`.
///
/// `" <a@x> SIZE=10"` → `"a@x"`; a bare `"a@x"` is accepted as well.
fn parse_address(arg: &str) -> String {
    let arg = arg.trim();
    let addr = match arg.strip_prefix('<') {
        Some(inner) => inner.split('>').next().unwrap_or(inner),
        None => arg.split_whitespace().next().unwrap_or(""),
    };
    addr.trim_matches(|c: char| c == '<' || c == '>' || c.is_whitespace())
        .to_string()
}

fn preview(body: &str) -> String {
    body.trim_end_matches(['\r', '\n'])
        .chars()
        .take(BODY_PREVIEW_CHARS)
        .collect()
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}
