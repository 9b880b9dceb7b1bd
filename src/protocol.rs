//! Protocol message parsing and formatting.
//!
//! This module handles the low-level framing of the control port: every
//! inbound line carries a 3-digit status code and a separator, and lines are
//! grouped into replies (answers to commands) or asynchronous notifications
//! (code 650) by [`LineDecoder`].

use crate::error::{Result, StatusCode, TorLauncherError};
use std::collections::HashMap;
use std::mem;

/// Status code carried by asynchronous notifications.
pub const ASYNC_EVENT_CODE: u16 = 650;

/// The role of a line within a reply, taken from its separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `-`: more lines follow.
    Mid,
    /// `+`: a data block terminated by a lone `.` follows.
    Data,
    /// ` `: last line of the reply.
    End,
}

/// A raw reply line from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// The 3-digit status code.
    pub code: u16,
    /// Role of the line, from its separator.
    pub kind: LineKind,
    /// The text content of the line.
    pub text: String,
}

impl ReplyLine {
    /// Parse a reply line from a string.
    pub fn parse(line: &str) -> Result<Self> {
        if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
            return Err(TorLauncherError::ProtocolError(format!(
                "Reply line too short: '{}'",
                line
            )));
        }

        let code_text = &line[..3];
        if !code_text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TorLauncherError::ProtocolError(format!(
                "Invalid status code in: '{}'",
                line
            )));
        }
        let code: u16 = code_text.parse().map_err(|_| {
            TorLauncherError::ProtocolError(format!("Invalid status code in: '{}'", line))
        })?;

        let kind = match &line[3..4] {
            "-" => LineKind::Mid,
            "+" => LineKind::Data,
            " " => LineKind::End,
            other => {
                return Err(TorLauncherError::ProtocolError(format!(
                    "Invalid separator '{}' in: '{}'",
                    other, line
                )))
            }
        };

        Ok(ReplyLine {
            code,
            kind,
            text: line[4..].to_string(),
        })
    }

    /// Check if this is the final line of a reply.
    pub fn is_end(&self) -> bool {
        self.kind == LineKind::End
    }

    /// Check if this line opens a data block.
    pub fn is_data(&self) -> bool {
        self.kind == LineKind::Data
    }

    /// Check if this line belongs to an asynchronous notification.
    pub fn is_async(&self) -> bool {
        self.code == ASYNC_EVENT_CODE
    }
}

/// A complete reply, potentially spanning multiple lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The status code of the terminating line.
    pub code: u16,
    /// All reply lines, data blocks folded into their opening line.
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Create a new Reply from a list of reply lines.
    pub fn new(lines: Vec<ReplyLine>) -> Result<Self> {
        let code = match lines.last() {
            Some(last) => last.code,
            None => return Err(TorLauncherError::ProtocolError("Empty reply".to_string())),
        };
        Ok(Reply { code, lines })
    }

    /// Get the status code as an enum.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code)
    }

    /// Check if this reply indicates success.
    pub fn is_success(&self) -> bool {
        self.status_code().is_success()
    }

    /// Check if this is an asynchronous notification.
    pub fn is_async_event(&self) -> bool {
        self.code == ASYNC_EVENT_CODE
    }

    /// Get all text lines concatenated.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Get the first line's text.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(|l| l.text.as_str()).unwrap_or("")
    }

    /// Find the value of a `key=value` line.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.text
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    /// Convert this reply into a Result, returning an error if the reply indicates failure.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TorLauncherError::CommandRejected {
                code: self.code,
                message: self.text(),
            })
        }
    }
}

/// One unit produced by [`LineDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete synchronous reply, answering the oldest outstanding command.
    Reply(Reply),
    /// A complete asynchronous notification.
    Async(Reply),
    /// A line that does not follow the framing.
    Unparsed(String),
}

#[derive(Debug)]
struct DataBlock {
    head: ReplyLine,
    lines: Vec<String>,
}

/// Groups inbound lines into replies and asynchronous notifications.
///
/// Synchronous and asynchronous lines are collected separately, so a
/// notification interleaved with a multi-line reply is emitted as soon as
/// its own terminating line arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    reply: Vec<ReplyLine>,
    event: Vec<ReplyLine>,
    data: Option<DataBlock>,
}

impl LineDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its line ending).
    pub fn push(&mut self, line: &str) -> Option<Decoded> {
        if let Some(block) = self.data.as_mut() {
            if line == "." {
                let block = self.data.take()?;
                let mut head = block.head;
                head.text = format!("{}\n{}", head.text, block.lines.join("\n"));
                // the block's head is never the terminal line
                self.lines_for(head.code).push(head);
                return None;
            }
            // Remove leading dot escape
            let line = if line.starts_with("..") {
                &line[1..]
            } else {
                line
            };
            block.lines.push(line.to_string());
            return None;
        }

        let parsed = match ReplyLine::parse(line) {
            Ok(parsed) => parsed,
            Err(_) => return Some(Decoded::Unparsed(line.to_string())),
        };

        if parsed.is_data() {
            self.data = Some(DataBlock {
                head: parsed,
                lines: Vec::new(),
            });
            return None;
        }

        let is_async = parsed.is_async();
        let is_end = parsed.is_end();
        let lines = self.lines_for(parsed.code);
        lines.push(parsed);
        if !is_end {
            return None;
        }

        let reply = Reply::new(mem::take(lines)).ok()?;
        Some(if is_async {
            Decoded::Async(reply)
        } else {
            Decoded::Reply(reply)
        })
    }

    fn lines_for(&mut self, code: u16) -> &mut Vec<ReplyLine> {
        if code == ASYNC_EVENT_CODE {
            &mut self.event
        } else {
            &mut self.reply
        }
    }
}

/// Parse keyword=value pairs from a reply line.
pub fn parse_key_value_pairs(text: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        remaining = remaining.trim_start();
        if remaining.is_empty() {
            break;
        }

        let key_end = match remaining.find('=') {
            Some(pos) => pos,
            None => break,
        };

        // Skip bare words preceding the next key.
        if let Some(space) = remaining[..key_end].rfind(' ') {
            remaining = &remaining[space + 1..];
            continue;
        }

        let key = remaining[..key_end].to_string();
        remaining = &remaining[key_end + 1..];

        let (value, rest) = if remaining.starts_with('"') {
            parse_quoted_string(remaining)
        } else {
            let end = remaining.find(' ').unwrap_or(remaining.len());
            (remaining[..end].to_string(), &remaining[end..])
        };

        result.insert(key, value);
        remaining = rest;
    }

    result
}

/// Parse a quoted string, handling escape sequences.
fn parse_quoted_string(s: &str) -> (String, &str) {
    if !s.starts_with('"') {
        return (String::new(), s);
    }

    let mut result = String::new();
    let mut chars = s[1..].chars().peekable();
    let mut consumed = 1;

    while let Some(c) = chars.next() {
        consumed += c.len_utf8();
        if c == '"' {
            break;
        } else if c == '\\' {
            if let Some(&next) = chars.peek() {
                consumed += next.len_utf8();
                chars.next();
                match next {
                    'n' => result.push('\n'),
                    'r' => result.push('\r'),
                    't' => result.push('\t'),
                    _ => result.push(next),
                }
            }
        } else {
            result.push(c);
        }
    }

    (result, &s[consumed..])
}

/// Format a command with arguments.
pub fn format_command(keyword: &str, args: &[&str]) -> String {
    let mut cmd = keyword.to_string();
    for arg in args {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    cmd.push_str("\r\n");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut LineDecoder, lines: &[&str]) -> Vec<Decoded> {
        lines.iter().filter_map(|l| decoder.push(l)).collect()
    }

    #[test]
    fn test_reply_line_parsing() {
        let line = ReplyLine::parse("250 OK").unwrap();
        assert_eq!(line.code, 250);
        assert_eq!(line.kind, LineKind::End);
        assert_eq!(line.text, "OK");
        assert!(line.is_end());

        let mid = ReplyLine::parse("250-version=0.4.8.10").unwrap();
        assert_eq!(mid.kind, LineKind::Mid);

        let data = ReplyLine::parse("250+config-text=").unwrap();
        assert!(data.is_data());

        let event = ReplyLine::parse("650 NETWORK_LIVENESS UP").unwrap();
        assert!(event.is_async());
    }

    #[test]
    fn test_reply_line_rejects_bad_framing() {
        assert!(ReplyLine::parse("25").is_err());
        assert!(ReplyLine::parse("").is_err());
        assert!(ReplyLine::parse("ABC OK").is_err());
        assert!(ReplyLine::parse("+50 OK").is_err());
        assert!(ReplyLine::parse("250/OK").is_err());
    }

    #[test]
    fn test_reply_line_minimal() {
        let line = ReplyLine::parse("250 ").unwrap();
        assert_eq!(line.code, 250);
        assert!(line.text.is_empty());
    }

    #[test]
    fn test_reply_status_and_values() {
        let reply = Reply::new(vec![
            ReplyLine::parse("250-version=0.4.8.12").unwrap(),
            ReplyLine::parse("250 OK").unwrap(),
        ])
        .unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.value_of("version"), Some("0.4.8.12"));
        assert_eq!(reply.value_of("missing"), None);

        let rejected = Reply::new(vec![ReplyLine::parse("515 Bad auth").unwrap()]).unwrap();
        assert!(matches!(
            rejected.into_result(),
            Err(TorLauncherError::CommandRejected { code: 515, .. })
        ));
        assert!(Reply::new(vec![]).is_err());
    }

    #[test]
    fn test_decoder_groups_multiline_reply() {
        let mut decoder = LineDecoder::new();
        let out = feed(
            &mut decoder,
            &["250-version=0.4.8.12", "250 OK"],
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            Decoded::Reply(reply) => {
                assert_eq!(reply.lines.len(), 2);
                assert_eq!(reply.value_of("version"), Some("0.4.8.12"));
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_decoder_emits_interleaved_event_first() {
        let mut decoder = LineDecoder::new();
        let out = feed(
            &mut decoder,
            &[
                "250-net/listeners/socks=\"127.0.0.1:9050\"",
                "650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED",
                "250 OK",
            ],
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Decoded::Async(r) if r.first_line().starts_with("STATUS_CLIENT")));
        assert!(matches!(&out[1], Decoded::Reply(r) if r.lines.len() == 2));
    }

    #[test]
    fn test_decoder_data_block() {
        let mut decoder = LineDecoder::new();
        let out = feed(
            &mut decoder,
            &["250+info=", "line one", "..dotted", ".", "250 OK"],
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            Decoded::Reply(reply) => {
                assert_eq!(reply.first_line(), "info=\nline one\n.dotted");
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_decoder_surfaces_garbage() {
        let mut decoder = LineDecoder::new();
        let out = feed(&mut decoder, &["garbage", "250 OK"]);
        assert_eq!(out[0], Decoded::Unparsed("garbage".to_string()));
        assert!(matches!(&out[1], Decoded::Reply(_)));
    }

    #[test]
    fn test_key_value_parsing() {
        let pairs = parse_key_value_pairs("KEY1=value1 KEY2=\"quoted value\"");
        assert_eq!(pairs.get("KEY1"), Some(&"value1".to_string()));
        assert_eq!(pairs.get("KEY2"), Some(&"quoted value".to_string()));
    }

    #[test]
    fn test_key_value_skips_bare_words() {
        let pairs = parse_key_value_pairs("NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_conn");
        assert_eq!(pairs.get("PROGRESS"), Some(&"85".to_string()));
        assert_eq!(pairs.get("TAG"), Some(&"ap_conn".to_string()));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_key_value_with_escaped_chars() {
        let pairs = parse_key_value_pairs(r#"MSG="line1\nline2" PATH="C:\\Tor""#);
        assert_eq!(pairs.get("MSG"), Some(&"line1\nline2".to_string()));
        assert_eq!(pairs.get("PATH"), Some(&"C:\\Tor".to_string()));
    }

    #[test]
    fn test_command_formatting() {
        let cmd = format_command("SETEVENTS", &["STATUS_CLIENT", "STREAM"]);
        assert_eq!(cmd, "SETEVENTS STATUS_CLIENT STREAM\r\n");
        assert_eq!(format_command("TAKEOWNERSHIP", &[]), "TAKEOWNERSHIP\r\n");
    }
}
