//! Test helpers: protocol fixtures and a reply builder.

/// Pre-built fixtures for handshake files and control port traffic.
pub mod fixtures {
    /// A well-formed 32-byte authentication cookie.
    pub const AUTH_COOKIE: [u8; 32] = [
        0x6c, 0x6e, 0x9d, 0x24, 0x78, 0xe6, 0x6d, 0x69, 0xd3, 0x2d, 0xc9, 0x90, 0x9a, 0x3c, 0x39,
        0x54, 0x2b, 0x37, 0xff, 0x30, 0xda, 0x5a, 0x90, 0x94, 0x44, 0xa4, 0x3d, 0x30, 0xd5, 0xa9,
        0x19, 0xef,
    ];

    /// Sample GETINFO version response.
    pub fn version_response() -> &'static str {
        "250-version=0.4.8.12 (git-abc123)\r\n\
         250 OK\r\n"
    }

    /// Sample GETINFO net/listeners/socks response.
    pub fn socks_listeners_response() -> &'static str {
        "250-net/listeners/socks=\"127.0.0.1:9050\" \"[::1]:9050\"\r\n\
         250 OK\r\n"
    }

    /// Sample bootstrap progress event.
    pub fn bootstrap_event() -> &'static str {
        "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=50 TAG=loading_descriptors SUMMARY=\"Loading relay descriptors\"\r\n"
    }

    /// Sample circuit established event.
    pub fn circuit_established_event() -> &'static str {
        "650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED\r\n"
    }

    /// Sample error response.
    pub fn error_response() -> &'static str {
        "552 Unrecognized key \"nope\"\r\n"
    }
}

/// Mock control protocol response builder.
#[derive(Debug, Clone, Default)]
pub struct MockTorResponse {
    lines: Vec<String>,
}

impl MockTorResponse {
    /// Create a new empty response builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a simple OK response.
    pub fn ok() -> Self {
        Self {
            lines: vec!["250 OK".to_string()],
        }
    }

    /// Create an error response.
    pub fn error(code: u16, message: &str) -> Self {
        Self {
            lines: vec![format!("{} {}", code, message)],
        }
    }

    /// Add a mid-reply line.
    pub fn data_line(mut self, line: &str) -> Self {
        self.lines.push(format!("250-{}", line));
        self
    }

    /// Add the final OK line.
    pub fn finish(mut self) -> Self {
        self.lines.push("250 OK".to_string());
        self
    }

    /// Build the response as a string.
    pub fn build(&self) -> String {
        self.lines.iter().map(|l| format!("{}\r\n", l)).collect()
    }

    /// Individual lines without line endings.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Decoded, LineDecoder};

    fn decode_all(text: &str) -> Vec<Decoded> {
        let mut decoder = LineDecoder::new();
        text.split("\r\n")
            .filter(|l| !l.is_empty())
            .filter_map(|l| decoder.push(l))
            .collect()
    }

    #[test]
    fn test_mock_response_ok() {
        assert_eq!(MockTorResponse::ok().build(), "250 OK\r\n");
    }

    #[test]
    fn test_mock_response_with_data() {
        let response = MockTorResponse::new()
            .data_line("version=0.4.8.12")
            .finish();
        assert_eq!(response.build(), "250-version=0.4.8.12\r\n250 OK\r\n");
        assert_eq!(response.lines().len(), 2);
    }

    #[test]
    fn test_mock_response_error() {
        let response = MockTorResponse::error(552, "Unknown option");
        assert_eq!(response.build(), "552 Unknown option\r\n");
    }

    #[test]
    fn test_fixtures_decode() {
        assert!(matches!(
            decode_all(fixtures::version_response()).as_slice(),
            [Decoded::Reply(r)] if r.value_of("version") == Some("0.4.8.12 (git-abc123)")
        ));
        assert!(matches!(
            decode_all(fixtures::bootstrap_event()).as_slice(),
            [Decoded::Async(_)]
        ));
        assert!(matches!(
            decode_all(fixtures::error_response()).as_slice(),
            [Decoded::Reply(r)] if !r.is_success()
        ));
    }
}
