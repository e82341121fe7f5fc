//! Handshake line sent by an agent right after the shell opens
//!
//! The agent announces itself with a single line:
//!
//! ```text
//! -HELLO FROM CLIENT: id=<id> broker=<url> address=<ip> port=<n> username=<u> password=<p> cert=<pem>
//! ```
//!
//! Tokens are separated by single spaces, so values that naturally contain
//! whitespace are escaped by the agent: `~~` stands for a space, and inside
//! certificates `##` stands for CRLF and `$$` for LF.

/// Prefix identifying the handshake line
pub const GREETING_PREFIX: &str = "-HELLO FROM CLIENT:";

/// Identity and broker details announced by an agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Greeting {
    pub client_id: Option<String>,
    pub broker_url: Option<String>,
    pub address: Option<String>,
    /// Only values within `1..=65535` are kept
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub certificate: Option<String>,
    /// Tokens that matched no known key
    pub unknown: Vec<String>,
}

impl Greeting {
    /// Parse the part of the handshake line following [`GREETING_PREFIX`]
    pub fn parse(tokens: &str) -> Self {
        let mut greeting = Greeting::default();

        for token in tokens.split_whitespace() {
            if let Some(v) = token.strip_prefix("id=") {
                greeting.client_id = Some(v.replace("~~", " "));
            } else if let Some(v) = token.strip_prefix("broker=") {
                greeting.broker_url = Some(v.to_string());
            } else if let Some(v) = token.strip_prefix("address=") {
                greeting.address = Some(v.to_string()).filter(|a| !a.is_empty());
            } else if let Some(v) = token.strip_prefix("port=") {
                match v.parse::<u16>() {
                    Ok(port) if port > 0 => greeting.port = Some(port),
                    _ => tracing::warn!("Invalid port value in greeting: {}", v),
                }
            } else if let Some(v) = token.strip_prefix("username=") {
                greeting.username = Some(v.to_string());
            } else if let Some(v) = token.strip_prefix("password=") {
                greeting.password = Some(v.to_string());
            } else if let Some(v) = token.strip_prefix("cert=") {
                greeting.certificate = Some(unescape_certificate(v));
            } else {
                greeting.unknown.push(token.to_string());
            }
        }

        greeting
    }

    /// Certificate text if one was presented and it is not blank
    pub fn certificate(&self) -> Option<&str> {
        self.certificate
            .as_deref()
            .filter(|c| !c.trim().is_empty())
    }
}

fn unescape_certificate(raw: &str) -> String {
    raw.replace("~~", " ")
        .replace("##", "\r\n")
        .replace("$$", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_greeting() {
        let g = Greeting::parse(
            " id=vm~~one broker=ssl://10.0.0.1:61617 address=10.0.0.9 port=2022 username=u password=p",
        );
        assert_eq!(g.client_id.as_deref(), Some("vm one"));
        assert_eq!(g.broker_url.as_deref(), Some("ssl://10.0.0.1:61617"));
        assert_eq!(g.address.as_deref(), Some("10.0.0.9"));
        assert_eq!(g.port, Some(2022));
        assert_eq!(g.username.as_deref(), Some("u"));
        assert_eq!(g.password.as_deref(), Some("p"));
        assert!(g.unknown.is_empty());
    }

    #[test]
    fn test_certificate_unescaping() {
        let g = Greeting::parse("cert=-----BEGIN~~CERT-----##abc$$-----END~~CERT-----");
        assert_eq!(
            g.certificate(),
            Some("-----BEGIN CERT-----\r\nabc\n-----END CERT-----")
        );
    }

    #[test]
    fn test_invalid_port_is_dropped() {
        assert_eq!(Greeting::parse("port=0").port, None);
        assert_eq!(Greeting::parse("port=70000").port, None);
        assert_eq!(Greeting::parse("port=abc").port, None);
    }

    #[test]
    fn test_unknown_tokens_are_collected() {
        let g = Greeting::parse("id=a colour=blue");
        assert_eq!(g.unknown, vec!["colour=blue".to_string()]);
    }

    #[test]
    fn test_blank_certificate_is_ignored() {
        let g = Greeting::parse("cert=");
        assert_eq!(g.certificate(), None);
    }
}
