//! Tunnel output scanning

use once_cell::sync::Lazy;
use regex::Regex;

static PUBLIC_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("valid tunnel URL regex"));

static RATE_LIMITED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b429\b|too many requests").expect("valid rate limit regex"));

/// Public tunnel URL announced in a line of output
pub fn find_public_url(line: &str) -> Option<String> {
    PUBLIC_URL_RE
        .find_iter(line)
        .map(|m| m.as_str())
        // The API endpoint shows up in error messages, never as a tunnel
        .find(|url| *url != "https://api.trycloudflare.com")
        .map(str::to_string)
}

pub fn is_rate_limited(line: &str) -> bool {
    RATE_LIMITED_RE.is_match(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_in_banner() {
        let line = "2024-05-01T10:00:00Z INF |  https://quiet-lake-1234.trycloudflare.com                  |";
        assert_eq!(
            find_public_url(line),
            Some("https://quiet-lake-1234.trycloudflare.com".to_string())
        );
        assert_eq!(find_public_url("Requesting new quick Tunnel on trycloudflare.com..."), None);
        assert_eq!(
            find_public_url("failed to request quick Tunnel: Post \"https://api.trycloudflare.com/tunnel\""),
            None
        );
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(is_rate_limited(
            "ERR Error unmarshaling QuickTunnel response: error code: 1015 status_code=\"429 Too Many Requests\""
        ));
        assert!(!is_rate_limited("INF Registered tunnel connection connIndex=0 location=ams14"));
        assert!(!is_rate_limited("INF Version 2024.4290.0"));
    }
}
