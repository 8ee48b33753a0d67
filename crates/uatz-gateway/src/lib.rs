pub mod bridge;
pub mod client;
pub mod connection;
pub mod error;
pub mod health;
pub mod ingest;
pub mod listener;
pub mod registry;
pub mod sink;
pub mod webhook;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;

pub use error::{GatewayError, Result};

/// Longest prefix of `text` no longer than `max` bytes that ends on a char
/// boundary, for quoting raw payloads in log lines.
pub(crate) fn excerpt(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::excerpt;

    #[test]
    fn excerpt_stops_on_char_boundary() {
        assert_eq!(excerpt("short", 200), "short");

        let body = format!("a{}", "ã".repeat(150));
        let cut = excerpt(&body, 200);
        assert_eq!(cut.len(), 199);
        assert!(body.starts_with(cut));

        assert_eq!(excerpt("ããã", 1), "");
    }
}
