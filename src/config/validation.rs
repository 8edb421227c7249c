//! Normalization and validation helpers for configuration values.

use lettre::message::Mailbox;

use crate::error::{ConfigError, MailSettingsError};

/// Normalizes a hub endpoint into its WebSocket form.
///
/// Trims whitespace, strips trailing `/` separators, then rewrites an
/// `http://`/`https://` prefix to `ws://`/`wss://`. Applying it twice
/// yields the same value.
pub fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');

    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    }
}

/// Checks a normalized endpoint for the WebSocket scheme marker.
pub(crate) fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    if endpoint.len() < 3 || !endpoint.starts_with("ws") {
        return Err(ConfigError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(())
}

/// Trims an optional string, turning blank values into `None`.
pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses an address, reporting which config field it came from.
pub(crate) fn parse_mailbox(field: &str, value: &str) -> Result<Mailbox, MailSettingsError> {
    value
        .parse::<Mailbox>()
        .map_err(|e| MailSettingsError::InvalidAddress {
            field: field.to_string(),
            message: format!("'{}': {}", value, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_endpoint_rewrites_https_and_strips_separator() {
        assert_eq!(normalize_endpoint("https://host/"), "wss://host");
        assert_eq!(normalize_endpoint("http://host"), "ws://host");
    }

    #[test]
    fn normalize_endpoint_trims_whitespace() {
        assert_eq!(normalize_endpoint("  http://push.local:8080/ \n"), "ws://push.local:8080");
    }

    #[test]
    fn normalize_endpoint_keeps_ws_schemes() {
        assert_eq!(normalize_endpoint("ws://localhost"), "ws://localhost");
        assert_eq!(normalize_endpoint("wss://hub.example.com/gotify/"), "wss://hub.example.com/gotify");
    }

    #[test]
    fn normalize_endpoint_is_idempotent() {
        for raw in ["https://host//", "http://h/", " wss://x ", "ftp://nope/", ""] {
            let once = normalize_endpoint(raw);
            assert_eq!(normalize_endpoint(&once), once, "input {:?}", raw);
        }
    }

    #[test]
    fn validate_endpoint_rejects_short_or_foreign_schemes() {
        assert!(validate_endpoint("ws").is_err());
        assert!(validate_endpoint("").is_err());
        assert!(validate_endpoint("ftp://host").is_err());
        assert!(validate_endpoint("localhost").is_err());
        assert!(validate_endpoint("ws://localhost").is_ok());
        assert!(validate_endpoint("wss://localhost").is_ok());
    }

    #[test]
    fn non_blank_filters_whitespace() {
        assert_eq!(non_blank(Some("  ".to_string())), None);
        assert_eq!(non_blank(None), None);
        assert_eq!(non_blank(Some(" Ops ".to_string())), Some("Ops".to_string()));
    }

    #[test]
    fn parse_mailbox_reports_field() {
        let err = parse_mailbox("smtp.to", "not an address").unwrap_err();
        match err {
            MailSettingsError::InvalidAddress { field, message } => {
                assert_eq!(field, "smtp.to");
                assert!(message.contains("not an address"));
            }
            other => panic!("Expected InvalidAddress, got {:?}", other),
        }
        assert!(parse_mailbox("smtp.to", "ops@example.com").is_ok());
    }
}
