// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transport-error classification (spec §4.8, SPEC_FULL.md §7): turns a
//! `reqwest::Error` into a [`TransportErrorInfo`] with a user-facing message,
//! troubleshooting steps, and a retry/HTTP-status verdict. Grounded on the
//! upstream's own error-classification module, which inspects the
//! underlying cause chain rather than treating every network failure alike.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    DnsResolution,
    ConnectionRefused,
    ConnectionReset,
    NetworkUnreachable,
    SslError,
    TimeoutConnect,
    TimeoutRead,
    TooManyRedirects,
    ProxyError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::DnsResolution => "dns_resolution",
            ErrorCategory::ConnectionRefused => "connection_refused",
            ErrorCategory::ConnectionReset => "connection_reset",
            ErrorCategory::NetworkUnreachable => "network_unreachable",
            ErrorCategory::SslError => "ssl_error",
            ErrorCategory::TimeoutConnect => "timeout_connect",
            ErrorCategory::TimeoutRead => "timeout_read",
            ErrorCategory::TooManyRedirects => "too_many_redirects",
            ErrorCategory::ProxyError => "proxy_error",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportErrorInfo {
    pub category: ErrorCategory,
    pub user_message: String,
    pub troubleshooting_steps: Vec<String>,
    pub technical_details: String,
    pub retryable: bool,
    pub suggested_http_code: u16,
}

fn steps(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Classifies a `reqwest::Error`, consulting its `Display` text for the
/// finer-grained categories `reqwest` doesn't expose as distinct variants
/// (connection refused/reset, unreachable network, SSL), matching the
/// upstream's own string-matching fallback on a `ConnectError`.
pub fn classify_transport_error(err: &reqwest::Error) -> TransportErrorInfo {
    let technical_details = err.to_string();
    let lower = technical_details.to_lowercase();

    if err.is_timeout() {
        let category = if lower.contains("connect") { ErrorCategory::TimeoutConnect } else { ErrorCategory::TimeoutRead };
        let user_message = match category {
            ErrorCategory::TimeoutConnect => "Connection timeout - server did not respond to connection attempt.",
            _ => "Read timeout - server stopped responding during data transfer.",
        };
        return TransportErrorInfo {
            category,
            user_message: user_message.to_string(),
            troubleshooting_steps: steps(&[
                "Check your internet connection speed",
                "The server may be overloaded or slow to respond",
                "Try again in a few moments",
            ]),
            technical_details,
            retryable: true,
            suggested_http_code: 504,
        };
    }

    if err.is_redirect() {
        return TransportErrorInfo {
            category: ErrorCategory::TooManyRedirects,
            user_message: "Too many redirects - the upstream kept redirecting without resolving.".to_string(),
            troubleshooting_steps: steps(&["The upstream endpoint may be misconfigured", "Try again in a few moments"]),
            technical_details,
            retryable: true,
            suggested_http_code: 502,
        };
    }

    if lower.contains("proxy") {
        return TransportErrorInfo {
            category: ErrorCategory::ProxyError,
            user_message: "Proxy error - could not connect through the configured proxy.".to_string(),
            troubleshooting_steps: steps(&[
                "Check your proxy configuration",
                "Try disabling the proxy temporarily",
                "Check proxy authentication credentials if required",
            ]),
            technical_details,
            retryable: true,
            suggested_http_code: 502,
        };
    }

    if err.is_connect() {
        if lower.contains("dns") || lower.contains("resolve") || lower.contains("name or service not known") {
            return TransportErrorInfo {
                category: ErrorCategory::DnsResolution,
                user_message: "DNS resolution failed - cannot resolve the provider's domain name.".to_string(),
                troubleshooting_steps: steps(&[
                    "Check your internet connection",
                    "Try changing DNS servers to 8.8.8.8 or 1.1.1.1",
                    "Temporarily disable VPN if you're using one",
                ]),
                technical_details,
                retryable: true,
                suggested_http_code: 502,
            };
        }
        if lower.contains("connection refused") || lower.contains("econnrefused") {
            return TransportErrorInfo {
                category: ErrorCategory::ConnectionRefused,
                user_message: "Connection refused - the server is not accepting connections.".to_string(),
                troubleshooting_steps: steps(&[
                    "The service may be temporarily down",
                    "Verify firewall is not blocking the connection",
                    "Try again in a few moments",
                ]),
                technical_details,
                retryable: true,
                suggested_http_code: 502,
            };
        }
        if lower.contains("connection reset") || lower.contains("econnreset") {
            return TransportErrorInfo {
                category: ErrorCategory::ConnectionReset,
                user_message: "Connection reset - the server closed the connection unexpectedly.".to_string(),
                troubleshooting_steps: steps(&[
                    "This is usually a temporary server issue",
                    "Try again in a few moments",
                    "Check if a VPN/proxy is interfering with the connection",
                ]),
                technical_details,
                retryable: true,
                suggested_http_code: 502,
            };
        }
        if lower.contains("network is unreachable") || lower.contains("no route to host") {
            return TransportErrorInfo {
                category: ErrorCategory::NetworkUnreachable,
                user_message: "Network unreachable - cannot reach the server's network.".to_string(),
                troubleshooting_steps: steps(&[
                    "Check your internet connection",
                    "Check routing table if using a VPN",
                    "Restart your network adapter or router",
                ]),
                technical_details,
                retryable: true,
                suggested_http_code: 502,
            };
        }
        if lower.contains("ssl") || lower.contains("tls") || lower.contains("certificate") {
            return TransportErrorInfo {
                category: ErrorCategory::SslError,
                user_message: "SSL/TLS error - secure connection could not be established.".to_string(),
                troubleshooting_steps: steps(&[
                    "Check system date and time (incorrect time causes SSL errors)",
                    "Update SSL certificates on your system",
                    "Check if antivirus/firewall is intercepting HTTPS traffic",
                ]),
                technical_details,
                retryable: false,
                suggested_http_code: 502,
            };
        }
        return TransportErrorInfo {
            category: ErrorCategory::Unknown,
            user_message: "Connection failed - unable to establish connection to the server.".to_string(),
            troubleshooting_steps: steps(&[
                "Check your internet connection",
                "Verify firewall/antivirus settings",
                "Try again in a few moments",
            ]),
            technical_details,
            retryable: true,
            suggested_http_code: 502,
        };
    }

    TransportErrorInfo {
        category: ErrorCategory::Unknown,
        user_message: "Network request failed due to an unexpected error.".to_string(),
        troubleshooting_steps: steps(&[
            "Check your internet connection",
            "Try again in a few moments",
            "Check the debug logs for more details",
        ]),
        technical_details,
        retryable: true,
        suggested_http_code: 502,
    }
}

/// Renders a [`TransportErrorInfo`] into the message body `GatewayError`
/// conversion surfaces to the client, including numbered troubleshooting
/// steps and a technical-details tail for debugging.
pub fn format_transport_error(info: &TransportErrorInfo) -> String {
    let mut message = info.user_message.clone();
    if !info.troubleshooting_steps.is_empty() {
        message.push_str("\n\nTroubleshooting:\n");
        for (i, step) in info.troubleshooting_steps.iter().enumerate() {
            message.push_str(&format!("{}. {}\n", i + 1, step));
        }
    }
    message.push_str(&format!("\nTechnical details: {}", info.technical_details));
    message.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_includes_numbered_steps_and_technical_details() {
        let info = TransportErrorInfo {
            category: ErrorCategory::DnsResolution,
            user_message: "DNS resolution failed.".into(),
            troubleshooting_steps: steps(&["check connection", "try again"]),
            technical_details: "error sending request".into(),
            retryable: true,
            suggested_http_code: 502,
        };
        let rendered = format_transport_error(&info);
        assert!(rendered.contains("1. check connection"));
        assert!(rendered.contains("2. try again"));
        assert!(rendered.contains("Technical details: error sending request"));
    }

    #[test]
    fn category_as_str_is_stable() {
        assert_eq!(ErrorCategory::SslError.as_str(), "ssl_error");
    }
}
