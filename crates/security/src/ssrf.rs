//! SSRF validation for webhook target URLs.
//!
//! Rules run in a fixed order; the first violation wins and the error
//! names the rule that triggered. No DNS resolution happens here: IP
//! literals are range-checked directly, hostname-shaped internal targets
//! are caught by the literal and heuristic rules, and everything else must
//! be https.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use meshlink_core::error::{Result, WebhookError};

/// Cloud-metadata and bind-all hostnames that are never acceptable.
const BLOCKED_HOSTS: &[&str] = &[
    "169.254.169.254",
    "fd00:ec2::254",
    "instance-data",
    "instance-data.ec2.internal",
    "metadata.google.internal",
    "metadata.google.com",
    "0.0.0.0",
    "::",
];

/// Ports of common internal services a webhook must never target.
const BLOCKED_PORTS: &[u16] = &[22, 23, 25, 3306, 5432, 6379, 9200, 27017];

const LOCALHOST_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Validate a webhook target URL. Returns the parsed URL on success.
pub fn validate_webhook_url(raw: &str, allow_insecure: bool) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| invalid(raw, format!("not a valid URL: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(invalid(raw, format!("scheme must be http or https, got {other}")));
        }
    }

    let host = match url.host() {
        Some(host) => host,
        None => return Err(invalid(raw, "missing host")),
    };
    // Normalized lowercase hostname with IPv6 brackets stripped.
    let name = match &host {
        Host::Domain(domain) => domain.to_ascii_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };

    if BLOCKED_HOSTS.contains(&name.as_str()) {
        return Err(invalid(raw, format!("blocked host {name}")));
    }
    if name == "kubernetes.default" || name.starts_with("kubernetes.default.") {
        return Err(invalid(raw, "kubernetes API host is blocked"));
    }
    if name.contains(".svc") || name.starts_with("kubernetes") {
        return Err(invalid(raw, "kubernetes service address is blocked"));
    }

    let is_localhost = LOCALHOST_HOSTS.contains(&name.as_str());
    if is_localhost {
        if !allow_insecure {
            return Err(invalid(
                raw,
                "localhost target requires allow_insecure_webhooks",
            ));
        }
    } else {
        match host {
            Host::Ipv4(ip) => {
                if is_private_or_special_v4(ip) {
                    return Err(invalid(raw, format!("private IP address {ip}")));
                }
            }
            Host::Ipv6(ip) => {
                if is_private_or_special_v6(ip) {
                    return Err(invalid(raw, format!("private IP address {ip}")));
                }
            }
            Host::Domain(domain) => {
                // A domain that parses as an IP literal still gets ranged.
                if let Ok(ip) = domain.parse::<IpAddr>() {
                    let private = match ip {
                        IpAddr::V4(v4) => is_private_or_special_v4(v4),
                        IpAddr::V6(v6) => is_private_or_special_v6(v6),
                    };
                    if private {
                        return Err(invalid(raw, format!("private IP address {ip}")));
                    }
                }
            }
        }

        if url.scheme() == "http" {
            return Err(invalid(raw, "plain http is only allowed for localhost"));
        }
    }

    if let Some(port) = url.port() {
        if BLOCKED_PORTS.contains(&port) {
            return Err(invalid(raw, format!("blocked internal-service port {port}")));
        }
    }

    Ok(url)
}

fn is_private_or_special_v4(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
}

fn is_private_or_special_v6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        // fe80::/10 link-local
        || (segments[0] & 0xffc0) == 0xfe80
        // fc00::/7 unique-local
        || (segments[0] & 0xfe00) == 0xfc00
}

fn invalid(url: &str, reason: impl Into<String>) -> meshlink_core::Error {
    WebhookError::InvalidUrl {
        url: url.to_string(),
        reason: reason.into(),
    }
    .into()
}
