//! Location checks guarding against SSRF.

use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),
    #[error("Access to loopback address denied: {0}")]
    LoopbackDenied(String),
    #[error("Access to private IP address denied: {0}")]
    PrivateIpDenied(String),
    #[error("URL has no host: {0}")]
    MissingHost(String),
}

/// Reject non-http(s) schemes and hosts on loopback, private or link-local
/// networks. `allow_local` disables every check.
pub fn validate_url(url: &Url, allow_local: bool) -> Result<(), LocationError> {
    if allow_local {
        return Ok(());
    }

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(LocationError::InvalidScheme(url.scheme().to_string()));
    }

    match url.host() {
        Some(url::Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.');
            if domain.eq_ignore_ascii_case("localhost")
                || domain.to_ascii_lowercase().ends_with(".localhost")
            {
                return Err(LocationError::LoopbackDenied(domain.to_string()));
            }
        }
        Some(url::Host::Ipv4(ipv4)) => {
            if ipv4.is_loopback() || ipv4.is_unspecified() {
                return Err(LocationError::LoopbackDenied(ipv4.to_string()));
            }
            if ipv4.is_private() || ipv4.is_link_local() {
                return Err(LocationError::PrivateIpDenied(ipv4.to_string()));
            }
        }
        Some(url::Host::Ipv6(ipv6)) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return Err(LocationError::LoopbackDenied(ipv6.to_string()));
            }
            if let Some(ipv4) = ipv6.to_ipv4_mapped() {
                if ipv4.is_loopback() || ipv4.is_unspecified() {
                    return Err(LocationError::LoopbackDenied(ipv6.to_string()));
                }
                if ipv4.is_private() || ipv4.is_link_local() {
                    return Err(LocationError::PrivateIpDenied(ipv6.to_string()));
                }
            }
            // Unique local (fc00::/7)
            if (ipv6.segments()[0] & 0xfe00) == 0xfc00 || ipv6.is_unicast_link_local() {
                return Err(LocationError::PrivateIpDenied(ipv6.to_string()));
            }
        }
        None => return Err(LocationError::MissingHost(url.to_string())),
    }

    Ok(())
}
