//! Outbound URL guard.
//!
//! Image references come from scraped pages, so they are untrusted. Before
//! downloading one we make sure it cannot reach internal infrastructure.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use trove_core::error::AppError;
use url::Url;

/// Parse `raw` and refuse anything that is not http(s) on a public address.
///
/// Hostnames are resolved and every resolved address must be public.
pub async fn ensure_public_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::ValidationError(format!("Invalid URL '{raw}': {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::ValidationError(format!(
            "Refusing '{}' URL (only http/https)",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::ValidationError(format!("URL '{raw}' has no host")))?;

    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return if is_reserved(ip) {
            Err(refused(host, ip))
        } else {
            Ok(url)
        };
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let resolved: Vec<IpAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS lookup failed for {host}: {e}")))?
        .map(|addr| addr.ip())
        .collect();

    if resolved.is_empty() {
        return Err(AppError::NetworkError(format!("{host} did not resolve")));
    }
    if let Some(ip) = resolved.into_iter().find(|ip| is_reserved(*ip)) {
        return Err(refused(host, ip));
    }
    Ok(url)
}

fn refused(host: &str, ip: IpAddr) -> AppError {
    AppError::ValidationError(format!("Refusing {host}: {ip} is a private or reserved address"))
}

/// Loopback, private, link-local, CGNAT, documentation and unique-local ranges.
pub fn is_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => is_reserved_v6(v6),
    }
}

fn is_reserved_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || (a == 100 && (64..128).contains(&b))
}

fn is_reserved_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_reserved_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xffc0) == 0xfe80
        || (first & 0xfe00) == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved(ip: &str) -> bool {
        is_reserved(ip.parse().unwrap())
    }

    #[test]
    fn test_reserved_ranges() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.20.0.1",
            "192.168.0.10",
            "169.254.169.254",
            "100.100.0.1",
            "0.0.0.0",
            "::1",
            "fe80::1",
            "fd00::1",
            "::ffff:10.0.0.1",
        ] {
            assert!(reserved(ip), "{ip} should be reserved");
        }
    }

    #[test]
    fn test_public_addresses() {
        for ip in ["8.8.8.8", "151.101.1.69", "100.128.0.1", "2606:4700::1111"] {
            assert!(!reserved(ip), "{ip} should be public");
        }
    }

    #[tokio::test]
    async fn test_rejects_private_literal_and_bad_scheme() {
        let err = ensure_public_url("http://192.168.1.1/img.jpg").await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        let err = ensure_public_url("http://[::1]:8080/img.jpg").await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        let err = ensure_public_url("ftp://example.com/img.jpg").await.unwrap_err();
        assert!(err.to_string().contains("only http/https"));

        assert!(ensure_public_url("not a url").await.is_err());
    }

    #[tokio::test]
    async fn test_accepts_public_literal() {
        let url = ensure_public_url("https://93.184.215.14/a.jpg").await.unwrap();
        assert_eq!(url.path(), "/a.jpg");
    }
}
