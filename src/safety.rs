use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use url::{Host, Url};

use crate::error::AgentError;

/// DNS seam. The system resolver is the only production implementation;
/// tests substitute a scripted one so no network is touched.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    match o[0] {
        0 | 10 | 127 => true,
        169 => o[1] == 254,
        172 => (16..=31).contains(&o[1]),
        192 => o[1] == 168,
        _ => false,
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return true;
            }
            let seg0 = v6.segments()[0];
            // fc00::/7 (unique local) and fe80::/10 (link local).
            if seg0 & 0xfe00 == 0xfc00 || seg0 & 0xffc0 == 0xfe80 {
                return true;
            }
            // IPv4-mapped forms carry the v4 policy.
            v6.to_ipv4_mapped().map(is_private_v4).unwrap_or(false)
        }
    }
}

fn domain_matches(host: &str, entry: &str) -> bool {
    let entry = entry.trim().trim_start_matches("*.").to_lowercase();
    if entry.is_empty() {
        return false;
    }
    host == entry || host.ends_with(&format!(".{}", entry))
}

/// Validate a navigation target against the full safety policy and return
/// its canonical form. Checks run in order and the first failure wins:
/// parse, protocol, loopback hostname, private IP literal, allowlist,
/// blocklist, then DNS resolution of every returned address (rebinding
/// protection, failing closed on resolver errors).
pub async fn validate_url(
    raw: &str,
    allow: &[String],
    block: &[String],
) -> Result<String, AgentError> {
    validate_url_with(&SystemResolver, raw, allow, block).await
}

pub async fn validate_url_with(
    resolver: &dyn Resolve,
    raw: &str,
    allow: &[String],
    block: &[String],
) -> Result<String, AgentError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AgentError::UnsafeUrl(format!("unparseable url {:?}: {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AgentError::UnsafeUrl(format!(
                "protocol \"{}\" is not allowed (http/https only)",
                other
            )))
        }
    }

    let host = url
        .host()
        .ok_or_else(|| AgentError::UnsafeUrl("url has no host".into()))?;

    let hostname = match &host {
        Host::Domain(d) => d.to_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };

    if hostname == "localhost" {
        return Err(AgentError::UnsafeUrl("localhost is not allowed".into()));
    }

    match host {
        Host::Ipv4(ip) if is_private_ip(IpAddr::V4(ip)) => {
            return Err(AgentError::UnsafeUrl(format!(
                "address {} is in a private range",
                ip
            )));
        }
        Host::Ipv6(ip) if is_private_ip(IpAddr::V6(ip)) => {
            return Err(AgentError::UnsafeUrl(format!(
                "address {} is in a private range",
                ip
            )));
        }
        _ => {}
    }

    if !allow.is_empty() && !allow.iter().any(|entry| domain_matches(&hostname, entry)) {
        return Err(AgentError::UnsafeUrl(format!(
            "host {} is not in the allowed domain list",
            hostname
        )));
    }
    if block.iter().any(|entry| domain_matches(&hostname, entry)) {
        return Err(AgentError::UnsafeUrl(format!(
            "host {} is in the blocked domain list",
            hostname
        )));
    }

    // Rebinding protection: resolve domains and vet every returned address.
    if matches!(url.host(), Some(Host::Domain(_))) {
        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = resolver
            .resolve(&hostname, port)
            .await
            .map_err(|e| AgentError::UnsafeUrl(format!("dns resolution failed for {}: {}", hostname, e)))?;
        if addrs.is_empty() {
            return Err(AgentError::UnsafeUrl(format!(
                "dns resolution returned no addresses for {}",
                hostname
            )));
        }
        for addr in addrs {
            if is_private_ip(addr.ip()) {
                return Err(AgentError::UnsafeUrl(format!(
                    "host {} resolves to private address {}",
                    hostname,
                    addr.ip()
                )));
            }
        }
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    struct FakeResolver {
        table: HashMap<String, Vec<IpAddr>>,
    }

    impl FakeResolver {
        fn new(entries: &[(&str, &str)]) -> Self {
            let mut table = HashMap::new();
            for (host, ip) in entries {
                table
                    .entry(host.to_string())
                    .or_insert_with(Vec::new)
                    .push(ip.parse().unwrap());
            }
            Self { table }
        }
    }

    #[async_trait]
    impl Resolve for FakeResolver {
        async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
            match self.table.get(host) {
                Some(ips) => Ok(ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect()),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no such host")),
            }
        }
    }

    fn public() -> FakeResolver {
        FakeResolver::new(&[("example.com", "93.184.216.34")])
    }

    #[tokio::test]
    async fn accepts_public_host() {
        let out = validate_url_with(&public(), "https://example.com/", &[], &[])
            .await
            .unwrap();
        assert_eq!(out, "https://example.com/");
    }

    #[tokio::test]
    async fn validation_is_idempotent() {
        let resolver = public();
        let once = validate_url_with(&resolver, "HTTPS://EXAMPLE.com/a?b=1", &[], &[])
            .await
            .unwrap();
        let twice = validate_url_with(&resolver, &once, &[], &[]).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn rejects_bad_protocols_and_hosts() {
        let resolver = public();
        for raw in [
            "http://127.0.0.1",
            "http://10.0.0.1",
            "http://192.168.1.1",
            "http://172.16.0.1",
            "http://172.31.0.1",
            "http://169.254.169.254",
            "http://0.0.0.0",
            "http://localhost",
            "http://[::1]",
            "http://[::ffff:127.0.0.1]",
            "http://[fc00::1]",
            "http://[fe80::1]",
            "javascript:alert(1)",
            "file:///etc/passwd",
            "data:text/html,x",
            "ftp://host",
            "not a url",
        ] {
            let out = validate_url_with(&resolver, raw, &[], &[]).await;
            assert!(out.is_err(), "{} should be rejected", raw);
        }
    }

    #[tokio::test]
    async fn rejects_hosts_resolving_to_private_ranges() {
        let resolver = FakeResolver::new(&[
            ("internal.example.com", "10.1.2.3"),
            ("rebind.example.com", "93.184.216.34"),
            ("rebind.example.com", "192.168.0.9"),
        ]);
        for host in ["http://internal.example.com/", "http://rebind.example.com/"] {
            assert!(validate_url_with(&resolver, host, &[], &[]).await.is_err());
        }
    }

    #[tokio::test]
    async fn dns_failure_fails_closed() {
        let resolver = FakeResolver::new(&[]);
        let out = validate_url_with(&resolver, "https://unknown.example/", &[], &[]).await;
        assert!(matches!(out, Err(AgentError::UnsafeUrl(_))));
    }

    #[tokio::test]
    async fn allow_and_block_lists_use_suffix_matching() {
        let resolver = FakeResolver::new(&[
            ("docs.example.com", "93.184.216.34"),
            ("evil.com", "93.184.216.35"),
        ]);
        let allow = vec!["example.com".to_string()];
        assert!(
            validate_url_with(&resolver, "https://docs.example.com/", &allow, &[])
                .await
                .is_ok()
        );
        assert!(validate_url_with(&resolver, "https://evil.com/", &allow, &[])
            .await
            .is_err());

        let block = vec!["example.com".to_string()];
        assert!(
            validate_url_with(&resolver, "https://docs.example.com/", &[], &block)
                .await
                .is_err()
        );
        assert!(validate_url_with(&resolver, "https://evil.com/", &[], &block)
            .await
            .is_ok());
    }
}
