//! SSRF protection for outbound webhook targets.
//!
//! A destination is checked on every dispatch, not only at registration,
//! because DNS answers change. The HTTP client additionally resolves through
//! [`GuardedResolver`], which applies the same address classification at
//! connect time and closes the rebinding window between check and connect.
//!
//! DNS failures are treated as safe to attempt: the request then fails on
//! its own. A resolver outage therefore looks the same as a missing host.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::{debug, warn};
use url::{Host, Url};

/// Hostnames blocked exactly and as parent domains.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "localdomain",
    "internal",
    "intranet",
    "corp",
    "local",
    "metadata",
    "instance-data",
];

/// Guard settings.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Upper bound on DNS resolution during a check.
    pub dns_timeout: Duration,
    /// Skips host and address classification. Local development only.
    pub allow_private_networks: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self { dns_timeout: Duration::from_secs(2), allow_private_networks: false }
    }
}

/// Outcome of a target check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetVerdict {
    /// Whether a request may be sent.
    pub safe: bool,
    /// Why the target was rejected.
    pub reason: Option<String>,
    /// Address the decision was based on, when one is known.
    pub resolved_ip: Option<IpAddr>,
}

impl TargetVerdict {
    fn allowed(resolved_ip: Option<IpAddr>) -> Self {
        Self { safe: true, reason: None, resolved_ip }
    }

    fn blocked(reason: impl Into<String>, resolved_ip: Option<IpAddr>) -> Self {
        Self { safe: false, reason: Some(reason.into()), resolved_ip }
    }
}

/// Classifies destination URLs.
#[derive(Debug, Clone, Default)]
pub struct TargetValidator {
    config: GuardConfig,
}

impl TargetValidator {
    /// Creates a validator.
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    /// Guard settings.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Scheme, hostname and IP-literal checks without DNS.
    pub fn check_static(&self, url: &str) -> TargetVerdict {
        match Url::parse(url) {
            Ok(parsed) => self.check_static_url(&parsed),
            Err(e) => TargetVerdict::blocked(format!("invalid url: {e}"), None),
        }
    }

    /// [`Self::check_static`] for an already parsed URL.
    pub fn check_static_url(&self, url: &Url) -> TargetVerdict {
        if !matches!(url.scheme(), "http" | "https") {
            return TargetVerdict::blocked(format!("unsupported scheme: {}", url.scheme()), None);
        }

        let Some(host) = url.host() else {
            return TargetVerdict::blocked("url has no host", None);
        };

        if self.config.allow_private_networks {
            return TargetVerdict::allowed(literal_ip(&host));
        }

        match host {
            Host::Ipv4(ip) => classify(IpAddr::V4(ip)),
            Host::Ipv6(ip) => classify(IpAddr::V6(ip)),
            Host::Domain(domain) => {
                if is_blocked_hostname(domain) {
                    TargetVerdict::blocked(format!("blocked hostname: {domain}"), None)
                } else {
                    TargetVerdict::allowed(None)
                }
            },
        }
    }

    /// Full check: static rules, then every resolved address.
    pub async fn check(&self, url: &str) -> TargetVerdict {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return TargetVerdict::blocked(format!("invalid url: {e}"), None),
        };

        let verdict = self.check_static_url(&parsed);
        if !verdict.safe || self.config.allow_private_networks {
            return verdict;
        }

        let Some(Host::Domain(domain)) = parsed.host() else {
            return verdict;
        };
        let port = parsed.port_or_known_default().unwrap_or(443);

        match self.resolve(domain, port).await {
            Some(addrs) if !addrs.is_empty() => {
                for addr in &addrs {
                    if is_blocked_ip(addr.ip()) {
                        return TargetVerdict::blocked(
                            format!("{domain} resolves to blocked address {}", addr.ip()),
                            Some(addr.ip()),
                        );
                    }
                }
                TargetVerdict::allowed(addrs.first().map(SocketAddr::ip))
            },
            _ => TargetVerdict::allowed(None),
        }
    }

    async fn resolve(&self, host: &str, port: u16) -> Option<Vec<SocketAddr>> {
        match tokio::time::timeout(self.config.dns_timeout, tokio::net::lookup_host((host, port)))
            .await
        {
            Ok(Ok(addrs)) => Some(addrs.collect()),
            Ok(Err(e)) => {
                debug!(host, error = %e, "dns resolution failed, allowing attempt");
                None
            },
            Err(_) => {
                warn!(
                    host,
                    timeout_ms = self.config.dns_timeout.as_millis(),
                    "dns resolution timed out, allowing attempt"
                );
                None
            },
        }
    }
}

fn literal_ip(host: &Host<&str>) -> Option<IpAddr> {
    match host {
        Host::Ipv4(ip) => Some(IpAddr::V4(*ip)),
        Host::Ipv6(ip) => Some(IpAddr::V6(*ip)),
        Host::Domain(_) => None,
    }
}

fn classify(ip: IpAddr) -> TargetVerdict {
    if is_blocked_ip(ip) {
        TargetVerdict::blocked(format!("blocked address {ip}"), Some(ip))
    } else {
        TargetVerdict::allowed(Some(ip))
    }
}

/// Whether `host` equals or is a subdomain of a blocked name.
pub fn is_blocked_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    BLOCKED_HOSTNAMES.iter().any(|blocked| {
        host == *blocked
            || host.strip_suffix(blocked).is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Whether an address falls in a range webhooks may not reach.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        || (a == 100 && (b & 0xC0) == 64)
        || (a == 198 && (b & 0xFE) == 18)
        || a >= 240
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    // Mapped (::ffff:a.b.c.d) and compatible (::a.b.c.d) forms.
    if let Some(v4) = ip.to_ipv4() {
        return is_blocked_v4(v4);
    }
    let first = ip.segments()[0];
    (first & 0xFFC0) == 0xFE80 || (first & 0xFE00) == 0xFC00 || (first & 0xFF00) == 0xFF00
}

/// DNS resolver for the HTTP client that refuses blocked addresses.
#[derive(Debug, Clone)]
pub struct GuardedResolver {
    config: GuardConfig,
}

impl GuardedResolver {
    /// Creates a resolver with the guard's settings.
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    /// Shared handle for `ClientBuilder::dns_resolver`.
    pub fn shared(config: GuardConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }
}

/// Connection refused after the URL itself passed the check, either at
/// connect time or on a redirect hop.
#[derive(Debug, Clone, thiserror::Error)]
#[error("blocked target: {0}")]
pub struct BlockedTarget(pub String);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn resolve_guarded(config: GuardConfig, host: String) -> Result<Addrs, BoxError> {
    let addrs: Vec<SocketAddr> =
        tokio::time::timeout(config.dns_timeout, tokio::net::lookup_host((host.as_str(), 0)))
            .await
            .map_err(|_| format!("dns resolution for {host} timed out"))??
            .collect();

    if !config.allow_private_networks {
        if let Some(blocked) = addrs.iter().find(|addr| is_blocked_ip(addr.ip())) {
            warn!(host = %host, ip = %blocked.ip(), "refusing connection to blocked address");
            return Err(Box::new(BlockedTarget(format!(
                "{host} resolves to blocked address {}",
                blocked.ip()
            ))));
        }
    }

    Ok(Box::new(addrs.into_iter()))
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_guarded(self.config.clone(), name.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TargetValidator {
        TargetValidator::default()
    }

    #[test]
    fn metadata_endpoint_is_unsafe() {
        let verdict = validator().check_static("http://169.254.169.254/x");
        assert!(!verdict.safe);
        assert_eq!(verdict.resolved_ip, Some("169.254.169.254".parse().unwrap()));
    }

    #[test]
    fn private_ranges_are_unsafe() {
        for url in [
            "http://192.168.1.5/x",
            "http://10.0.0.1/",
            "http://172.16.0.1/",
            "http://172.31.255.255/",
            "http://127.0.0.1:8080/",
            "http://100.64.0.1/",
            "http://0.0.0.0/",
            "http://198.18.0.1/",
            "http://192.0.2.10/",
            "http://224.0.0.1/",
            "http://255.255.255.255/",
        ] {
            assert!(!validator().check_static(url).safe, "{url} should be blocked");
        }
    }

    #[test]
    fn edge_of_private_band_is_safe() {
        assert!(validator().check_static("http://172.15.0.1/x").safe);
        assert!(validator().check_static("http://172.32.0.1/x").safe);
        assert!(validator().check_static("https://8.8.8.8/hook").safe);
    }

    #[test]
    fn ipv6_literals_are_classified() {
        for url in [
            "http://[::1]/",
            "http://[::]/",
            "http://[fe80::1]/",
            "http://[fc00::1]/",
            "http://[fd12:3456::1]/",
            "http://[ff02::1]/",
            "http://[::ffff:127.0.0.1]/",
            "http://[::ffff:169.254.169.254]/",
        ] {
            assert!(!validator().check_static(url).safe, "{url} should be blocked");
        }
        assert!(validator().check_static("http://[2606:4700::1111]/").safe);
    }

    #[test]
    fn numeric_ipv4_forms_are_normalized() {
        assert!(!validator().check_static("http://2130706433/").safe);
        assert!(!validator().check_static("http://0x7f.0.0.1/").safe);
    }

    #[test]
    fn blocked_hostnames_and_subdomains() {
        assert!(!validator().check_static("http://localhost:3000/").safe);
        assert!(!validator().check_static("http://LOCALHOST/").safe);
        assert!(!validator().check_static("http://metadata.google.internal/").safe);
        assert!(!validator().check_static("http://printer.corp/").safe);
        assert!(!validator().check_static("http://box.local./").safe);
        assert!(validator().check_static("https://notlocalhost.com/").safe);
        assert!(validator().check_static("https://corporate.example.com/").safe);
    }

    #[test]
    fn non_http_schemes_rejected() {
        for url in ["ftp://example.com/", "file:///etc/passwd", "gopher://example.com/", "nope"] {
            let verdict = validator().check_static(url);
            assert!(!verdict.safe, "{url}");
            assert!(verdict.reason.is_some());
        }
    }

    #[test]
    fn private_networks_allowed_when_configured() {
        let relaxed = TargetValidator::new(GuardConfig {
            allow_private_networks: true,
            ..GuardConfig::default()
        });
        assert!(relaxed.check_static("http://127.0.0.1:9999/hook").safe);
        assert!(!relaxed.check_static("ftp://127.0.0.1/").safe);
    }

    #[tokio::test]
    async fn literal_addresses_skip_dns() {
        let verdict = validator().check("http://10.1.2.3/hook").await;
        assert!(!verdict.safe);
        assert_eq!(verdict.resolved_ip, Some("10.1.2.3".parse().unwrap()));
    }

    #[tokio::test]
    async fn unresolvable_host_is_allowed() {
        let guard = TargetValidator::new(GuardConfig {
            dns_timeout: Duration::from_millis(500),
            allow_private_networks: false,
        });
        let verdict = guard.check("https://does-not-exist.invalid/hook").await;
        assert!(verdict.safe);
        assert!(verdict.resolved_ip.is_none());
    }
}
