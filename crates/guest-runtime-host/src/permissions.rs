//! Outbound network permissions for guest code.
//!
//! Nothing is reachable by default. Hosts are granted by pattern and private
//! or metadata addresses stay blocked even when a pattern would admit them.

use guest_runtime_common::OutboundHttpConfig;

/// One allowlist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// `*`: every public host.
    Any,
    /// `api.example.com`
    Exact(String),
    /// `*.example.com`: the apex and every subdomain. Stored as `example.com`.
    Suffix(String),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == "*" {
            Self::Any
        } else if let Some(domain) = pattern.strip_prefix("*.") {
            Self::Suffix(domain.to_string())
        } else {
            Self::Exact(pattern)
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(exact) => exact == host,
            Self::Suffix(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            }
        }
    }
}

/// What a guest may reach over outbound HTTP.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    allowed_hosts: Vec<HostPattern>,
    /// Maximum outbound calls per guest request.
    pub max_http_requests: u32,
}

impl Permissions {
    /// No outbound access.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_config(config: &OutboundHttpConfig) -> Self {
        Self {
            allowed_hosts: config
                .allowed_hosts
                .iter()
                .filter(|pattern| !pattern.trim().is_empty())
                .map(|pattern| HostPattern::parse(pattern))
                .collect(),
            max_http_requests: config.max_requests,
        }
    }

    pub fn http_enabled(&self) -> bool {
        !self.allowed_hosts.is_empty()
    }

    /// Check a URL against the allowlist and the private-address block.
    ///
    /// Only `http` and `https` URLs with a host are ever allowed.
    pub fn is_http_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };

        self.allowed_hosts.iter().any(|pattern| pattern.matches(&host)) && !is_private_address(&parsed)
    }
}

/// Loopback, private, link-local and cloud metadata targets.
pub fn is_private_address(url: &url::Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain == "metadata.google.internal"
        }
        Some(url::Host::Ipv4(v4)) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
        }
        Some(url::Host::Ipv6(v6)) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link-local
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_private() || v4.is_loopback())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permissions(hosts: &[&str]) -> Permissions {
        Permissions::from_config(&OutboundHttpConfig {
            allowed_hosts: hosts.iter().map(ToString::to_string).collect(),
            ..OutboundHttpConfig::default()
        })
    }

    fn private(url: &str) -> bool {
        is_private_address(&url::Url::parse(url).unwrap())
    }

    #[test]
    fn test_none_allows_nothing() {
        let perms = Permissions::none();
        assert!(!perms.http_enabled());
        assert!(!perms.is_http_allowed("https://api.example.com/"));
    }

    #[test]
    fn test_exact_match() {
        let perms = permissions(&["API.example.com"]);

        assert!(perms.is_http_allowed("https://api.example.com/path"));
        assert!(!perms.is_http_allowed("https://other.example.com/path"));
        assert!(!perms.is_http_allowed("https://evil.com/path"));
    }

    #[test]
    fn test_wildcard_subdomain() {
        let perms = permissions(&["*.example.com"]);

        assert!(perms.is_http_allowed("https://api.example.com/path"));
        assert!(perms.is_http_allowed("https://a.b.example.com/path"));
        assert!(perms.is_http_allowed("https://example.com/path"));
        assert!(!perms.is_http_allowed("https://badexample.com/path"));
        assert!(!perms.is_http_allowed("https://evil.com/path"));
    }

    #[test]
    fn test_any_still_blocks_private() {
        let perms = permissions(&["*"]);

        assert!(perms.is_http_allowed("https://evil.com/path"));
        assert!(!perms.is_http_allowed("http://localhost:8080/"));
        assert!(!perms.is_http_allowed("http://192.168.1.1/"));
        assert!(!perms.is_http_allowed("ftp://files.example.com/"));
        assert!(!perms.is_http_allowed("not a url"));
    }

    #[test]
    fn test_private_addresses() {
        assert!(private("http://localhost:8080/"));
        assert!(private("http://127.0.0.1:8080/"));
        assert!(private("http://[::1]:8080/"));
        assert!(private("http://10.0.0.1/"));
        assert!(private("http://172.16.0.1/"));
        assert!(private("http://192.168.1.1/"));
        assert!(private("http://169.254.169.254/"));
        assert!(private("http://metadata.google.internal/"));
        assert!(private("http://[fd00::1]/"));
        assert!(private("http://[::ffff:10.0.0.1]/"));

        assert!(!private("https://api.example.com/"));
        assert!(!private("https://8.8.8.8/"));
    }

    #[test]
    fn test_rate_limit_from_config() {
        let perms = Permissions::from_config(&OutboundHttpConfig {
            allowed_hosts: vec![" ".into()],
            max_requests: 7,
            ..OutboundHttpConfig::default()
        });

        assert!(!perms.http_enabled());
        assert_eq!(perms.max_http_requests, 7);
    }
}
