//! Outbound HTTP safety controls (SSRF protection, limits, redaction).
//!
//! Connections choose their own `baseUrl`, so the relay operator decides which destinations a
//! client may point it at. This module is policy-only; the relay picks one at startup.

use crate::error::{OpenApiToolsError, Result};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::net::lookup_host;
use url::Url;

/// Maximum hops followed under [`RedirectPolicy::Checked`].
pub const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectPolicy {
    /// Do not follow redirects; the 3xx response is returned as-is.
    None,
    /// Follow redirects, but re-check the destination URL on each hop.
    Checked,
}

#[derive(Debug, Clone)]
pub struct OutboundHttpSafety {
    /// If set, only these hosts are allowed (case-insensitive).
    pub allowed_hosts: Option<HashSet<String>>,
    /// If true, allow private/loopback/link-local/reserved destination IPs.
    pub allow_private_networks: bool,
    /// Maximum response body size (bytes). `None` = unlimited.
    pub max_response_bytes: Option<usize>,
    /// Redirect behavior.
    pub redirects: RedirectPolicy,
}

impl OutboundHttpSafety {
    /// No restrictions beyond requiring `http(s)`.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            allowed_hosts: None,
            allow_private_networks: true,
            max_response_bytes: None,
            redirects: RedirectPolicy::Checked,
        }
    }

    /// Policy for relays exposed to untrusted clients.
    #[must_use]
    pub fn restrictive() -> Self {
        Self {
            allowed_hosts: None,
            allow_private_networks: false,
            max_response_bytes: Some(1024 * 1024), // 1 MiB
            redirects: RedirectPolicy::None,
        }
    }

    /// Build an HTTP client whose redirect handling follows this policy.
    ///
    /// Redirect hops are checked without DNS: a hop to a hostname is refused while private
    /// networks are denied, since its addresses cannot be verified inside the redirect hook.
    ///
    /// # Errors
    ///
    /// Returns an `Internal` error if the client cannot be constructed.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        let redirect = match self.redirects {
            RedirectPolicy::None => reqwest::redirect::Policy::none(),
            RedirectPolicy::Checked => {
                let policy = self.clone();
                reqwest::redirect::Policy::custom(move |attempt| {
                    if attempt.previous().len() >= MAX_REDIRECTS {
                        return attempt.error(OpenApiToolsError::Config(
                            "Outbound HTTP blocked: too many redirects".to_string(),
                        ));
                    }
                    match policy.check_redirect_hop(attempt.url()) {
                        Ok(()) => attempt.follow(),
                        Err(e) => attempt.error(e),
                    }
                })
            }
        };
        reqwest::Client::builder()
            .redirect(redirect)
            .build()
            .map_err(|e| OpenApiToolsError::Internal(format!("Failed to build HTTP client: {e}")))
    }

    /// Validate a URL before making an outbound request (or accepting it as a base URL).
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the URL is disallowed by the policy (unsupported scheme, host
    /// not in allowlist, or hostname resolves to a disallowed IP range).
    pub async fn check_url(&self, url: &Url) -> Result<()> {
        let Some(host) = self.check_without_dns(url)? else {
            return Ok(());
        };

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = lookup_host((host, port)).await.map_err(|e| {
            OpenApiToolsError::Config(format!("DNS lookup failed for host '{host}': {e}"))
        })?;

        let mut saw_any = false;
        for addr in addrs {
            saw_any = true;
            if is_denied_ip(addr.ip()) {
                return Err(OpenApiToolsError::Config(format!(
                    "Outbound HTTP blocked: host '{host}' resolved to disallowed IP '{}'",
                    addr.ip()
                )));
            }
        }

        if !saw_any {
            return Err(OpenApiToolsError::Config(format!(
                "DNS lookup returned no addresses for host '{host}'"
            )));
        }

        Ok(())
    }

    fn check_redirect_hop(&self, url: &Url) -> Result<()> {
        match self.check_without_dns(url)? {
            None => Ok(()),
            Some(host) => Err(OpenApiToolsError::Config(format!(
                "Outbound HTTP blocked: redirect to host '{host}' cannot be verified"
            ))),
        }
    }

    /// Scheme, allowlist and IP-literal checks. Returns the hostname when it still needs a DNS
    /// check against the private-network rule.
    fn check_without_dns<'u>(&self, url: &'u Url) -> Result<Option<&'u str>> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(OpenApiToolsError::Config(format!(
                "Outbound HTTP blocked: unsupported URL scheme '{scheme}'"
            )));
        }

        let Some(host) = url.host_str() else {
            return Err(OpenApiToolsError::Config(
                "Outbound HTTP blocked: missing URL host".to_string(),
            ));
        };

        if let Some(allowed) = &self.allowed_hosts
            && !allowed.contains(&host.to_ascii_lowercase())
        {
            return Err(OpenApiToolsError::Config(format!(
                "Outbound HTTP blocked: host '{host}' not in allowlist"
            )));
        }

        if self.allow_private_networks {
            return Ok(None);
        }

        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return if is_denied_ip(ip) {
                Err(OpenApiToolsError::Config(format!(
                    "Outbound HTTP blocked: destination IP '{ip}' is not allowed"
                )))
            } else {
                Ok(None)
            };
        }

        Ok(Some(host))
    }
}

#[must_use]
pub fn redact_url(url: &Url) -> String {
    let mut u = url.clone();
    let _ = u.set_username("");
    let _ = u.set_password(None);
    u.set_query(None);
    u.set_fragment(None);
    u.to_string()
}

/// Render a reqwest error without userinfo or query strings from the request URL.
#[must_use]
pub fn sanitize_reqwest_error(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    if let Some(u) = e.url() {
        msg = msg.replace(u.as_str(), &redact_url(u));
    }
    msg
}

fn is_denied_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_denied_ipv4(v4),
        IpAddr::V6(v6) => is_denied_ipv6(v6),
    }
}

fn is_denied_ipv4(ip: Ipv4Addr) -> bool {
    if ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
    {
        return true;
    }

    // Carrier-grade NAT (100.64.0.0/10) and reserved (240.0.0.0/4).
    let oct = ip.octets();
    (oct[0] == 100 && (64..=127).contains(&oct[1])) || oct[0] >= 240
}

fn is_denied_ipv6(ip: Ipv6Addr) -> bool {
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ip.is_unique_local()
        || ip.is_unicast_link_local()
}
