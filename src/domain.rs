//! Hostname helpers shared by the proxy, the auth gate and the certificate store
//!
//! - Local-domain classification (`*.loc` / `*.local`)
//! - Splitting a Host header into subdomain / registrable domain / TLD
//! - `www.` redirect target computation

use std::net::IpAddr;
use thiserror::Error;

/// Suffixes reserved for development hosts. These never go through ACME.
pub const LOCAL_SUFFIXES: &[&str] = &["loc", "local"];

/// Public suffixes that span two labels. Not exhaustive: hosts under a suffix
/// missing from this list are split on the last label.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "ltd.uk", "plc.uk",
    "com.au", "net.au", "org.au", "edu.au",
    "co.nz", "org.nz", "co.jp", "ne.jp", "or.jp",
    "com.br", "net.br", "co.in", "co.za", "com.mx", "com.tr", "com.cn",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("empty host")]
    Empty,
    #[error("host '{0}' is an IP literal")]
    IpLiteral(String),
    #[error("host '{0}' has no registrable domain")]
    NoRegistrableDomain(String),
}

/// A host split into its parts, e.g. `api.shop.example.co.uk` →
/// `{ subdomain: "api.shop", domain: "example", tld: "co.uk" }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDomain {
    pub subdomain: Option<String>,
    pub domain: String,
    pub tld: String,
}

impl ParsedDomain {
    /// `domain.tld`
    pub fn registrable(&self) -> String {
        format!("{}.{}", self.domain, self.tld)
    }
}

/// Strip an optional `:port` from a Host header value. IPv6 literals keep
/// their brackets stripped as well.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn normalize(host: &str) -> String {
    strip_port(host.trim()).trim_end_matches('.').to_ascii_lowercase()
}

/// Whether the host ends in one of the reserved local suffixes.
pub fn is_local_domain(host: &str) -> bool {
    let host = normalize(host);
    if host.is_empty() {
        return false;
    }
    LOCAL_SUFFIXES.iter().any(|suffix| {
        host.strip_suffix(suffix)
            .map(|rest| rest.ends_with('.'))
            .unwrap_or(false)
    })
}

/// Split a host into subdomain, registrable domain and TLD.
///
/// Local hosts are split on their local suffix, so `a.b.loc` yields domain `b`
/// and TLD `loc`. IP literals and single-label hosts have no registrable
/// domain and are rejected.
pub fn parse_host(host: &str) -> Result<ParsedDomain, DomainError> {
    let host = normalize(host);
    if host.is_empty() {
        return Err(DomainError::Empty);
    }
    if host.parse::<IpAddr>().is_ok() {
        return Err(DomainError::IpLiteral(host));
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.iter().any(|l| l.is_empty()) {
        return Err(DomainError::NoRegistrableDomain(host));
    }

    let suffix_len = if is_local_domain(&host) {
        1
    } else if labels.len() >= 3
        && MULTI_LABEL_SUFFIXES.contains(&labels[labels.len() - 2..].join(".").as_str())
    {
        2
    } else {
        1
    };

    if labels.len() <= suffix_len {
        return Err(DomainError::NoRegistrableDomain(host));
    }

    let tld = labels[labels.len() - suffix_len..].join(".");
    if tld.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(DomainError::NoRegistrableDomain(host));
    }

    let domain_idx = labels.len() - suffix_len - 1;
    let subdomain = if domain_idx == 0 {
        None
    } else {
        Some(labels[..domain_idx].join("."))
    };

    Ok(ParsedDomain {
        subdomain,
        domain: labels[domain_idx].to_string(),
        tld,
    })
}

/// Cookie `Domain` attribute covering the host and all its siblings,
/// e.g. `.example.com` for `app.example.com`.
pub fn cookie_domain(host: &str) -> Result<String, DomainError> {
    let parsed = parse_host(host)?;
    Ok(format!(".{}", parsed.registrable()))
}

/// For `www.example.com[:port]` returns `example.com[:port]`.
pub fn www_redirect_target(host: &str) -> Option<&str> {
    host.strip_prefix("www.").filter(|rest| !rest.is_empty())
}
