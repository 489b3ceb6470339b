//! Client-side allow/deny matching of dial targets.
//!
//! Patterns are compiled once at client startup from plain strings (CIDR,
//! `host:port`, wildcard, or a raw regex fallback) and matched against every
//! `Connect` the client is asked to dial.

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostPolicyError {
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Debug)]
enum Pattern {
    Cidr { net: IpNet, port: PortSpec },
    HostPort { host: String, port: u16 },
    HostWildcardPort { host: String },
    PortWildcardHost { port: u16 },
    WildcardAll,
    Regex(Regex),
}

#[derive(Debug, Clone, Copy)]
enum PortSpec {
    Any,
    Exact(u16),
}

#[derive(Debug, Default)]
pub struct HostPolicy {
    allowed: Vec<Pattern>,
    forbidden: Vec<Pattern>,
}

impl HostPolicy {
    pub fn compile(allowed: &[String], forbidden: &[String]) -> Result<Self, HostPolicyError> {
        Ok(Self {
            allowed: compile_all(allowed)?,
            forbidden: compile_all(forbidden)?,
        })
    }

    /// `address` is `host[:port]`; a missing port is acceptable and only
    /// matches patterns that don't require one.
    pub fn is_allowed(&self, address: &str) -> bool {
        let parsed = ParsedAddress::parse(address);

        if self.forbidden.iter().any(|p| p.matches(&parsed)) {
            return false;
        }
        if self.allowed.is_empty() {
            return true;
        }
        self.allowed.iter().any(|p| p.matches(&parsed))
    }
}

struct ParsedAddress<'a> {
    raw: &'a str,
    host: &'a str,
    port: Option<u16>,
}

impl<'a> ParsedAddress<'a> {
    fn parse(address: &'a str) -> Self {
        match address.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse::<u16>() {
                Ok(port) => ParsedAddress {
                    raw: address,
                    host,
                    port: Some(port),
                },
                Err(_) => ParsedAddress {
                    raw: address,
                    host: address,
                    port: None,
                },
            },
            None => ParsedAddress {
                raw: address,
                host: address,
                port: None,
            },
        }
    }
}

impl Pattern {
    fn matches(&self, addr: &ParsedAddress<'_>) -> bool {
        match self {
            Pattern::Cidr { net, port } => {
                let Ok(ip) = addr.host.parse::<IpAddr>() else {
                    return false;
                };
                if !net.contains(&ip) {
                    return false;
                }
                match port {
                    PortSpec::Any => true,
                    PortSpec::Exact(p) => addr.port == Some(*p),
                }
            }
            Pattern::HostPort { host, port } => addr.host == host && addr.port == Some(*port),
            Pattern::HostWildcardPort { host } => addr.host == host,
            Pattern::PortWildcardHost { port } => addr.port == Some(*port),
            Pattern::WildcardAll => true,
            Pattern::Regex(re) => re.is_match(addr.raw),
        }
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Pattern>, HostPolicyError> {
    patterns.iter().map(|p| compile_one(p)).collect()
}

fn compile_one(pattern: &str) -> Result<Pattern, HostPolicyError> {
    let pattern = pattern.trim();

    if let Some((net_part, port_part)) = pattern.split_once(':') {
        if net_part.contains('/') {
            let net: IpNet = net_part.parse().map_err(|e| HostPolicyError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: format!("bad CIDR: {e}"),
            })?;
            let port = if port_part == "*" {
                PortSpec::Any
            } else {
                let p: u16 = port_part.parse().map_err(|_| HostPolicyError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "port must be 1..65535 or *".into(),
                })?;
                if p == 0 {
                    return Err(HostPolicyError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: "port must be 1..65535".into(),
                    });
                }
                PortSpec::Exact(p)
            };
            return Ok(Pattern::Cidr { net, port });
        }
    } else if pattern.contains('/') {
        let net: IpNet = pattern.parse().map_err(|e| HostPolicyError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: format!("bad CIDR: {e}"),
        })?;
        return Ok(Pattern::Cidr {
            net,
            port: PortSpec::Any,
        });
    }

    if pattern == "*:*" {
        return Ok(Pattern::WildcardAll);
    }

    if let Some(host) = pattern.strip_suffix(":*") {
        if !host.is_empty() {
            return Ok(Pattern::HostWildcardPort {
                host: host.to_string(),
            });
        }
    }

    if let Some(port_part) = pattern.strip_prefix("*:") {
        if let Ok(port) = port_part.parse::<u16>() {
            if port != 0 {
                return Ok(Pattern::PortWildcardHost { port });
            }
        }
    }

    if let Some((host, port_part)) = pattern.rsplit_once(':') {
        if let Ok(port) = port_part.parse::<u16>() {
            if port != 0 && !host.is_empty() {
                return Ok(Pattern::HostPort {
                    host: host.to_string(),
                    port,
                });
            }
        }
    }

    let re = Regex::new(pattern).map_err(|e| HostPolicyError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: format!("not a CIDR/host:port/wildcard and not a valid regex: {e}"),
    })?;
    Ok(Pattern::Regex(re))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowed_list_allows_everything_not_forbidden() {
        let p = HostPolicy::compile(&[], &[]).unwrap();
        assert!(p.is_allowed("example.com:80"));
    }

    #[test]
    fn forbidden_cidr_wins_over_empty_allowed() {
        let p = HostPolicy::compile(&[], &["10.0.0.0/8".into()]).unwrap();
        assert!(!p.is_allowed("10.1.2.3:22"));
        assert!(p.is_allowed("11.1.2.3:22"));
    }

    #[test]
    fn forbidden_wins_even_when_allowed_matches() {
        let p = HostPolicy::compile(&["10.0.0.0/8:*".into()], &["10.1.2.3:22".into()]).unwrap();
        assert!(!p.is_allowed("10.1.2.3:22"));
        assert!(p.is_allowed("10.1.2.4:22"));
    }

    #[test]
    fn cidr_with_exact_port_requires_port_match() {
        let p = HostPolicy::compile(&["10.0.0.0/8:22".into()], &[]).unwrap();
        assert!(p.is_allowed("10.1.2.3:22"));
        assert!(!p.is_allowed("10.1.2.3:80"));
    }

    #[test]
    fn host_port_matches_literally() {
        let p = HostPolicy::compile(&["example.com:80".into()], &[]).unwrap();
        assert!(p.is_allowed("example.com:80"));
        assert!(!p.is_allowed("example.com:81"));
        assert!(!p.is_allowed("other.com:80"));
    }

    #[test]
    fn host_wildcard_port_matches_any_port() {
        let p = HostPolicy::compile(&["example.com:*".into()], &[]).unwrap();
        assert!(p.is_allowed("example.com:80"));
        assert!(p.is_allowed("example.com:22"));
        assert!(!p.is_allowed("other.com:80"));
    }

    #[test]
    fn port_wildcard_host_matches_any_host() {
        let p = HostPolicy::compile(&["*:443".into()], &[]).unwrap();
        assert!(p.is_allowed("example.com:443"));
        assert!(!p.is_allowed("example.com:80"));
    }

    #[test]
    fn wildcard_all_matches_everything() {
        let p = HostPolicy::compile(&["*:*".into()], &[]).unwrap();
        assert!(p.is_allowed("anything:1"));
    }

    #[test]
    fn regex_fallback_matches_raw_address() {
        let p = HostPolicy::compile(&[r"^.*\.internal:\d+$".into()], &[]).unwrap();
        assert!(p.is_allowed("svc.internal:9000"));
        assert!(!p.is_allowed("svc.external:9000"));
    }

    #[test]
    fn compile_rejects_bad_cidr_mask() {
        assert!(HostPolicy::compile(&["10.0.0.0/99".into()], &[]).is_err());
    }

    #[test]
    fn compile_rejects_port_out_of_range() {
        assert!(HostPolicy::compile(&[], &["10.0.0.0/8:70000".into()]).is_err());
    }

    #[test]
    fn is_allowed_is_monotone_in_allowed_list() {
        let narrow = HostPolicy::compile(&["example.com:80".into()], &[]).unwrap();
        let wide =
            HostPolicy::compile(&["example.com:80".into(), "other.com:80".into()], &[]).unwrap();
        assert!(!narrow.is_allowed("other.com:80"));
        assert!(wide.is_allowed("other.com:80"));
    }

    #[test]
    fn is_allowed_is_anti_monotone_in_forbidden_list() {
        let narrow = HostPolicy::compile(&[], &["example.com:80".into()]).unwrap();
        let wide =
            HostPolicy::compile(&[], &["example.com:80".into(), "other.com:80".into()]).unwrap();
        assert!(narrow.is_allowed("other.com:80"));
        assert!(!wide.is_allowed("other.com:80"));
    }
}
