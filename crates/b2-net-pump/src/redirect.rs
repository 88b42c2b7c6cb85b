use core::fmt;
use core::str::FromStr;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Address the NAT stack hands its (single) client; used when a rule leaves the guest address
/// empty, since forwarding to `0.0.0.0` does not reach the guest.
pub const DEFAULT_GUEST_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for RedirectProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RedirectProtocol::Tcp => "tcp",
            RedirectProtocol::Udp => "udp",
        })
    }
}

/// A static host port → guest address/port forwarding installed into the NAT stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RedirectRule {
    pub protocol: RedirectProtocol,
    pub host_port: u16,
    pub guest_addr: Ipv4Addr,
    pub guest_port: u16,
}

impl fmt::Display for RedirectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.protocol, self.host_port, self.guest_addr, self.guest_port
        )
    }
}

/// A redirect string that could not be parsed. The offending rule is skipped; the others still
/// apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid host forwarding rule '{rule}': missing {field}")]
    MissingField { rule: String, field: &'static str },

    #[error("invalid host forwarding rule '{rule}': unknown protocol '{protocol}'")]
    UnknownProtocol { rule: String, protocol: String },

    #[error("invalid host forwarding rule '{rule}': {field} '{value}' is not a port in 1..=65535")]
    InvalidPort {
        rule: String,
        field: &'static str,
        value: String,
    },

    #[error("invalid host forwarding rule '{rule}': bad guest address '{value}'")]
    InvalidAddress { rule: String, value: String },
}

impl FromStr for RedirectRule {
    type Err = ConfigError;

    /// Parse `<proto>:<host_port>:<guest_address>:<guest_port>`.
    ///
    /// An empty protocol means TCP and an empty guest address means [`DEFAULT_GUEST_ADDR`].
    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let missing = |field| ConfigError::MissingField {
            rule: rule.to_string(),
            field,
        };

        let (proto, rest) = match rule.split_once(':') {
            Some((proto, rest)) => (proto, Some(rest)),
            None => (rule, None),
        };
        let protocol = match proto {
            "" | "tcp" => RedirectProtocol::Tcp,
            "udp" => RedirectProtocol::Udp,
            other => {
                return Err(ConfigError::UnknownProtocol {
                    rule: rule.to_string(),
                    protocol: other.to_string(),
                })
            }
        };
        let rest = rest.ok_or_else(|| missing("host port"))?;

        let (host_port, rest) = rest.split_once(':').ok_or_else(|| missing("guest address"))?;
        let host_port = parse_port(host_port).ok_or_else(|| ConfigError::InvalidPort {
            rule: rule.to_string(),
            field: "host port",
            value: host_port.to_string(),
        })?;

        let (guest_addr, guest_port) = rest.split_once(':').ok_or_else(|| missing("guest port"))?;
        let guest_addr = if guest_addr.is_empty() {
            DEFAULT_GUEST_ADDR
        } else {
            guest_addr
                .parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidAddress {
                    rule: rule.to_string(),
                    value: guest_addr.to_string(),
                })?
        };

        let guest_port = parse_port(guest_port).ok_or_else(|| ConfigError::InvalidPort {
            rule: rule.to_string(),
            field: "guest port",
            value: guest_port.to_string(),
        })?;

        Ok(RedirectRule {
            protocol,
            host_port,
            guest_addr,
            guest_port,
        })
    }
}

/// Parse every rule, keeping the good ones and collecting errors for the rest.
pub fn parse_redirects<S: AsRef<str>>(rules: &[S]) -> (Vec<RedirectRule>, Vec<ConfigError>) {
    let mut parsed = Vec::with_capacity(rules.len());
    let mut errors = Vec::new();
    for rule in rules {
        match rule.as_ref().parse() {
            Ok(rule) => parsed.push(rule),
            Err(err) => errors.push(err),
        }
    }
    (parsed, errors)
}

fn parse_port(s: &str) -> Option<u16> {
    parse_c_integer(s)
        .filter(|port| (1..=i64::from(u16::MAX)).contains(port))
        .map(|port| port as u16)
}

/// Integer syntax accepted by C `strtol(s, &end, 0)` with the whole string consumed: optional
/// leading whitespace and sign, `0x` hex, leading-`0` octal, otherwise decimal.
fn parse_c_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (16, hex)
    } else if s.len() > 1 && s.starts_with('0') {
        (8, &s[1..])
    } else {
        (10, s)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let value = i64::from_str_radix(digits, radix).ok()?;
    Some(if negative { -value } else { value })
}
