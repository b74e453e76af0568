//! Connection-time checks for worker sockets.
//!
//! A worker is admitted only when its `Authorization` header maps to a
//! provider, its address is not already connected, not inside a denylisted
//! range and not serving a ban for repeated invalid work.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tokio::time::Instant;

use bpow_types::{Principal, PrincipalKind};

use crate::config::TokenEntry;
use crate::hub::HubHandle;

/// Bulk-hosting ranges refused by default.
pub const DEFAULT_DENIED_RANGES: &[&str] = &[
    "116.202.0.0/16",
    "116.203.0.0/16",
    "128.140.0.0/17",
    "135.181.0.0/16",
    "136.243.0.0/16",
    "138.201.0.0/16",
    "142.132.128.0/17",
    "144.76.0.0/16",
    "148.251.0.0/16",
    "157.90.0.0/16",
    "159.69.0.0/16",
    "162.55.0.0/16",
    "167.233.0.0/16",
    "167.235.0.0/16",
    "168.119.0.0/16",
    "171.25.225.0/24",
    "176.9.0.0/16",
    "178.212.75.0/24",
    "178.63.0.0/16",
    "185.107.52.0/22",
    "185.110.95.0/24",
    "185.112.180.0/24",
    "185.126.28.0/22",
    "185.12.65.0/24",
    "185.136.140.0/23",
    "185.157.176.0/23",
    "185.157.178.0/23",
    "185.157.83.0/24",
    "185.171.224.0/22",
    "185.189.228.0/24",
    "185.189.229.0/24",
    "185.189.230.0/24",
    "185.189.231.0/24",
    "185.209.124.0/22",
    "185.213.45.0/24",
    "185.216.237.0/24",
    "185.226.99.0/24",
    "185.228.8.0/23",
    "185.242.76.0/24",
    "185.36.144.0/22",
    "185.50.120.0/23",
    "188.34.128.0/17",
    "188.40.0.0/16",
    "193.110.6.0/23",
    "193.163.198.0/24",
    "193.25.170.0/23",
    "194.35.12.0/23",
    "194.42.180.0/22",
    "194.42.184.0/22",
    "194.62.106.0/24",
    "195.201.0.0/16",
    "195.248.224.0/24",
    "195.60.226.0/24",
    "195.96.156.0/24",
    "197.242.84.0/22",
    "201.131.3.0/24",
    "213.133.96.0/19",
    "213.232.193.0/24",
    "213.239.192.0/18",
    "23.88.0.0/17",
    "45.148.28.0/22",
    "45.15.120.0/22",
    "46.4.0.0/16",
    "49.12.0.0/16",
    "49.13.0.0/16",
    "5.75.128.0/17",
    "5.9.0.0/16",
    "78.46.0.0/15",
    "83.219.100.0/22",
    "83.243.120.0/22",
    "85.10.192.0/18",
    "88.198.0.0/16",
    "88.99.0.0/16",
    "91.107.128.0/17",
    "91.190.240.0/21",
    "91.233.8.0/22",
    "94.130.0.0/16",
    "94.154.121.0/24",
    "95.217.0.0/16",
    "95.216.0.0/16",
    "65.21.0.0/16",
    "65.109.0.0/16",
    "65.108.0.0/16",
    "45.136.70.0/23",
    "2a01:4f8::/32",
    "2a01:4f9::/32",
    "2a01:4ff:ff01::/48",
    "2a01:b140::/29",
    "2a06:1301:4050::/48",
    "2a06:be80::/29",
    "2a0e:2c80::/29",
    "2a11:48c0::/29",
    "2a11:e980::/29",
    "2a12:e00::/29",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("missing or unrecognised credentials")]
    Unauthorized,

    #[error("address {0} is already connected")]
    AlreadyConnected(String),

    #[error("address {0} is in a denied range")]
    DeniedRange(String),

    #[error("address {0} is banned")]
    Banned(String),

    #[error("invalid address range: {0}")]
    InvalidRange(String),
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = match self {
            AdmissionError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdmissionError::InvalidRange(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::FORBIDDEN,
        };
        let body = format!("{} - {}", status.as_u16(), status.canonical_reason().unwrap_or(""));
        (status, body).into_response()
    }
}

/// Resolves an `Authorization` header value to a principal.
///
/// Token issuance and account storage live outside the broker; this is the
/// seam they plug into.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, authorization: &str) -> Option<Principal>;
}

/// Authenticator over a fixed token table.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Principal>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[TokenEntry]) -> Self {
        let mut tokens = Self::new();
        for entry in entries {
            tokens.insert(&entry.token, Principal::new(&entry.identity, entry.kind));
        }
        tokens
    }

    pub fn insert(&mut self, token: &str, principal: Principal) {
        self.tokens.insert(token.to_string(), principal);
    }

    pub fn with(mut self, token: &str, identity: &str, kind: PrincipalKind) -> Self {
        self.insert(token, Principal::new(identity, kind));
        self
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, authorization: &str) -> Option<Principal> {
        let token = authorization
            .strip_prefix("Bearer ")
            .unwrap_or(authorization)
            .trim();
        self.tokens.get(token).cloned()
    }
}

/// An address range in CIDR notation; a bare address is a full-length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => self.contains(&IpAddr::V4(v4)),
                None => false,
            },
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for Cidr {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AdmissionError::InvalidRange(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let network: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }
}

/// A set of refused ranges.
#[derive(Clone, Debug, Default)]
pub struct Denylist {
    ranges: Vec<Cidr>,
}

impl Denylist {
    pub fn parse<S: AsRef<str>>(ranges: &[S]) -> Result<Self, AdmissionError> {
        let ranges = ranges
            .iter()
            .map(|r| r.as_ref().parse())
            .collect::<Result<Vec<Cidr>, _>>()?;
        Ok(Self { ranges })
    }

    pub fn default_ranges() -> Result<Self, AdmissionError> {
        Self::parse(DEFAULT_DENIED_RANGES)
    }

    /// Unparseable addresses are never considered denied.
    pub fn contains(&self, ip: &str) -> bool {
        match ip.parse::<IpAddr>() {
            Ok(ip) => self.ranges.iter().any(|range| range.contains(&ip)),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Client address: `X-Real-Ip`, then the first `X-Forwarded-For` hop when
/// proxy headers are trusted, otherwise the socket peer.
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(real) = header_str(headers, "x-real-ip") {
            return real.to_string();
        }
        if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
            if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return first.to_string();
            }
        }
    }
    remote.ip().to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Invalid-work strikes and the bans they lead to, keyed by address.
///
/// Strikes decay: an address that stays clean for `ban_for` after its last
/// strike starts again from zero.
#[derive(Debug)]
pub struct PenaltyBox {
    max_strikes: u32,
    ban_for: Duration,
    strikes: Mutex<HashMap<String, Strikes>>,
    bans: Mutex<HashMap<String, Instant>>,
}

#[derive(Clone, Copy, Debug)]
struct Strikes {
    count: u32,
    last: Instant,
}

impl PenaltyBox {
    pub fn new(max_strikes: u32, ban_for: Duration) -> Self {
        Self {
            max_strikes,
            ban_for,
            strikes: Mutex::new(HashMap::new()),
            bans: Mutex::new(HashMap::new()),
        }
    }

    /// Record an invalid result. Returns `true` when this strike bans `addr`.
    pub fn strike(&self, addr: &str) -> bool {
        if self.max_strikes == 0 {
            return false;
        }
        let now = Instant::now();
        let count = {
            let mut strikes = self.strikes.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = strikes
                .entry(addr.to_string())
                .or_insert(Strikes { count: 0, last: now });
            if self.stale(entry, now) {
                entry.count = 0;
            }
            entry.count += 1;
            entry.last = now;
            entry.count
        };
        if count < self.max_strikes {
            return false;
        }
        self.strikes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(addr);
        self.bans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.to_string(), now + self.ban_for);
        true
    }

    /// Live strikes against `addr`.
    pub fn strikes(&self, addr: &str) -> u32 {
        let now = Instant::now();
        self.strikes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(addr)
            .filter(|s| !self.stale(s, now))
            .map_or(0, |s| s.count)
    }

    /// Forget decayed strikes and served bans.
    pub fn purge(&self) {
        let now = Instant::now();
        self.strikes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, s| !self.stale(s, now));
        self.bans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, until| now < *until);
    }

    /// Addresses with live strikes or bans on record.
    pub fn tracked(&self) -> usize {
        let strikes = self.strikes.lock().unwrap_or_else(PoisonError::into_inner).len();
        let bans = self.bans.lock().unwrap_or_else(PoisonError::into_inner).len();
        strikes + bans
    }

    fn stale(&self, strikes: &Strikes, now: Instant) -> bool {
        now.duration_since(strikes.last) >= self.ban_for
    }

    /// Whether `addr` is serving a ban; expired bans are dropped.
    pub fn is_banned(&self, addr: &str) -> bool {
        let mut bans = self.bans.lock().unwrap_or_else(PoisonError::into_inner);
        match bans.get(addr) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                bans.remove(addr);
                false
            }
            None => false,
        }
    }
}

/// The admission filter in front of `GET /ws/worker`.
pub struct Admission {
    authenticator: Arc<dyn Authenticator>,
    denylist: Denylist,
    penalties: Arc<PenaltyBox>,
    trust_proxy: bool,
}

impl Admission {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        denylist: Denylist,
        penalties: Arc<PenaltyBox>,
        trust_proxy: bool,
    ) -> Self {
        Self {
            authenticator,
            denylist,
            penalties,
            trust_proxy,
        }
    }

    /// Resolve the request's principal if it has the wanted kind.
    pub fn principal(
        &self,
        headers: &HeaderMap,
        kind: PrincipalKind,
    ) -> Result<Principal, AdmissionError> {
        header_str(headers, header::AUTHORIZATION.as_str())
            .and_then(|value| self.authenticator.authenticate(value))
            .filter(|principal| principal.is(kind))
            .ok_or(AdmissionError::Unauthorized)
    }

    /// Run every worker check; returns the provider and its address.
    pub async fn admit(
        &self,
        headers: &HeaderMap,
        remote: SocketAddr,
        hub: &HubHandle,
    ) -> Result<(Principal, String), AdmissionError> {
        let principal = self.principal(headers, PrincipalKind::Provider)?;
        let addr = client_ip(headers, remote, self.trust_proxy);

        // A stopped hub cannot take the connection anyway; treat it as taken.
        if hub.contains(&addr).await.unwrap_or(true) {
            return Err(AdmissionError::AlreadyConnected(addr));
        }
        if self.denylist.contains(&addr) {
            return Err(AdmissionError::DeniedRange(addr));
        }
        if self.penalties.is_banned(&addr) {
            return Err(AdmissionError::Banned(addr));
        }
        Ok((principal, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn default_denylist_matches_hosting_ranges() {
        let denylist = Denylist::default_ranges().unwrap();
        assert!(!denylist.contains("123.45.67.89"));
        assert!(denylist.contains("95.216.77.23"));
        assert!(denylist.contains("2a01:4f9:c010:780c::1"));
        assert!(!denylist.contains("2001:db8::1"));
        assert!(!denylist.contains("not an ip"));
    }

    #[test]
    fn cidr_parsing() {
        let range: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(range.contains(&"10.200.1.1".parse().unwrap()));
        assert!(!range.contains(&"11.0.0.1".parse().unwrap()));
        assert!(range.contains(&"::ffff:10.1.2.3".parse().unwrap()));

        let single: Cidr = "192.168.1.7".parse().unwrap();
        assert!(single.contains(&"192.168.1.7".parse().unwrap()));
        assert!(!single.contains(&"192.168.1.8".parse().unwrap()));

        let everything: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("garbage/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn client_ip_prefers_proxy_headers() {
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, remote, true), "127.0.0.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 10.0.0.1"));
        assert_eq!(client_ip(&headers, remote, true), "1.2.3.4");

        headers.insert("x-real-ip", HeaderValue::from_static("5.6.7.8"));
        assert_eq!(client_ip(&headers, remote, true), "5.6.7.8");
        assert_eq!(client_ip(&headers, remote, false), "127.0.0.1");
    }

    #[test]
    fn static_tokens_accept_bearer_prefix() {
        let tokens = StaticTokens::new().with("secret", "w@example.com", PrincipalKind::Provider);
        assert_eq!(
            tokens.authenticate("secret").map(|p| p.identity),
            Some("w@example.com".to_string())
        );
        assert!(tokens.authenticate("Bearer secret").is_some());
        assert!(tokens.authenticate("other").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn strikes_lead_to_a_timed_ban() {
        let penalties = PenaltyBox::new(3, Duration::from_secs(60));
        assert!(!penalties.strike("1.1.1.1"));
        assert!(!penalties.strike("1.1.1.1"));
        assert_eq!(penalties.strikes("1.1.1.1"), 2);
        assert!(!penalties.is_banned("1.1.1.1"));
        assert!(penalties.strike("1.1.1.1"));
        assert!(penalties.is_banned("1.1.1.1"));
        assert!(!penalties.is_banned("2.2.2.2"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!penalties.is_banned("1.1.1.1"));
        assert_eq!(penalties.strikes("1.1.1.1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn strikes_decay_and_purge_forgets_them() {
        let penalties = PenaltyBox::new(3, Duration::from_secs(60));
        assert!(!penalties.strike("1.1.1.1"));
        assert!(!penalties.strike("1.1.1.1"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(penalties.strikes("1.1.1.1"), 0);
        // The old strikes no longer count towards a ban.
        assert!(!penalties.strike("1.1.1.1"));
        assert_eq!(penalties.strikes("1.1.1.1"), 1);

        assert!(!penalties.strike("2.2.2.2"));
        tokio::time::advance(Duration::from_secs(61)).await;
        penalties.purge();
        assert_eq!(penalties.tracked(), 0);
    }

    #[test]
    fn rejection_status_codes() {
        assert_eq!(
            AdmissionError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AdmissionError::AlreadyConnected("x".into()).into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AdmissionError::DeniedRange("x".into()).into_response().status(),
            StatusCode::FORBIDDEN
        );
    }
}
