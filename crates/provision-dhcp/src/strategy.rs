//! Client identity strategies
//!
//! A strategy turns an incoming packet into the token that leases and
//! reservations are matched against. The server tries its strategies
//! in order and uses the first one that yields an answer.

use crate::packet::DhcpRequest;

/// Derives a client token from a request
pub type TokenFn = fn(&DhcpRequest) -> String;

#[derive(Debug, Clone)]
pub struct Strategy {
    pub name: &'static str,
    pub token: TokenFn,
}

/// Token of the `MAC` strategy: the client hardware address as `aa:bb:..`
pub fn mac_token(req: &DhcpRequest) -> String {
    req.mac_address.clone()
}

impl Strategy {
    pub fn mac() -> Self {
        Self {
            name: "MAC",
            token: mac_token,
        }
    }

    pub fn token_for(&self, req: &DhcpRequest) -> String {
        (self.token)(req)
    }
}

/// Strategies the server ships with, in the order they are tried
pub fn standard() -> Vec<Strategy> {
    vec![Strategy::mac()]
}

/// Find a strategy by name
pub fn lookup<'a>(strategies: &'a [Strategy], name: &str) -> Option<&'a Strategy> {
    strategies.iter().find(|s| s.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::discover;

    #[test]
    fn test_mac_strategy() {
        let req = DhcpRequest::parse(&discover([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22])).unwrap();
        let strategies = standard();
        let mac = lookup(&strategies, "MAC").unwrap();
        assert_eq!(mac.token_for(&req), "aa:bb:cc:00:11:22");
        assert!(lookup(&strategies, "mac").is_none());
    }
}
