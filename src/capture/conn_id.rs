//! Connection identifiers: the (client endpoint, server endpoint) pair
//! that keys every directional buffer, state machine and output file.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }
}

/// Which direction a segment travels relative to the connection's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub client: Endpoint,
    pub server: Endpoint,
}

impl ConnectionId {
    pub fn new(client: Endpoint, server: Endpoint) -> Self {
        Self { client, server }
    }

    /// 64-bit FNV-1a hash of the canonicalized endpoint tuple, rendered
    /// lowercase hex for filenames. Not cryptographic — chosen for being
    /// dependency-free, deterministic and fast.
    pub fn hash(&self) -> u64 {
        const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut h = FNV_OFFSET_BASIS;
        let mut feed = |bytes: &[u8]| {
            for &b in bytes {
                h ^= b as u64;
                h = h.wrapping_mul(FNV_PRIME);
            }
        };

        feed(&addr_bytes(self.client.addr));
        feed(&self.client.port.to_be_bytes());
        feed(&addr_bytes(self.server.addr));
        feed(&self.server.port.to_be_bytes());
        h
    }

    pub fn hash_hex(&self) -> String {
        format!("{:016x}", self.hash())
    }
}

fn addr_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id(a: u16, b: u16) -> ConnectionId {
        ConnectionId::new(
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), a),
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), b),
        )
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(id(1000, 3306).hash(), id(1000, 3306).hash());
    }

    #[test]
    fn hash_distinguishes_ports() {
        assert_ne!(id(1000, 3306).hash(), id(1001, 3306).hash());
    }

    #[test]
    fn hex_is_lowercase_16_chars() {
        let hex = id(1000, 3306).hash_hex();
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
