// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct RouterConfig {
    /// Autonomous system number of this router.
    pub asn: u32,

    /// BGP identifier of this router.
    pub id: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PeerConfig {
    pub name: String,

    /// Address and port of the peer.
    pub host: SocketAddr,

    /// Autonomous system number the peer must present.
    pub asn: u32,

    /// Source address for outbound connections.
    #[serde(default)]
    pub local_addr: Option<SocketAddr>,

    /// Hold time offered in our OPEN, in seconds. Zero disables keepalives.
    #[serde(default = "default_hold_time")]
    pub hold_time: u16,

    /// Seconds between connection attempts.
    #[serde(default = "default_connect_retry")]
    pub connect_retry: u64,

    /// Negotiate IPv6 unicast in addition to IPv4.
    #[serde(default)]
    pub ipv6: bool,

    /// Tear the session down when the peer announces more prefixes than
    /// this.
    #[serde(default)]
    pub prefix_limit: Option<usize>,

    /// Start the session as soon as the peer is added.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Wait for the peer to connect instead of connecting to it.
    #[serde(default)]
    pub passive: bool,
}

pub const DEFAULT_HOLD_TIME: u16 = 90;
pub const DEFAULT_CONNECT_RETRY: u64 = 30;

fn default_hold_time() -> u16 {
    DEFAULT_HOLD_TIME
}

fn default_connect_retry() -> u64 {
    DEFAULT_CONNECT_RETRY
}

fn default_enabled() -> bool {
    true
}

impl PeerConfig {
    pub fn new(name: impl Into<String>, host: SocketAddr, asn: u32) -> Self {
        Self {
            name: name.into(),
            host,
            asn,
            local_addr: None,
            hold_time: DEFAULT_HOLD_TIME,
            connect_retry: DEFAULT_CONNECT_RETRY,
            ipv6: false,
            prefix_limit: None,
            enabled: true,
            passive: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn peer_defaults() {
        let p: PeerConfig = serde_json::from_str(
            r#"{"name": "r2", "host": "192.0.2.2:179", "asn": 65002}"#,
        )
        .expect("parse peer");
        assert_eq!(p, PeerConfig::new("r2", "192.0.2.2:179".parse().unwrap(), 65002));
    }
}
