// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Context;
use bgp::config::{PeerConfig, RouterConfig};
use rdb::rib::StaticRib;
use rdb::Prefix;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

/// Everything the daemon can be told at startup.
#[derive(Debug, Default, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DaemonConfig {
    /// Local ASN and BGP identifier. Command line options take precedence.
    #[serde(default)]
    pub router: Option<RouterConfig>,

    /// Address to accept BGP connections on.
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Routes announced by this router.
    #[serde(default)]
    pub originate: Vec<Origination>,

    /// Destinations reachable through the IGP. Next-hops resolve against
    /// these.
    #[serde(default)]
    pub igp: Vec<IgpRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Origination {
    pub prefix: Prefix,

    /// Defaults to the router id for IPv4. Required for IPv6.
    #[serde(default)]
    pub nexthop: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IgpRoute {
    pub prefix: Prefix,
    #[serde(default = "default_metric")]
    pub metric: u32,
}

fn default_metric() -> u32 {
    1
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parse {}", path.display()))
    }

    /// RIBs that resolve next-hops against the configured IGP routes.
    pub fn ribs(
        &self,
        log: &Logger,
    ) -> (StaticRib<Ipv4Addr>, StaticRib<Ipv6Addr>) {
        let mut rib4 = StaticRib::new(log.clone());
        let mut rib6 = StaticRib::new(log.clone());
        for r in &self.igp {
            match r.prefix {
                Prefix::V4(p) => rib4.set_igp_route(p, r.metric),
                Prefix::V6(p) => rib6.set_igp_route(p, r.metric),
            }
        }
        (rib4, rib6)
    }
}
