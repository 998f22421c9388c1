// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The management front-end. Nothing can be done to peers or routes until
//! the local ASN and identifier are known, at which point the router is
//! built from the parts handed to [`Admin::new`].

use crate::error::Error;
use crate::log::admin_log;
use bgp::config::{PeerConfig, RouterConfig};
use bgp::connection::{BgpConnection, BgpConnector, BgpListener};
use bgp::router::{PeerStatus, Router};
use bgp::session::{FsmStateKind, LastError};
use rdb::rib::RibClient;
use rdb::{PeerId, Prefix};
use slog::Logger;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a router is built from once it has a local configuration.
pub struct RouterParts<Cnx: BgpConnection> {
    pub connector: Box<dyn BgpConnector<Cnx>>,
    pub rib4: Box<dyn RibClient<Ipv4Addr>>,
    pub rib6: Box<dyn RibClient<Ipv6Addr>>,
}

pub struct Admin<Cnx: BgpConnection> {
    parts: Option<RouterParts<Cnx>>,
    router: Option<Router<Cnx>>,
    shutdown: Arc<AtomicBool>,
    terminated: bool,
    log: Logger,
}

impl<Cnx: BgpConnection> Admin<Cnx> {
    pub fn new(parts: RouterParts<Cnx>, log: Logger) -> Self {
        Self {
            parts: Some(parts),
            router: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            terminated: false,
            log,
        }
    }

    /// Setting this flag asks a running router to terminate.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn is_configured(&self) -> bool {
        self.router.is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Set the local ASN and identifier. This can only happen once.
    pub fn set_local_config(
        &mut self,
        config: RouterConfig,
    ) -> Result<(), Error> {
        let Some(parts) = self.parts.take() else {
            return Err(Error::AlreadyConfigured);
        };
        admin_log!(self.log, info, "local config asn {} id {}", config.asn, config.id);
        self.router = Some(Router::new(
            config,
            parts.connector,
            parts.rib4,
            parts.rib6,
            self.log.clone(),
        ));
        if self.shutdown.load(Ordering::Relaxed) {
            admin_log!(self.log, info, "running deferred terminate");
            self.terminate();
        }
        Ok(())
    }

    fn router(&mut self) -> Result<&mut Router<Cnx>, Error> {
        self.router.as_mut().ok_or(Error::NotConfigured)
    }

    fn router_ref(&self) -> Result<&Router<Cnx>, Error> {
        self.router.as_ref().ok_or(Error::NotConfigured)
    }

    pub fn add_peer(&mut self, config: PeerConfig) -> Result<PeerId, Error> {
        Ok(self.router()?.add_peer(config)?)
    }

    pub fn delete_peer(&mut self, addr: IpAddr) -> Result<(), Error> {
        Ok(self.router()?.delete_peer(addr)?)
    }

    pub fn enable_peer(&mut self, addr: IpAddr) -> Result<(), Error> {
        Ok(self.router()?.enable_peer(addr)?)
    }

    pub fn disable_peer(&mut self, addr: IpAddr) -> Result<(), Error> {
        Ok(self.router()?.disable_peer(addr)?)
    }

    pub fn peer_state(&self, addr: IpAddr) -> Result<FsmStateKind, Error> {
        Ok(self.router_ref()?.peer_state(addr)?)
    }

    pub fn peer_last_error(
        &self,
        addr: IpAddr,
    ) -> Result<Option<LastError>, Error> {
        Ok(self.router_ref()?.peer_last_error(addr)?)
    }

    pub fn peers(&self) -> Result<Vec<PeerStatus>, Error> {
        Ok(self.router_ref()?.peers())
    }

    pub fn originate_route(
        &mut self,
        prefix: Prefix,
        nexthop: Option<IpAddr>,
    ) -> Result<(), Error> {
        Ok(self.router()?.originate_route(prefix, nexthop)?)
    }

    pub fn withdraw_route(&mut self, prefix: Prefix) -> Result<(), Error> {
        Ok(self.router()?.withdraw_route(prefix)?)
    }

    /// Stop every session and ask the event loop to exit. Before the local
    /// configuration is set this only takes effect once it is.
    pub fn terminate(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        match self.router.as_mut() {
            Some(router) => {
                router.shutdown();
                self.terminated = true;
            }
            None => {
                admin_log!(self.log, info, "terminate deferred until configured")
            }
        }
    }

    /// Run the router until terminated.
    pub fn run<L>(
        &mut self,
        listener: Option<L>,
        resolution: Duration,
    ) -> Result<(), Error>
    where
        L: BgpListener<Cnx> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.router()?.run(listener, resolution, shutdown)?;
        self.terminated = true;
        Ok(())
    }
}
