// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::{PeerConfig, RouterConfig};
use crate::connection::{BgpConnection, BgpConnector, BgpListener, RouterEvent};
use crate::error::Error;
use crate::log::router_log;
use crate::session::{
    FsmEvent, FsmStateKind, LastError, SessionContext, SessionRunner,
};
use rdb::plumbing::DEFAULT_BACKGROUND_BUDGET;
use rdb::resolver::{NexthopAnswer, QueryId};
use rdb::rib::RibClient;
use rdb::{BgpPlumbing, LocalConfig, PeerId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::spawn;
use std::time::{Duration, Instant};

/// What the management front-end is told about a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PeerStatus {
    pub name: String,
    pub host: SocketAddr,
    pub asn: u32,
    pub state: FsmStateKind,
    pub enabled: bool,
    pub last_error: Option<LastError>,
}

/// A BGP speaker: the sessions with every configured peer and the route
/// pipelines they feed. Everything is driven from one thread by
/// [`Router::run`] or, in tests, by calling [`Router::handle`] and
/// [`Router::tick`] directly.
pub struct Router<Cnx: BgpConnection> {
    /// The static configuration associated with this router.
    pub config: RouterConfig,

    /// The IPv4 and IPv6 route pipelines.
    pub plumbing: BgpPlumbing,

    sessions: BTreeMap<PeerId, SessionRunner<Cnx>>,

    /// Peers by remote address, for matching inbound connections.
    by_addr: BTreeMap<IpAddr, PeerId>,
    next_peer: u32,
    connector: Box<dyn BgpConnector<Cnx>>,
    events_tx: Sender<RouterEvent<Cnx>>,
    events_rx: Receiver<RouterEvent<Cnx>>,
    log: Logger,
}

impl<Cnx: BgpConnection> Router<Cnx> {
    pub fn new(
        config: RouterConfig,
        connector: Box<dyn BgpConnector<Cnx>>,
        rib4: Box<dyn RibClient<Ipv4Addr>>,
        rib6: Box<dyn RibClient<Ipv6Addr>>,
        log: Logger,
    ) -> Self {
        let local = LocalConfig {
            asn: config.asn,
            bgp_id: config.id,
        };
        let (events_tx, events_rx) = channel();
        Self {
            config,
            plumbing: BgpPlumbing::new(local, rib4, rib6, log.clone()),
            sessions: BTreeMap::new(),
            by_addr: BTreeMap::new(),
            next_peer: 1,
            connector,
            events_tx,
            events_rx,
            log,
        }
    }

    /// A sender for reporting events to this router, as listeners and
    /// connections do.
    pub fn event_sender(&self) -> Sender<RouterEvent<Cnx>> {
        self.events_tx.clone()
    }

    /// Run `f` against the session of `peer` with a context borrowed from
    /// the router.
    fn with_session<F>(&mut self, peer: PeerId, f: F) -> Result<(), Error>
    where
        F: FnOnce(
            &mut SessionRunner<Cnx>,
            &mut SessionContext<'_, Cnx>,
        ) -> Result<(), Error>,
    {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return Ok(());
        };
        let mut cx = SessionContext {
            plumbing: &mut self.plumbing,
            connector: self.connector.as_ref(),
            events: &self.events_tx,
            local: self.config,
        };
        f(session, &mut cx)
    }

    fn peer_id(&self, addr: IpAddr) -> Result<PeerId, Error> {
        self.by_addr
            .get(&addr)
            .copied()
            .ok_or(Error::UnknownPeer(addr))
    }

    fn session(&self, addr: IpAddr) -> Result<&SessionRunner<Cnx>, Error> {
        let id = self.peer_id(addr)?;
        self.sessions.get(&id).ok_or(Error::UnknownPeer(addr))
    }

    pub fn add_peer(&mut self, config: PeerConfig) -> Result<PeerId, Error> {
        let addr = config.host.ip();
        if self.by_addr.contains_key(&addr) {
            return Err(Error::PeerExists(addr));
        }
        let id = PeerId(self.next_peer);
        self.plumbing.add_peering(id)?;
        self.next_peer += 1;

        router_log!(self, info, "adding peer {} at {}", config.name, addr;
            "peer" => id.0
        );
        let enabled = config.enabled;
        let session = SessionRunner::new(id, config, self.log.clone());
        self.sessions.insert(id, session);
        self.by_addr.insert(addr, id);
        if enabled {
            self.with_session(id, |s, cx| s.handle(FsmEvent::Start, cx))?;
        }
        Ok(id)
    }

    /// Stop the session with the peer at `addr` and remove it along with
    /// every route it contributed.
    pub fn delete_peer(&mut self, addr: IpAddr) -> Result<(), Error> {
        let id = self.peer_id(addr)?;
        self.with_session(id, |s, cx| {
            s.handle(FsmEvent::Stop, cx)?;
            s.shutdown(cx);
            Ok(())
        })?;
        self.sessions.remove(&id);
        self.by_addr.remove(&addr);
        self.plumbing.delete_peering(id)?;
        router_log!(self, info, "deleted peer {addr}"; "peer" => id.0);
        self.flush_updates();
        Ok(())
    }

    pub fn enable_peer(&mut self, addr: IpAddr) -> Result<(), Error> {
        let id = self.peer_id(addr)?;
        self.with_session(id, |s, cx| s.handle(FsmEvent::Start, cx))
    }

    pub fn disable_peer(&mut self, addr: IpAddr) -> Result<(), Error> {
        let id = self.peer_id(addr)?;
        self.with_session(id, |s, cx| s.handle(FsmEvent::Stop, cx))?;
        self.flush_updates();
        Ok(())
    }

    pub fn peer_state(&self, addr: IpAddr) -> Result<FsmStateKind, Error> {
        Ok(self.session(addr)?.state())
    }

    pub fn peer_last_error(
        &self,
        addr: IpAddr,
    ) -> Result<Option<LastError>, Error> {
        Ok(self.session(addr)?.last_error().cloned())
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        self.sessions
            .values()
            .map(|s| PeerStatus {
                name: s.config.name.clone(),
                host: s.config.host,
                asn: s.config.asn,
                state: s.state(),
                enabled: s.is_enabled(),
                last_error: s.last_error().cloned(),
            })
            .collect()
    }

    /// Announce `prefix` from this router. IPv4 routes default to our
    /// router id as next-hop, IPv6 routes need one given.
    pub fn originate_route(
        &mut self,
        prefix: rdb::Prefix,
        nexthop: Option<IpAddr>,
    ) -> Result<(), Error> {
        match (prefix, nexthop) {
            (rdb::Prefix::V4(p), None) => {
                self.plumbing.ipv4.originate_route(p, self.config.id)?
            }
            (rdb::Prefix::V4(p), Some(IpAddr::V4(nh))) => {
                self.plumbing.ipv4.originate_route(p, nh)?
            }
            (rdb::Prefix::V6(p), Some(IpAddr::V6(nh))) => {
                self.plumbing.ipv6.originate_route(p, nh)?
            }
            (p, nh) => {
                return Err(Error::InvalidAddress(format!(
                    "next-hop {nh:?} for {p}"
                )))
            }
        }
        router_log!(self, info, "originated {prefix}");
        self.flush_updates();
        Ok(())
    }

    pub fn withdraw_route(&mut self, prefix: rdb::Prefix) -> Result<(), Error> {
        match prefix {
            rdb::Prefix::V4(p) => self.plumbing.ipv4.withdraw_route(p)?,
            rdb::Prefix::V6(p) => self.plumbing.ipv6.withdraw_route(p)?,
        }
        router_log!(self, info, "withdrew {prefix}");
        self.flush_updates();
        Ok(())
    }

    pub fn originated(&self) -> Vec<rdb::Prefix> {
        let mut out: Vec<rdb::Prefix> = self
            .plumbing
            .ipv4
            .originated()
            .into_iter()
            .map(rdb::Prefix::from)
            .collect();
        out.extend(self.plumbing.ipv6.originated().into_iter().map(rdb::Prefix::from));
        out
    }

    pub fn nexthop_answer4(&mut self, query: QueryId, answer: NexthopAnswer) {
        self.plumbing.ipv4.nexthop_answer(query, answer);
        self.flush_updates();
    }

    pub fn nexthop_answer6(&mut self, query: QueryId, answer: NexthopAnswer) {
        self.plumbing.ipv6.nexthop_answer(query, answer);
        self.flush_updates();
    }

    /// The RIB no longer vouches for anything it told us about `prefix`.
    pub fn route_info_invalid(&mut self, prefix: rdb::Prefix) {
        match prefix {
            rdb::Prefix::V4(p) => self.plumbing.ipv4.route_info_invalid(p),
            rdb::Prefix::V6(p) => self.plumbing.ipv6.route_info_invalid(p),
        };
    }

    pub fn route_info_changed(&mut self, prefix: rdb::Prefix, metric: u32) {
        match prefix {
            rdb::Prefix::V4(p) => {
                self.plumbing.ipv4.route_info_changed(p, metric)
            }
            rdb::Prefix::V6(p) => {
                self.plumbing.ipv6.route_info_changed(p, metric)
            }
        }
        self.flush_updates();
    }

    /// Process one event from a connection, connector or listener.
    pub fn handle(&mut self, event: RouterEvent<Cnx>) -> Result<(), Error> {
        match event {
            RouterEvent::Accepted(mut cnx) => {
                let addr = cnx.peer().ip();
                let taken = match self.by_addr.get(&addr).copied() {
                    Some(id) => self.offer_connection(id, cnx)?,
                    None => {
                        router_log!(self, info,
                            "connection from unknown peer {addr}"
                        );
                        cnx.disconnect();
                        true
                    }
                };
                if !taken {
                    router_log!(self, info, "refused connection from {addr}");
                }
            }
            RouterEvent::Connected { peer, cnx } => {
                if !self.offer_connection(peer, cnx)? {
                    router_log!(self, debug,
                        "outbound connection to {} superseded", peer
                    );
                }
            }
            RouterEvent::ConnectFailed { peer, reason } => {
                router_log!(self, debug, "connect to {} failed: {reason}", peer);
                self.with_session(peer, |s, cx| {
                    s.handle(FsmEvent::ConnectFailed, cx)
                })?;
            }
            RouterEvent::Transport { id, event } => {
                let owner = self
                    .sessions
                    .values()
                    .find(|s| s.connection_id() == Some(id))
                    .map(|s| s.id);
                match owner {
                    Some(peer) => self
                        .with_session(peer, |s, cx| s.transport(event, cx))?,
                    None => router_log!(self, trace,
                        "{} from stale connection {id}", event.title()
                    ),
                }
            }
        }
        self.flush_updates();
        Ok(())
    }

    /// Hand a new transport to `peer`'s session if it is waiting for one.
    /// Returns false if the connection was refused and closed.
    fn offer_connection(&mut self, peer: PeerId, cnx: Cnx) -> Result<bool, Error> {
        let accepts = self
            .sessions
            .get(&peer)
            .is_some_and(|s| s.accepts_connection());
        if !accepts {
            let mut cnx = cnx;
            cnx.disconnect();
            return Ok(false);
        }
        self.with_session(peer, |s, cx| {
            s.handle(FsmEvent::TransportOpened(cnx), cx)
        })?;
        Ok(true)
    }

    /// Send everything the pipelines have queued to established peers.
    pub fn flush_updates(&mut self) {
        let peers: Vec<PeerId> = self.sessions.keys().copied().collect();
        for peer in peers {
            if let Err(e) = self.with_session(peer, |s, cx| s.send_updates(cx)) {
                router_log!(self, error, "sending updates to {}: {e}", peer);
            }
        }
    }

    /// Advance every session's timers by `elapsed`.
    pub fn tick(&mut self, elapsed: Duration) -> Result<(), Error> {
        let peers: Vec<PeerId> = self.sessions.keys().copied().collect();
        for peer in peers {
            self.with_session(peer, |s, cx| s.tick(elapsed, cx))?;
        }
        self.flush_updates();
        Ok(())
    }

    /// Collect RIB answers and move background work along. Returns true
    /// while background work remains.
    pub fn run_background(&mut self, budget: usize) -> bool {
        self.plumbing.poll_rib();
        let pending = self.plumbing.run_background(budget);
        self.flush_updates();
        pending
    }

    /// Handle every event already waiting, without blocking. Returns how
    /// many there were.
    pub fn process_pending(&mut self) -> Result<usize, Error> {
        let mut count = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event)?;
            count += 1;
        }
        Ok(count)
    }

    /// Accept connections from `listener` on a thread of their own and
    /// pass them to this router until `shutdown` is set.
    pub fn spawn_listener<L>(&self, listener: L, shutdown: Arc<AtomicBool>)
    where
        L: BgpListener<Cnx> + Send + 'static,
    {
        let events = self.event_sender();
        let log = self.log.clone();
        spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept(events.clone()) {
                    Ok(Some(cnx)) => {
                        if events.send(RouterEvent::Accepted(cnx)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        slog::error!(log, "accept on {}: {e}", listener.local();
                            "component" => crate::COMPONENT_BGP,
                            "module" => crate::MOD_ROUTER
                        );
                        break;
                    }
                }
            }
        });
    }

    /// The event loop. Inbound connections are accepted from `listener` on
    /// a thread of their own, everything else happens here. Timers advance
    /// in steps of `resolution`. Returns when `shutdown` is set, or with
    /// the first error no session could absorb.
    pub fn run<L>(
        &mut self,
        listener: Option<L>,
        resolution: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), Error>
    where
        L: BgpListener<Cnx> + Send + 'static,
    {
        if let Some(listener) = listener {
            self.spawn_listener(listener, shutdown.clone());
        }

        let mut last_tick = Instant::now();
        let mut pending = false;
        while !shutdown.load(Ordering::Relaxed) {
            let wait = if pending { Duration::ZERO } else { resolution };
            match self.events_rx.recv_timeout(wait) {
                Ok(event) => self.handle(event)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let elapsed = last_tick.elapsed();
            if elapsed >= resolution {
                last_tick = Instant::now();
                self.tick(elapsed)?;
            }
            pending = self.run_background(DEFAULT_BACKGROUND_BUDGET);
        }

        self.shutdown();
        Ok(())
    }

    /// Tell every established peer we are going away and drop all
    /// sessions to idle.
    pub fn shutdown(&mut self) {
        router_log!(self, info, "shutting down");
        let peers: Vec<PeerId> = self.sessions.keys().copied().collect();
        for peer in peers {
            let r = self.with_session(peer, |s, cx| {
                s.handle(FsmEvent::Stop, cx)?;
                s.shutdown(cx);
                Ok(())
            });
            if let Err(e) = r {
                router_log!(self, error, "stopping {}: {e}", peer);
            }
        }
    }
}
