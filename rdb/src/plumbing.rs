// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wiring of the route table stages for one address family.
//!
//! ```text
//!   RibIn -> Deletion* -> Filter(in) -> Cache -> NhLookup ─┐
//!   RibIn -> Deletion* -> Filter(in) -> Cache -> NhLookup ─┼─> Decision ─┬─> FIB
//!   Local -------------------------------------> NhLookup ─┘             │
//!                                                                        └─> Fanout
//!   Fanout[peer] -> Dump -> Filter(out) -> RibOut -> updates for the peer
//! ```
//!
//! One branch exists per configured peering plus the local origination
//! branch. Out-branches exist only while a peering is established.

use crate::attributes::AttributeManager;
use crate::cache::CacheTable;
use crate::decision::DecisionTable;
use crate::deletion::DeletionTable;
use crate::dump::DumpTable;
use crate::error::Error;
use crate::fanout::FanoutTable;
use crate::filter::{FilterTable, DEFAULT_LOCAL_PREF};
use crate::log::pipeline_log;
use crate::nhlookup::NhLookupTable;
use crate::resolver::{NextHopResolver, NexthopAnswer, QueryId, ResolverEvents};
use crate::rib::{FibRoute, RibClient, RibNotification};
use crate::ribin::RibInTable;
use crate::ribout::{RibOutTable, RibOutUpdate};
use crate::table::{run_ops, RouteTable, TableContext};
use crate::types::{
    Afi, AsPath, GenId, InternalMessage, Origin, PathAttributeList, PeerId,
    PeerInfo, RouteOp, SubnetRoute,
};
use slog::Logger;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Identity of the local router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalConfig {
    pub asn: u32,
    pub bgp_id: Ipv4Addr,
}

/// Number of routes a background step moves through a deletion or dump
/// table.
pub const DEFAULT_BACKGROUND_BUDGET: usize = 256;

/// The pieces of pipeline state every stage may need.
struct Shared<A: Afi> {
    resolver: NextHopResolver<A>,
    rib: Box<dyn RibClient<A>>,
    attrs: AttributeManager<A>,
    peers: BTreeMap<PeerId, PeerInfo<A>>,
    log: Logger,
}

impl<A: Afi> Shared<A> {
    fn cx(&mut self) -> TableContext<'_, A> {
        TableContext {
            resolver: &mut self.resolver,
            rib: self.rib.as_mut(),
            attrs: &mut self.attrs,
            peers: &self.peers,
            log: &self.log,
        }
    }
}

struct InBranch<A: Afi> {
    up: bool,
    ribin: RibInTable<A>,

    /// Newest first.
    deletions: Vec<DeletionTable<A>>,
    filter: FilterTable<A>,
    cache: CacheTable<A>,
    nhlookup: NhLookupTable<A>,
}

impl<A: Afi> InBranch<A> {
    fn new(peer: PeerId) -> Self {
        Self {
            up: false,
            ribin: RibInTable::new(peer, 0),
            deletions: Vec::new(),
            filter: FilterTable::new(
                format!("filter-in-{}-{}", A::NAME, peer),
                Vec::new(),
            ),
            cache: CacheTable::new(peer),
            nhlookup: NhLookupTable::new(peer),
        }
    }

    /// Carry operations leaving the RibIn down to the decision stage.
    fn below_ribin(
        &mut self,
        ops: Vec<RouteOp<A>>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        let mut ops = ops;
        for table in self.deletions.iter_mut() {
            ops = run_ops(table, ops, cx);
        }
        self.below_deletion(ops, cx)
    }

    fn below_deletion(
        &mut self,
        ops: Vec<RouteOp<A>>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        let ops = run_ops(&mut self.filter, ops, cx);
        let ops = run_ops(&mut self.cache, ops, cx);
        run_ops(&mut self.nhlookup, ops, cx)
    }
}

struct OutBranch<A: Afi> {
    dump: Option<DumpTable<A>>,
    filter: FilterTable<A>,
    ribout: RibOutTable<A>,
}

impl<A: Afi> OutBranch<A> {
    fn process(&mut self, ops: Vec<RouteOp<A>>, cx: &mut TableContext<'_, A>) {
        let ops = match self.dump.as_mut() {
            Some(dump) => run_ops(dump, ops, cx),
            None => ops,
        };
        self.below_dump(ops, cx);
    }

    fn below_dump(
        &mut self,
        ops: Vec<RouteOp<A>>,
        cx: &mut TableContext<'_, A>,
    ) {
        let ops = run_ops(&mut self.filter, ops, cx);
        run_ops(&mut self.ribout, ops, cx);
    }
}

/// Everything downstream of the per-peer input branches.
struct Downstream<A: Afi> {
    decision: DecisionTable<A>,
    fanout: FanoutTable<A>,
    outputs: BTreeMap<PeerId, OutBranch<A>>,
}

impl<A: Afi> Downstream<A> {
    fn decide(&mut self, ops: Vec<RouteOp<A>>, cx: &mut TableContext<'_, A>) {
        if ops.is_empty() {
            return;
        }
        let ops = run_ops(&mut self.decision, ops, cx);
        self.output(ops, cx);
    }

    /// Hand the decision stage's output to the FIB and to every peer.
    fn output(&mut self, ops: Vec<RouteOp<A>>, cx: &mut TableContext<'_, A>) {
        if ops.is_empty() {
            return;
        }
        for op in &ops {
            install(op, cx.rib);
        }
        self.fanout.enqueue(&ops);
        self.deliver(cx);
    }

    fn deliver(&mut self, cx: &mut TableContext<'_, A>) {
        for (peer, out) in self.outputs.iter_mut() {
            let ops = self.fanout.drain(*peer);
            if !ops.is_empty() {
                out.process(ops, cx);
            }
        }
    }

    /// Step every dump whose target has caught up with live changes.
    /// Returns true when dumps remain.
    fn step_dumps(
        &mut self,
        budget: usize,
        cx: &mut TableContext<'_, A>,
    ) -> bool {
        let mut pending = false;
        for (peer, out) in self.outputs.iter_mut() {
            if out.dump.is_none() {
                continue;
            }
            if !self.fanout.is_idle(*peer) {
                pending = true;
                continue;
            }
            let (ops, done) = match out.dump.as_mut() {
                Some(dump) => {
                    let ops = dump.step(self.decision.winners(), budget, cx);
                    (ops, dump.is_done())
                }
                None => continue,
            };
            out.below_dump(ops, cx);
            if done {
                out.dump = None;
            } else {
                pending = true;
            }
        }
        pending
    }
}

fn install<A: Afi>(op: &RouteOp<A>, rib: &mut dyn RibClient<A>) {
    let fib = |m: &InternalMessage<A>| FibRoute {
        net: m.net(),
        nexthop: m.route.nexthop(),
        asn: m.attributes().as_path.first_asn(),
        origin: m.attributes().origin,
        igp_metric: m.route.igp_metric,
    };
    match op {
        RouteOp::Add(m) if !m.origin.is_local() => rib.add_route(fib(m)),
        RouteOp::Delete(m) if !m.origin.is_local() => {
            rib.delete_route(m.net())
        }
        RouteOp::Replace { old, new } => {
            if !new.origin.is_local() {
                rib.add_route(fib(new));
            } else if !old.origin.is_local() {
                rib.delete_route(old.net());
            }
        }
        _ => {}
    }
}

pub struct Plumbing<A: Afi> {
    local: LocalConfig,
    shared: Shared<A>,
    genids: BTreeMap<PeerId, GenId>,
    inputs: BTreeMap<PeerId, InBranch<A>>,
    down: Downstream<A>,
}

impl<A: Afi> Plumbing<A> {
    pub fn new(
        local: LocalConfig,
        rib: Box<dyn RibClient<A>>,
        log: Logger,
    ) -> Self {
        let mut peers = BTreeMap::new();
        peers.insert(
            PeerId::LOCAL,
            PeerInfo {
                asn: local.asn,
                bgp_id: local.bgp_id,
                ibgp: false,
                local_addr: None,
            },
        );

        let mut local_branch = InBranch::new(PeerId::LOCAL);
        local_branch.up = true;
        local_branch.ribin.set_genid(1);

        let mut inputs = BTreeMap::new();
        inputs.insert(PeerId::LOCAL, local_branch);

        let mut genids = BTreeMap::new();
        genids.insert(PeerId::LOCAL, 1);

        Self {
            local,
            shared: Shared {
                resolver: NextHopResolver::new(log.clone()),
                rib,
                attrs: AttributeManager::new(),
                peers,
                log,
            },
            genids,
            inputs,
            down: Downstream {
                decision: DecisionTable::new(),
                fanout: FanoutTable::new(),
                outputs: BTreeMap::new(),
            },
        }
    }

    fn name(&self) -> String {
        format!("plumbing-{}", A::NAME)
    }

    pub fn local(&self) -> LocalConfig {
        self.local
    }

    pub fn add_peering(&mut self, peer: PeerId) -> Result<(), Error> {
        if self.inputs.contains_key(&peer) {
            return Err(Error::PeerExists(peer));
        }
        self.inputs.insert(peer, InBranch::new(peer));
        self.genids.insert(peer, 0);
        Ok(())
    }

    /// Remove a peering, withdrawing everything it contributed first.
    pub fn delete_peering(&mut self, peer: PeerId) -> Result<(), Error> {
        if peer.is_local() {
            return Err(Error::InvalidRoute("local branch is permanent".into()));
        }
        let up = self
            .inputs
            .get(&peer)
            .map(|b| b.up)
            .ok_or(Error::UnknownPeer(peer))?;
        if up {
            self.peering_went_down(peer)?;
        }

        let mut cx = self.shared.cx();
        if let Some(branch) = self.inputs.get_mut(&peer) {
            while let Some(mut table) = branch.deletions.pop() {
                let ops = table.step(usize::MAX, &mut cx);
                let ops = branch.below_deletion(ops, &mut cx);
                self.down.decide(ops, &mut cx);
            }
        }

        self.inputs.remove(&peer);
        self.genids.remove(&peer);
        self.shared.peers.remove(&peer);
        self.shared.attrs.sweep();
        Ok(())
    }

    /// The session with `peer` reached the established state. A new
    /// generation starts and the peer is synchronized with a dump of the
    /// current winners.
    pub fn peering_came_up(
        &mut self,
        peer: PeerId,
        info: PeerInfo<A>,
    ) -> Result<GenId, Error> {
        let branch = self.inputs.get_mut(&peer).ok_or(Error::UnknownPeer(peer))?;
        if branch.up {
            return Err(Error::PeerUp(peer));
        }

        let genid = self.genids.entry(peer).or_insert(0);
        *genid += 1;
        let genid = *genid;

        branch.up = true;
        branch.ribin.set_genid(genid);
        branch.filter = FilterTable::inbound(peer, self.local.asn, &info);
        self.shared.peers.insert(peer, info);

        self.down.outputs.insert(
            peer,
            OutBranch {
                dump: Some(DumpTable::new(peer)),
                filter: FilterTable::outbound(peer, self.local.asn, &info),
                ribout: RibOutTable::new(peer),
            },
        );
        self.down.fanout.add_peer(peer);

        pipeline_log!(self.shared.log, info, self.name(),
            "peering {} up", peer;
            "genid" => genid,
            "ibgp" => info.ibgp
        );
        Ok(genid)
    }

    /// The session with `peer` went down. Its routes are withdrawn in the
    /// background and its output branch is torn down.
    pub fn peering_went_down(&mut self, peer: PeerId) -> Result<(), Error> {
        let branch = self.inputs.get_mut(&peer).ok_or(Error::UnknownPeer(peer))?;
        if !branch.up || peer.is_local() {
            return Err(Error::PeerDown(peer));
        }
        branch.up = false;

        let genid = branch.ribin.genid();
        let routes = branch.ribin.take_all();
        let count = routes.len();
        if !routes.is_empty() {
            branch
                .deletions
                .insert(0, DeletionTable::new(peer, genid, routes));
        }

        self.down.outputs.remove(&peer);
        self.down.fanout.remove_peer(peer);
        for out in self.down.outputs.values_mut() {
            if let Some(dump) = out.dump.as_mut() {
                dump.peering_went_down(peer, genid);
            }
        }

        pipeline_log!(self.shared.log, info, self.name(),
            "peering {} down", peer;
            "genid" => genid,
            "routes" => count
        );
        Ok(())
    }

    pub fn is_up(&self, peer: PeerId) -> bool {
        self.inputs.get(&peer).map(|b| b.up).unwrap_or(false)
    }

    pub fn genid(&self, peer: PeerId) -> Option<GenId> {
        self.genids.get(&peer).copied()
    }

    fn up_branch(&self, peer: PeerId) -> Result<GenId, Error> {
        let branch = self.inputs.get(&peer).ok_or(Error::UnknownPeer(peer))?;
        if !branch.up {
            return Err(Error::PeerDown(peer));
        }
        Ok(branch.ribin.genid())
    }

    /// Move operations leaving `peer`'s RibIn through the rest of the
    /// pipeline.
    fn flow(&mut self, peer: PeerId, ops: Vec<RouteOp<A>>) {
        let mut cx = self.shared.cx();
        let Some(branch) = self.inputs.get_mut(&peer) else {
            return;
        };
        let ops = branch.below_ribin(ops, &mut cx);
        self.down.decide(ops, &mut cx);
    }

    /// The shared copy of `attrs`. Routes from the wire should carry interned
    /// lists so that identical attributes are stored once.
    pub fn intern(
        &mut self,
        attrs: PathAttributeList<A>,
    ) -> Arc<PathAttributeList<A>> {
        self.shared.attrs.intern(attrs)
    }

    /// A route received from `peer`. Nothing leaves the pipeline until the
    /// peer's next push.
    pub fn add_route(
        &mut self,
        peer: PeerId,
        route: SubnetRoute<A>,
    ) -> Result<(), Error> {
        let genid = self.up_branch(peer)?;
        let mut cx = self.shared.cx();
        let Some(branch) = self.inputs.get_mut(&peer) else {
            return Err(Error::UnknownPeer(peer));
        };
        let ops = branch
            .ribin
            .add_route(InternalMessage::new(route, peer, genid), &mut cx);
        let ops = branch.below_ribin(ops, &mut cx);
        self.down.decide(ops, &mut cx);
        Ok(())
    }

    pub fn delete_route(
        &mut self,
        peer: PeerId,
        net: A::Prefix,
    ) -> Result<(), Error> {
        let genid = self.up_branch(peer)?;
        let mut cx = self.shared.cx();
        let Some(branch) = self.inputs.get_mut(&peer) else {
            return Err(Error::UnknownPeer(peer));
        };
        let Some(route) = branch.ribin.get(&net).cloned() else {
            pipeline_log!(cx.log, debug, branch.ribin.name(),
                "withdraw of unknown prefix {}", net
            );
            return Ok(());
        };
        let ops = branch
            .ribin
            .delete_route(InternalMessage::new(route, peer, genid), &mut cx);
        let ops = branch.below_ribin(ops, &mut cx);
        self.down.decide(ops, &mut cx);
        Ok(())
    }

    /// End of the burst of changes from `peer`.
    pub fn push(&mut self, peer: PeerId) -> Result<(), Error> {
        self.up_branch(peer)?;
        self.flow(peer, vec![RouteOp::Push(peer)]);
        self.shared.attrs.sweep();
        Ok(())
    }

    /// Announce `net` from this router.
    pub fn originate_route(
        &mut self,
        net: A::Prefix,
        nexthop: A,
    ) -> Result<(), Error> {
        let attrs = PathAttributeList::new(nexthop, Origin::Igp, AsPath::default())
            .with_local_pref(DEFAULT_LOCAL_PREF);
        let attrs = self.shared.attrs.intern(attrs);
        self.add_route(PeerId::LOCAL, SubnetRoute::new(net, attrs))?;
        self.push(PeerId::LOCAL)
    }

    pub fn withdraw_route(&mut self, net: A::Prefix) -> Result<(), Error> {
        let originated = self
            .inputs
            .get(&PeerId::LOCAL)
            .is_some_and(|b| b.ribin.get(&net).is_some());
        if !originated {
            return Err(Error::InvalidRoute(format!("{net} is not originated")));
        }
        self.delete_route(PeerId::LOCAL, net)?;
        self.push(PeerId::LOCAL)
    }

    pub fn originated(&self) -> Vec<A::Prefix> {
        self.inputs
            .get(&PeerId::LOCAL)
            .map(|b| b.ribin.routes().map(|r| r.net).collect())
            .unwrap_or_default()
    }

    /// Number of routes currently held from `peer`.
    pub fn route_count(&self, peer: PeerId) -> usize {
        self.inputs.get(&peer).map(|b| b.ribin.len()).unwrap_or(0)
    }

    /// Transport backpressure for `peer`. Clearing it releases whatever was
    /// queued meanwhile.
    pub fn set_busy(&mut self, peer: PeerId, busy: bool) {
        self.down.fanout.set_busy(peer, busy);
        if !busy {
            let mut cx = self.shared.cx();
            self.down.deliver(&mut cx);
        }
    }

    /// Updates ready to be sent to `peer`.
    pub fn take_updates(&mut self, peer: PeerId) -> Vec<RibOutUpdate<A>> {
        self.down
            .outputs
            .get_mut(&peer)
            .map(|o| o.ribout.take_updates())
            .unwrap_or_default()
    }

    /// Advance deletion tables and dumps by up to `budget` routes each.
    /// Returns true while background work remains.
    pub fn run_background(&mut self, budget: usize) -> bool {
        let mut pending = false;
        let mut cx = self.shared.cx();

        for branch in self.inputs.values_mut() {
            let Some(table) = branch.deletions.last_mut() else {
                continue;
            };
            let ops = table.step(budget, &mut cx);
            if table.is_done() {
                branch.deletions.pop();
            }
            let ops = branch.below_deletion(ops, &mut cx);
            self.down.decide(ops, &mut cx);
            pending |= !branch.deletions.is_empty();
        }

        pending |= self.down.step_dumps(budget, &mut cx);
        self.shared.attrs.sweep();
        pending
    }

    /// True while any dump to `peer` is still in progress.
    pub fn dumping(&self, peer: PeerId) -> bool {
        self.down
            .outputs
            .get(&peer)
            .is_some_and(|o| o.dump.is_some())
    }

    pub fn nexthop_answer(&mut self, query: QueryId, answer: NexthopAnswer) {
        let events = self.shared.resolver.answer(query, answer);
        self.resolver_events(events);
    }

    pub fn route_info_invalid(&mut self, prefix: A::Prefix) -> usize {
        self.shared
            .resolver
            .route_info_invalid(prefix, self.shared.rib.as_mut())
    }

    pub fn route_info_changed(&mut self, prefix: A::Prefix, metric: u32) {
        let changed = self.shared.resolver.route_info_changed(prefix, metric);
        self.resolver_events(ResolverEvents {
            ready: Vec::new(),
            changed,
        });
    }

    fn resolver_events(&mut self, events: ResolverEvents<A>) {
        let mut cx = self.shared.cx();
        for (peer, nexthop) in events.ready {
            let Some(branch) = self.inputs.get_mut(&peer) else {
                continue;
            };
            let ops = branch.nhlookup.lookup_done(nexthop, &mut cx);
            self.down.decide(ops, &mut cx);
        }
        for nexthop in events.changed {
            let ops = self.down.decision.igp_nexthop_changed(nexthop, &mut cx);
            self.down.output(ops, &mut cx);
        }
    }

    /// Collect whatever the RIB client has to say and feed it through.
    /// Returns how many answers and notifications were processed.
    pub fn poll_rib(&mut self) -> usize {
        let answers = self.shared.rib.poll_answers();
        let notifications = self.shared.rib.poll_notifications();
        let count = answers.len() + notifications.len();
        for (query, answer) in answers {
            self.nexthop_answer(query, answer);
        }
        for n in notifications {
            match n {
                RibNotification::Invalid(prefix) => {
                    self.route_info_invalid(prefix);
                }
                RibNotification::Changed(prefix, metric) => {
                    self.route_info_changed(prefix, metric);
                }
            }
        }
        count
    }

    pub fn winner(&self, net: &A::Prefix) -> Option<&InternalMessage<A>> {
        self.down.decision.winner(net)
    }

    pub fn winners(&self) -> &BTreeMap<A::Prefix, InternalMessage<A>> {
        self.down.decision.winners()
    }

    pub fn resolver(&self) -> &NextHopResolver<A> {
        &self.shared.resolver
    }

    pub fn interned_attributes(&self) -> usize {
        self.shared.attrs.len()
    }
}

/// The IPv4 and IPv6 pipelines of one router, driven together for
/// everything that concerns peerings rather than routes.
pub struct BgpPlumbing {
    pub ipv4: Plumbing<Ipv4Addr>,
    pub ipv6: Plumbing<Ipv6Addr>,
}

impl BgpPlumbing {
    pub fn new(
        local: LocalConfig,
        rib4: Box<dyn RibClient<Ipv4Addr>>,
        rib6: Box<dyn RibClient<Ipv6Addr>>,
        log: Logger,
    ) -> Self {
        Self {
            ipv4: Plumbing::new(local, rib4, log.clone()),
            ipv6: Plumbing::new(local, rib6, log),
        }
    }

    pub fn add_peering(&mut self, peer: PeerId) -> Result<(), Error> {
        self.ipv4.add_peering(peer)?;
        self.ipv6.add_peering(peer)
    }

    pub fn delete_peering(&mut self, peer: PeerId) -> Result<(), Error> {
        self.ipv4.delete_peering(peer)?;
        self.ipv6.delete_peering(peer)
    }

    /// `local_addr` is our end of the session. It becomes the next-hop of
    /// routes sent to EBGP peers in its address family.
    pub fn peering_came_up(
        &mut self,
        peer: PeerId,
        asn: u32,
        bgp_id: Ipv4Addr,
        ibgp: bool,
        local_addr: Option<IpAddr>,
    ) -> Result<GenId, Error> {
        let genid = self.ipv4.peering_came_up(
            peer,
            PeerInfo {
                asn,
                bgp_id,
                ibgp,
                local_addr: local_addr.and_then(Ipv4Addr::from_ip),
            },
        )?;
        self.ipv6.peering_came_up(
            peer,
            PeerInfo {
                asn,
                bgp_id,
                ibgp,
                local_addr: local_addr.and_then(Ipv6Addr::from_ip),
            },
        )?;
        Ok(genid)
    }

    pub fn peering_went_down(&mut self, peer: PeerId) -> Result<(), Error> {
        self.ipv4.peering_went_down(peer)?;
        self.ipv6.peering_went_down(peer)
    }

    pub fn set_busy(&mut self, peer: PeerId, busy: bool) {
        self.ipv4.set_busy(peer, busy);
        self.ipv6.set_busy(peer, busy);
    }

    pub fn run_background(&mut self, budget: usize) -> bool {
        let v4 = self.ipv4.run_background(budget);
        let v6 = self.ipv6.run_background(budget);
        v4 || v6
    }

    pub fn poll_rib(&mut self) -> usize {
        self.ipv4.poll_rib() + self.ipv6.poll_rib()
    }

    pub fn route_count(&self, peer: PeerId) -> usize {
        self.ipv4.route_count(peer) + self.ipv6.route_count(peer)
    }
}
