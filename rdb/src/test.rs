// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pipeline scenarios, driven through the plumbing the way the BGP peer
//! handlers drive it.

use crate::attributes::AttributeManager;
use crate::decision::DecisionTable;
use crate::plumbing::{LocalConfig, Plumbing};
use crate::resolver::{NextHopResolver, NexthopAnswer, QueryId};
use crate::rib::{FibRoute, RibClient};
use crate::ribout::RibOutUpdate;
use crate::table::{RouteTable, TableContext};
use crate::types::{
    AsPath, InternalMessage, Origin, PathAttributeList, PeerId, PeerInfo,
    Prefix4, RouteOp, SubnetRoute,
};
use bgp_common::lock;
use itertools::Itertools;
use pretty_assertions::assert_eq;
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

const LOCAL_ASN: u32 = 64500;
const NH: Ipv4Addr = Ipv4Addr::new(2, 0, 0, 1);

#[derive(Default)]
struct RibState {
    pending: Vec<(QueryId, Ipv4Addr)>,
    cancelled: Vec<QueryId>,
    fib: BTreeMap<Prefix4, FibRoute<Ipv4Addr>>,
}

/// A RIB client whose state the test keeps a handle on after giving it to
/// the plumbing.
#[derive(Clone, Default)]
struct SharedRib(Arc<Mutex<RibState>>);

impl RibClient<Ipv4Addr> for SharedRib {
    fn register_interest(&mut self, query: QueryId, nexthop: Ipv4Addr) {
        lock!(self.0).pending.push((query, nexthop));
    }

    fn deregister_interest(&mut self, query: QueryId, _nexthop: Ipv4Addr) {
        let mut state = lock!(self.0);
        state.pending.retain(|(q, _)| *q != query);
        state.cancelled.push(query);
    }

    fn add_route(&mut self, route: FibRoute<Ipv4Addr>) {
        lock!(self.0).fib.insert(route.net, route);
    }

    fn delete_route(&mut self, net: Prefix4) {
        lock!(self.0).fib.remove(&net);
    }
}

impl SharedRib {
    fn pending(&self) -> usize {
        lock!(self.0).pending.len()
    }

    fn installed(&self, net: &Prefix4) -> Option<FibRoute<Ipv4Addr>> {
        lock!(self.0).fib.get(net).cloned()
    }
}

fn log() -> Logger {
    bgp_common::log::discard_logger()
}

fn net(s: &str) -> Prefix4 {
    s.parse().unwrap()
}

fn plumbing() -> (Plumbing<Ipv4Addr>, SharedRib) {
    let rib = SharedRib::default();
    let p = Plumbing::new(
        LocalConfig {
            asn: LOCAL_ASN,
            bgp_id: Ipv4Addr::new(10, 0, 0, 100),
        },
        Box::new(rib.clone()),
        log(),
    );
    (p, rib)
}

fn info(n: u8, asn: u32) -> PeerInfo<Ipv4Addr> {
    PeerInfo {
        asn,
        bgp_id: Ipv4Addr::new(10, 0, 0, n),
        ibgp: asn == LOCAL_ASN,
        local_addr: None,
    }
}

fn bring_up(p: &mut Plumbing<Ipv4Addr>, n: u8, asn: u32) -> PeerId {
    let peer = PeerId(n.into());
    if p.genid(peer).is_none() {
        p.add_peering(peer).unwrap();
    }
    p.peering_came_up(peer, info(n, asn)).unwrap();
    settle(p);
    peer
}

fn settle(p: &mut Plumbing<Ipv4Addr>) {
    while p.run_background(1024) {}
}

fn route(net: Prefix4, path: &[u32]) -> SubnetRoute<Ipv4Addr> {
    SubnetRoute::new(
        net,
        Arc::new(PathAttributeList::new(
            NH,
            Origin::Igp,
            AsPath::sequence(path),
        )),
    )
}

fn answer_all(
    p: &mut Plumbing<Ipv4Addr>,
    rib: &SharedRib,
    answer: NexthopAnswer,
) {
    let pending: Vec<_> = lock!(rib.0).pending.drain(..).collect();
    for (q, _) in pending {
        p.nexthop_answer(q, answer);
    }
}

/// Replays the updates a peer received, checking it is never told about the
/// same announcement twice and never gets a withdrawal for something it was
/// not told about.
fn replay(
    view: &mut BTreeMap<Prefix4, Arc<PathAttributeList<Ipv4Addr>>>,
    updates: Vec<RibOutUpdate<Ipv4Addr>>,
) {
    for u in updates {
        for w in u.withdrawn {
            assert!(view.remove(&w).is_some(), "dangling withdrawal of {w}");
        }
        for (attrs, nets) in u.announce {
            for n in nets {
                assert_ne!(
                    view.insert(n, attrs.clone()),
                    Some(attrs.clone()),
                    "duplicate announcement of {n}"
                );
            }
        }
    }
}

#[test]
fn nhlookup_holds_until_resolved() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    let p2 = bring_up(&mut p, 2, 64502);
    let target = net("1.0.1.0/24");

    p.add_route(p1, route(target, &[64501])).unwrap();
    p.push(p1).unwrap();

    // held: nothing downstream and one query outstanding
    assert!(p.winner(&target).is_none());
    assert!(p.take_updates(p2).is_empty());
    assert_eq!(rib.pending(), 1);

    answer_all(&mut p, &rib, NexthopAnswer::resolved(10));

    let winner = p.winner(&target).unwrap();
    assert_eq!(winner.origin, p1);
    assert_eq!(winner.route.igp_metric, 10);

    let updates = p.take_updates(p2);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].announced(), 1);
    assert_eq!(updates[0].announce[0].1, vec![target]);
    assert_eq!(
        updates[0].announce[0].0.as_path,
        AsPath::sequence(&[LOCAL_ASN, 64501])
    );
    assert!(p.take_updates(p1).is_empty());

    let installed = rib.installed(&target).unwrap();
    assert_eq!(installed.nexthop, NH);
    assert_eq!(installed.asn, Some(64501));
}

#[test]
fn held_route_withdrawn_before_answer() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    let p2 = bring_up(&mut p, 2, 64502);
    let target = net("1.0.1.0/24");

    p.add_route(p1, route(target, &[64501])).unwrap();
    p.push(p1).unwrap();
    p.delete_route(p1, target).unwrap();
    p.push(p1).unwrap();

    // The query was cancelled with the last interest, so a late answer has
    // nowhere to go.
    assert_eq!(rib.pending(), 0);
    assert_eq!(lock!(rib.0).cancelled.len(), 1);
    p.nexthop_answer(QueryId(1), NexthopAnswer::resolved(1));
    assert!(p.winner(&target).is_none());
    assert!(p.take_updates(p2).is_empty());
}

fn decision_msg(
    attrs: &mut AttributeManager<Ipv4Addr>,
    peer: u32,
    local_pref: u32,
) -> InternalMessage<Ipv4Addr> {
    let a = attrs.intern(
        PathAttributeList::new(
            Ipv4Addr::new(192, 0, 2, peer as u8),
            Origin::Igp,
            AsPath::sequence(&[64510]),
        )
        .with_local_pref(local_pref),
    );
    let mut r = SubnetRoute::new(net("198.51.100.0/24"), a);
    r.nexthop_resolved = true;
    InternalMessage::new(r, PeerId(peer), 1)
}

#[test]
fn local_pref_winner_independent_of_arrival_order() {
    let log = log();
    let mut resolver = NextHopResolver::new(log.clone());
    let mut rib = SharedRib::default();
    let mut attrs = AttributeManager::new();
    let peers: BTreeMap<PeerId, PeerInfo<Ipv4Addr>> = (1..=3)
        .map(|n| (PeerId(n.into()), info(n, LOCAL_ASN)))
        .collect();

    let prefs = [(1u32, 100u32), (2, 200), (3, 300)];

    for order in prefs.iter().permutations(3) {
        let mut cx = TableContext {
            resolver: &mut resolver,
            rib: &mut rib,
            attrs: &mut attrs,
            peers: &peers,
            log: &log,
        };
        let mut decision = DecisionTable::new();
        for (peer, pref) in order {
            let m = decision_msg(cx.attrs, *peer, *pref);
            decision.add_route(m, &mut cx);
        }
        let net = net("198.51.100.0/24");
        let winner = decision.winner(&net).unwrap().clone();
        assert_eq!(winner.attributes().local_pref, Some(300));

        let ops = decision.delete_route(winner.clone(), &mut cx);
        let second = decision_msg(cx.attrs, 2, 200);
        assert_eq!(
            ops,
            vec![RouteOp::Replace {
                old: winner,
                new: second
            }]
        );
    }
}

#[test]
fn stale_generation_delete_ignored() {
    let log = log();
    let mut resolver = NextHopResolver::new(log.clone());
    let mut rib = SharedRib::default();
    let mut attrs = AttributeManager::new();
    let peers: BTreeMap<PeerId, PeerInfo<Ipv4Addr>> =
        [(PeerId(1), info(1, 64501))].into_iter().collect();
    let mut cx = TableContext {
        resolver: &mut resolver,
        rib: &mut rib,
        attrs: &mut attrs,
        peers: &peers,
        log: &log,
    };

    let mut decision = DecisionTable::new();
    let mut m = decision_msg(cx.attrs, 1, 100);
    m.genid = 2;
    assert_eq!(
        decision.add_route(m.clone(), &mut cx),
        vec![RouteOp::Add(m.clone())]
    );

    let mut stale = m.clone();
    stale.genid = 1;
    assert!(decision.delete_route(stale, &mut cx).is_empty());
    assert!(decision.winner(&m.net()).is_some());
}

#[test]
fn peer_down_during_dump() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    let p2 = bring_up(&mut p, 2, 64502);

    let from1: Vec<Prefix4> =
        (0..20).map(|i| net(&format!("10.0.{i}.0/24"))).collect();
    let from2: Vec<Prefix4> =
        (0..20).map(|i| net(&format!("10.1.{i}.0/24"))).collect();
    for n in &from1 {
        p.add_route(p1, route(*n, &[64501])).unwrap();
    }
    p.push(p1).unwrap();
    for n in &from2 {
        p.add_route(p2, route(*n, &[64502])).unwrap();
    }
    p.push(p2).unwrap();
    answer_all(&mut p, &rib, NexthopAnswer::resolved(1));
    assert_eq!(p.winners().len(), 40);

    p.add_peering(PeerId(3)).unwrap();
    let p3 = PeerId(3);
    p.peering_came_up(p3, info(3, 64503)).unwrap();

    let mut view = BTreeMap::new();

    // dump part of peer 1's routes, then lose peer 1
    assert!(p.run_background(5));
    replay(&mut view, p.take_updates(p3));
    assert_eq!(view.len(), 5);

    p.peering_went_down(p1).unwrap();
    while p.run_background(5) {
        replay(&mut view, p.take_updates(p3));
    }
    replay(&mut view, p.take_updates(p3));

    assert!(!p.dumping(p3));
    let expected: BTreeSet<Prefix4> = from2.into_iter().collect();
    assert_eq!(view.keys().copied().collect::<BTreeSet<_>>(), expected);
    assert_eq!(p.winners().len(), 20);
}

#[test]
fn target_down_abandons_dump() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    for i in 0..10 {
        p.add_route(p1, route(net(&format!("10.0.{i}.0/24")), &[64501]))
            .unwrap();
    }
    p.push(p1).unwrap();
    answer_all(&mut p, &rib, NexthopAnswer::resolved(1));

    p.add_peering(PeerId(2)).unwrap();
    p.peering_came_up(PeerId(2), info(2, 64502)).unwrap();
    assert!(p.run_background(3));
    assert!(p.dumping(PeerId(2)));

    p.peering_went_down(PeerId(2)).unwrap();
    assert!(!p.dumping(PeerId(2)));
    assert!(p.take_updates(PeerId(2)).is_empty());
    assert!(!p.run_background(3));
}

#[test]
fn live_changes_during_dump() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    let nets: Vec<Prefix4> =
        (0..10).map(|i| net(&format!("10.0.{i}.0/24"))).collect();
    for n in &nets {
        p.add_route(p1, route(*n, &[64501])).unwrap();
    }
    p.push(p1).unwrap();
    answer_all(&mut p, &rib, NexthopAnswer::resolved(1));

    let p2 = PeerId(2);
    p.add_peering(p2).unwrap();
    p.peering_came_up(p2, info(2, 64502)).unwrap();
    let mut view = BTreeMap::new();
    assert!(p.run_background(4));
    replay(&mut view, p.take_updates(p2));

    // one change behind the cursor, two ahead of it
    p.delete_route(p1, nets[1]).unwrap();
    p.delete_route(p1, nets[7]).unwrap();
    p.add_route(p1, route(net("10.0.200.0/24"), &[64501])).unwrap();
    p.push(p1).unwrap();
    replay(&mut view, p.take_updates(p2));

    settle(&mut p);
    replay(&mut view, p.take_updates(p2));

    let expected: BTreeSet<Prefix4> =
        p.winners().keys().copied().collect();
    assert_eq!(view.keys().copied().collect::<BTreeSet<_>>(), expected);
    assert!(!view.contains_key(&nets[1]));
    assert!(!view.contains_key(&nets[7]));
    assert!(view.contains_key(&net("10.0.200.0/24")));
}

#[test]
fn nexthop_invalidation() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    let p2 = bring_up(&mut p, 2, 64502);
    let target = net("1.0.1.0/24");

    p.add_route(p1, route(target, &[64501])).unwrap();
    p.push(p1).unwrap();
    answer_all(&mut p, &rib, NexthopAnswer::resolved(10));
    assert_eq!(p.take_updates(p2).len(), 1);

    // same answer, nothing moves
    assert_eq!(p.route_info_invalid(net("2.0.0.0/8")), 1);
    answer_all(&mut p, &rib, NexthopAnswer::resolved(10));
    assert!(p.take_updates(p2).is_empty());
    assert!(rib.installed(&target).is_some());

    // metric change is reflected in the winner
    p.route_info_changed(net("2.0.0.0/8"), 30);
    assert_eq!(p.winner(&target).unwrap().route.igp_metric, 30);

    // next-hop gone, route withdrawn everywhere
    assert_eq!(p.route_info_invalid(net("2.0.0.0/8")), 1);
    answer_all(&mut p, &rib, NexthopAnswer::UNRESOLVED);
    assert!(p.winner(&target).is_none());
    let updates = p.take_updates(p2);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].withdrawn, vec![target]);
    assert!(rib.installed(&target).is_none());

    // and back again
    assert_eq!(p.route_info_invalid(net("2.0.0.0/8")), 1);
    answer_all(&mut p, &rib, NexthopAnswer::resolved(5));
    assert_eq!(p.winner(&target).unwrap().origin, p1);
}

#[test]
fn session_flap_replaces_stale_routes() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    let p2 = bring_up(&mut p, 2, 64502);
    let target = net("1.0.1.0/24");
    let other = net("1.0.2.0/24");

    p.add_route(p1, route(target, &[64501])).unwrap();
    p.add_route(p1, route(other, &[64501])).unwrap();
    p.push(p1).unwrap();
    answer_all(&mut p, &rib, NexthopAnswer::resolved(1));
    let mut view = BTreeMap::new();
    replay(&mut view, p.take_updates(p2));
    assert_eq!(view.len(), 2);

    // down and straight back up, before the deletion table had a chance
    p.peering_went_down(p1).unwrap();
    assert_eq!(p.peering_came_up(p1, info(1, 64501)).unwrap(), 2);

    p.add_route(p1, route(target, &[64501])).unwrap();
    p.push(p1).unwrap();
    assert_eq!(p.winner(&target).unwrap().genid, 2);

    settle(&mut p);
    replay(&mut view, p.take_updates(p2));
    assert_eq!(view.keys().copied().collect::<Vec<_>>(), vec![target]);
    assert_eq!(p.winner(&target).unwrap().genid, 2);
    assert!(p.winner(&other).is_none());
}

#[test]
fn local_origination() {
    let (mut p, rib) = plumbing();
    let p2 = bring_up(&mut p, 2, 64502);
    let p3 = bring_up(&mut p, 3, LOCAL_ASN);
    let target = net("192.0.2.0/24");

    p.originate_route(target, Ipv4Addr::new(10, 0, 0, 100)).unwrap();
    assert_eq!(p.originated(), vec![target]);
    assert_eq!(rib.pending(), 0);
    assert!(rib.installed(&target).is_none());

    let updates = p.take_updates(p2);
    assert_eq!(updates.len(), 1);
    let (attrs, nets) = &updates[0].announce[0];
    assert_eq!(nets, &vec![target]);
    assert_eq!(attrs.as_path, AsPath::sequence(&[LOCAL_ASN]));
    assert_eq!(attrs.med, Some(0));
    assert_eq!(attrs.local_pref, None);

    // IBGP peers see the route unmodified
    let updates = p.take_updates(p3);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].announce[0].0.local_pref, Some(100));
    assert!(updates[0].announce[0].0.as_path.is_empty());

    p.withdraw_route(target).unwrap();
    assert_eq!(p.take_updates(p2)[0].withdrawn, vec![target]);
    assert!(p.withdraw_route(target).is_err());
}

#[test]
fn ibgp_routes_not_reflected_to_ibgp() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, LOCAL_ASN);
    let p2 = bring_up(&mut p, 2, LOCAL_ASN);
    let p3 = bring_up(&mut p, 3, 64503);
    let target = net("1.0.1.0/24");

    p.add_route(p1, route(target, &[64510])).unwrap();
    p.push(p1).unwrap();
    answer_all(&mut p, &rib, NexthopAnswer::resolved(1));

    assert!(p.winner(&target).is_some());
    assert!(p.take_updates(p2).is_empty());
    assert_eq!(p.take_updates(p3).len(), 1);
}

#[test]
fn own_as_in_path_dropped() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    let target = net("1.0.1.0/24");

    p.add_route(p1, route(target, &[64501, LOCAL_ASN])).unwrap();
    p.push(p1).unwrap();
    assert_eq!(rib.pending(), 0);
    assert!(p.winner(&target).is_none());
    assert_eq!(p.route_count(p1), 1);
}

#[test]
fn busy_peer_catches_up() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    let p2 = bring_up(&mut p, 2, 64502);
    let p3 = bring_up(&mut p, 3, 64503);

    p.set_busy(p2, true);
    p.add_route(p1, route(net("1.0.1.0/24"), &[64501])).unwrap();
    p.add_route(p1, route(net("1.0.2.0/24"), &[64501])).unwrap();
    p.push(p1).unwrap();
    answer_all(&mut p, &rib, NexthopAnswer::resolved(1));

    assert!(p.take_updates(p2).is_empty());
    assert_eq!(p.take_updates(p3).len(), 1);

    p.set_busy(p2, false);
    let updates = p.take_updates(p2);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].announced(), 2);
}

#[test]
fn delete_peering_unwinds_everything() {
    let (mut p, rib) = plumbing();
    let p1 = bring_up(&mut p, 1, 64501);
    let p2 = bring_up(&mut p, 2, 64502);
    let target = net("1.0.1.0/24");

    p.add_route(p1, route(target, &[64501])).unwrap();
    p.push(p1).unwrap();
    answer_all(&mut p, &rib, NexthopAnswer::resolved(1));
    p.take_updates(p2);

    p.delete_peering(p1).unwrap();
    assert!(p.winner(&target).is_none());
    assert!(rib.installed(&target).is_none());
    assert!(p.resolver().is_empty());
    assert_eq!(p.take_updates(p2)[0].withdrawn, vec![target]);
    assert_eq!(
        p.delete_peering(p1),
        Err(crate::error::Error::UnknownPeer(p1))
    );
}
