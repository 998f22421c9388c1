// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The decision stage joins every peer branch. It keeps the latest route
//! from each parent for each prefix and emits only changes in the winner.

use crate::bestpath::select_best;
use crate::log::pipeline_log;
use crate::table::{RouteTable, TableContext};
use crate::types::{Afi, InternalMessage, PeerId, RouteOp};
use std::collections::{BTreeMap, BTreeSet};

pub struct DecisionTable<A: Afi> {
    candidates: BTreeMap<A::Prefix, BTreeMap<PeerId, InternalMessage<A>>>,
    winners: BTreeMap<A::Prefix, InternalMessage<A>>,
    by_nexthop: BTreeMap<A, BTreeSet<A::Prefix>>,
}

impl<A: Afi> Default for DecisionTable<A> {
    fn default() -> Self {
        Self {
            candidates: BTreeMap::new(),
            winners: BTreeMap::new(),
            by_nexthop: BTreeMap::new(),
        }
    }
}

impl<A: Afi> DecisionTable<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn winners(&self) -> &BTreeMap<A::Prefix, InternalMessage<A>> {
        &self.winners
    }

    pub fn winner(&self, net: &A::Prefix) -> Option<&InternalMessage<A>> {
        self.winners.get(net)
    }

    pub fn candidates(
        &self,
        net: &A::Prefix,
    ) -> impl Iterator<Item = &InternalMessage<A>> {
        self.candidates.get(net).into_iter().flat_map(|c| c.values())
    }

    /// Number of prefixes with at least one candidate from `peer`.
    pub fn routes_from(&self, peer: PeerId) -> usize {
        self.candidates
            .values()
            .filter(|c| c.contains_key(&peer))
            .count()
    }

    fn insert(&mut self, msg: InternalMessage<A>) {
        if !msg.origin.is_local() {
            self.by_nexthop
                .entry(msg.route.nexthop())
                .or_default()
                .insert(msg.net());
        }
        self.candidates
            .entry(msg.net())
            .or_default()
            .insert(msg.origin, msg);
    }

    fn remove(
        &mut self,
        net: A::Prefix,
        origin: PeerId,
    ) -> Option<InternalMessage<A>> {
        let cands = self.candidates.get_mut(&net)?;
        let removed = cands.remove(&origin)?;
        if cands.is_empty() {
            self.candidates.remove(&net);
        }

        let nexthop = removed.route.nexthop();
        let shared = self
            .candidates(&net)
            .any(|c| !c.origin.is_local() && c.route.nexthop() == nexthop);
        if !shared && !removed.origin.is_local() {
            if let Some(nets) = self.by_nexthop.get_mut(&nexthop) {
                nets.remove(&net);
                if nets.is_empty() {
                    self.by_nexthop.remove(&nexthop);
                }
            }
        }
        Some(removed)
    }

    /// True when the operation refers to the session whose route is held.
    fn current_session(&self, msg: &InternalMessage<A>) -> bool {
        self.candidates
            .get(&msg.net())
            .and_then(|c| c.get(&msg.origin))
            .map(|held| held.genid == msg.genid)
            .unwrap_or(false)
    }

    fn recompute(
        &mut self,
        net: A::Prefix,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        let current = self.winners.get(&net).map(|w| w.origin);
        let best = select_best(self.candidates(&net), current, cx.peers)
            .and_then(|p| self.candidates.get(&net)?.get(&p).cloned());

        match (self.winners.remove(&net), best) {
            (None, None) => Vec::new(),
            (None, Some(new)) => {
                self.winners.insert(net, new.clone());
                vec![RouteOp::Add(new)]
            }
            (Some(old), None) => vec![RouteOp::Delete(old)],
            (Some(old), Some(new)) => {
                self.winners.insert(net, new.clone());
                if old == new {
                    Vec::new()
                } else {
                    vec![RouteOp::Replace { old, new }]
                }
            }
        }
    }

    /// The resolver's answer for `nexthop` changed. Restamp every candidate
    /// using it and rerun the decision for the affected prefixes.
    pub fn igp_nexthop_changed(
        &mut self,
        nexthop: A,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        let answer = cx.resolver.lookup(nexthop);
        let (resolves, metric) = match answer {
            Some(a) if a.resolves => (true, a.metric),
            _ => (false, 0),
        };

        let nets: Vec<A::Prefix> = self
            .by_nexthop
            .get(&nexthop)
            .map(|n| n.iter().copied().collect())
            .unwrap_or_default();

        pipeline_log!(cx.log, debug, self.name(),
            "nexthop {} changed, {} prefixes", nexthop, nets.len();
            "resolves" => resolves,
            "metric" => metric
        );

        let mut ops = Vec::new();
        for net in nets {
            if let Some(cands) = self.candidates.get_mut(&net) {
                for c in cands.values_mut() {
                    if c.origin.is_local() || c.route.nexthop() != nexthop {
                        continue;
                    }
                    c.route.nexthop_resolved = resolves;
                    c.route.igp_metric = metric;
                }
            }
            ops.extend(self.recompute(net, cx));
        }
        if !ops.is_empty() {
            ops.push(RouteOp::Push(PeerId::LOCAL));
        }
        ops
    }
}

impl<A: Afi> RouteTable<A> for DecisionTable<A> {
    fn name(&self) -> String {
        format!("decision-{}", A::NAME)
    }

    fn add_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        let net = msg.net();
        self.remove(net, msg.origin);
        self.insert(msg);
        self.recompute(net, cx)
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        if !self.current_session(&msg) {
            pipeline_log!(cx.log, debug, self.name(),
                "ignoring delete of {} from {} genid {}",
                msg.net(), msg.origin, msg.genid
            );
            return Vec::new();
        }
        let net = msg.net();
        self.remove(net, msg.origin);
        self.recompute(net, cx)
    }

    fn replace_route(
        &mut self,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        if !self.current_session(&old) {
            pipeline_log!(cx.log, debug, self.name(),
                "ignoring replace of {} from {} genid {}",
                old.net(), old.origin, old.genid
            );
            return Vec::new();
        }
        let net = new.net();
        self.remove(net, old.origin);
        self.insert(new);
        self.recompute(net, cx)
    }
}
