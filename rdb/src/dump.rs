// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronizing a newly established peer.
//!
//! A dump walks the decision stage's winners in prefix order a bounded
//! number of routes at a time, while live changes keep arriving through the
//! fan-out queue. The cursor splits the prefix space in two. Below it, the
//! peer has been sent the walk's view and live changes apply on top. Above
//! it, the peer has been sent nothing, and since the walk will pick up the
//! winner as it stands when it gets there, live changes are dropped.
//!
//! Winners contributed by a peer that went down after the dump started are
//! stale and skipped. Their eventual withdrawal is then swallowed, and a
//! replace of one becomes a plain add.

use crate::log::pipeline_log;
use crate::table::{RouteTable, TableContext};
use crate::types::{Afi, GenId, InternalMessage, PeerId, RouteOp};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};

pub struct DumpTable<A: Afi> {
    target: PeerId,
    cursor: Option<A::Prefix>,
    down_peers: BTreeMap<PeerId, GenId>,
    skipped: BTreeSet<A::Prefix>,
    done: bool,
}

impl<A: Afi> DumpTable<A> {
    pub fn new(target: PeerId) -> Self {
        Self {
            target,
            cursor: None,
            down_peers: BTreeMap::new(),
            skipped: BTreeSet::new(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn target(&self) -> PeerId {
        self.target
    }

    /// A peer whose routes may still be among the winners went down. Its
    /// routes from `genid` or earlier are no longer dumped.
    pub fn peering_went_down(&mut self, peer: PeerId, genid: GenId) {
        self.down_peers.insert(peer, genid);
    }

    /// True when `net` has already been covered by the walk.
    fn dumped(&self, net: &A::Prefix) -> bool {
        match &self.cursor {
            _ if self.done => true,
            Some(c) => net <= c,
            None => false,
        }
    }

    fn stale(&self, msg: &InternalMessage<A>) -> bool {
        self.down_peers
            .get(&msg.origin)
            .is_some_and(|g| msg.genid <= *g)
    }

    /// Advance the walk by up to `budget` prefixes. Ends with a push so the
    /// out-branch flushes what was produced.
    pub fn step(
        &mut self,
        winners: &BTreeMap<A::Prefix, InternalMessage<A>>,
        budget: usize,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        if self.done {
            return Vec::new();
        }

        let lower = match self.cursor {
            Some(c) => Excluded(c),
            None => Unbounded,
        };

        let mut ops = Vec::new();
        let mut walked = 0;
        let mut range = winners.range((lower, Unbounded));
        loop {
            if walked >= budget {
                break;
            }
            let Some((net, winner)) = range.next() else {
                self.done = true;
                break;
            };
            walked += 1;
            self.cursor = Some(*net);
            if winner.origin == self.target {
                continue;
            }
            if self.stale(winner) {
                self.skipped.insert(*net);
                continue;
            }
            ops.push(RouteOp::Add(winner.clone()));
        }

        if !self.done && range.next().is_none() {
            self.done = true;
        }
        if self.done {
            pipeline_log!(cx.log, info, self.name(),
                "dump complete";
                "skipped" => self.skipped.len()
            );
        }

        ops.push(RouteOp::Push(PeerId::LOCAL));
        ops
    }
}

impl<A: Afi> RouteTable<A> for DumpTable<A> {
    fn name(&self) -> String {
        format!("dump-{}-{}", A::NAME, self.target)
    }

    fn add_route(
        &mut self,
        msg: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        if !self.dumped(&msg.net()) {
            return Vec::new();
        }
        self.skipped.remove(&msg.net());
        vec![RouteOp::Add(msg)]
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        if !self.dumped(&msg.net()) || self.skipped.remove(&msg.net()) {
            return Vec::new();
        }
        vec![RouteOp::Delete(msg)]
    }

    fn replace_route(
        &mut self,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        if !self.dumped(&new.net()) {
            return Vec::new();
        }
        if self.skipped.remove(&new.net()) {
            return vec![RouteOp::Add(new)];
        }
        vec![RouteOp::Replace { old, new }]
    }
}
