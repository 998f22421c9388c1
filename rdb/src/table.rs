// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract shared by every route table stage.
//!
//! A stage consumes route operations from its parent and produces the
//! operations its child must see. Stages never call each other; the
//! [`crate::plumbing::Plumbing`] owns all of them and moves operations along
//! the chain. State shared by all stages travels in a [`TableContext`].

use crate::attributes::AttributeManager;
use crate::resolver::NextHopResolver;
use crate::rib::RibClient;
use crate::types::{Afi, InternalMessage, PeerId, PeerInfo, RouteOp};
use slog::Logger;
use std::collections::BTreeMap;

pub struct TableContext<'a, A: Afi> {
    pub resolver: &'a mut NextHopResolver<A>,
    pub rib: &'a mut dyn RibClient<A>,
    pub attrs: &'a mut AttributeManager<A>,
    pub peers: &'a BTreeMap<PeerId, PeerInfo<A>>,
    pub log: &'a Logger,
}

impl<A: Afi> TableContext<'_, A> {
    pub fn peer_is_ibgp(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).map(|p| p.ibgp).unwrap_or(false)
    }
}

pub trait RouteTable<A: Afi> {
    fn name(&self) -> String;

    fn add_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>>;

    fn delete_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>>;

    /// Replace `old` by `new` for the same prefix. Stages see both sides so
    /// the change propagates without a visible withdrawal.
    fn replace_route(
        &mut self,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>>;

    /// End of a burst from `peer`.
    fn push(
        &mut self,
        peer: PeerId,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        vec![RouteOp::Push(peer)]
    }

    fn route_op(
        &mut self,
        op: RouteOp<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        match op {
            RouteOp::Add(msg) => self.add_route(msg, cx),
            RouteOp::Delete(msg) => self.delete_route(msg, cx),
            RouteOp::Replace { old, new } => self.replace_route(old, new, cx),
            RouteOp::Push(peer) => self.push(peer, cx),
        }
    }
}

/// Feed a batch of operations through one stage, preserving order.
pub fn run_ops<A: Afi, T: RouteTable<A> + ?Sized>(
    table: &mut T,
    ops: Vec<RouteOp<A>>,
    cx: &mut TableContext<'_, A>,
) -> Vec<RouteOp<A>> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        out.extend(table.route_op(op, cx));
    }
    out
}
