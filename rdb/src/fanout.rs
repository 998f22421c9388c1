// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::{Afi, PeerId, RouteOp};
use std::collections::{BTreeMap, VecDeque};

/// Copies the decision stage's output into one queue per established peer.
///
/// A peer whose transport is busy keeps accumulating in its queue and is
/// drained in order once it is ready again. Queues are independent, a busy
/// peer never holds up anyone else.
pub struct FanoutTable<A: Afi> {
    queues: BTreeMap<PeerId, PeerQueue<A>>,
}

struct PeerQueue<A: Afi> {
    ops: VecDeque<RouteOp<A>>,
    busy: bool,
}

//NOTE necessary as #derive is broken for generic types
impl<A: Afi> Default for FanoutTable<A> {
    fn default() -> Self {
        Self {
            queues: BTreeMap::new(),
        }
    }
}

/// What `target` should see of `op`. Routes are never sent back to the peer
/// they came from, so a replace that crosses over to or from the target
/// degrades to an add or a delete.
fn translate<A: Afi>(target: PeerId, op: &RouteOp<A>) -> Option<RouteOp<A>> {
    match op {
        RouteOp::Add(m) | RouteOp::Delete(m) if m.origin == target => None,
        RouteOp::Replace { old, new } => {
            match (old.origin == target, new.origin == target) {
                (true, true) => None,
                (true, false) => Some(RouteOp::Add(new.clone())),
                (false, true) => Some(RouteOp::Delete(old.clone())),
                (false, false) => Some(op.clone()),
            }
        }
        _ => Some(op.clone()),
    }
}

impl<A: Afi> FanoutTable<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, peer: PeerId) {
        self.queues.insert(
            peer,
            PeerQueue {
                ops: VecDeque::new(),
                busy: false,
            },
        );
    }

    /// Drop the peer and anything still queued for it.
    pub fn remove_peer(&mut self, peer: PeerId) -> usize {
        self.queues.remove(&peer).map(|q| q.ops.len()).unwrap_or(0)
    }

    pub fn has_peer(&self, peer: PeerId) -> bool {
        self.queues.contains_key(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.queues.keys().copied()
    }

    pub fn set_busy(&mut self, peer: PeerId, busy: bool) {
        if let Some(q) = self.queues.get_mut(&peer) {
            q.busy = busy;
        }
    }

    pub fn is_busy(&self, peer: PeerId) -> bool {
        self.queues.get(&peer).map(|q| q.busy).unwrap_or(false)
    }

    pub fn queue_len(&self, peer: PeerId) -> usize {
        self.queues.get(&peer).map(|q| q.ops.len()).unwrap_or(0)
    }

    /// True when `peer` is ready and has nothing queued.
    pub fn is_idle(&self, peer: PeerId) -> bool {
        self.queues
            .get(&peer)
            .map(|q| !q.busy && q.ops.is_empty())
            .unwrap_or(false)
    }

    pub fn enqueue(&mut self, ops: &[RouteOp<A>]) {
        for (target, q) in self.queues.iter_mut() {
            q.ops
                .extend(ops.iter().filter_map(|op| translate(*target, op)));
        }
    }

    /// Everything queued for `peer`, in order. Nothing while the peer is
    /// busy.
    pub fn drain(&mut self, peer: PeerId) -> Vec<RouteOp<A>> {
        match self.queues.get_mut(&peer) {
            Some(q) if !q.busy => q.ops.drain(..).collect(),
            _ => Vec::new(),
        }
    }
}
