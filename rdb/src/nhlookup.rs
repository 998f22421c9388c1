// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The next-hop lookup stage.
//!
//! Every route passing through registers interest in its next-hop with the
//! resolver. When the resolver already has an answer the route continues
//! at once, stamped with the answer. Otherwise the route is held here until
//! the answer comes back. Deletes and replaces that arrive for a held route
//! are folded into what is held, so the eventual release is exactly what
//! the decision stage needs to see.

use crate::log::pipeline_log;
use crate::resolver::NexthopAnswer;
use crate::table::{RouteTable, TableContext};
use crate::types::{Afi, InternalMessage, PeerId, RouteOp};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Queued<A: Afi> {
    /// Never forwarded. Releases as an add.
    Add(InternalMessage<A>),

    /// `old` was forwarded earlier. Releases as a replace.
    Replace {
        old: InternalMessage<A>,
        new: InternalMessage<A>,
    },
}

impl<A: Afi> Queued<A> {
    fn pending(&self) -> &InternalMessage<A> {
        match self {
            Queued::Add(m) => m,
            Queued::Replace { new, .. } => new,
        }
    }
}

pub struct NhLookupTable<A: Afi> {
    peer: PeerId,
    queue: BTreeMap<A::Prefix, Queued<A>>,
    by_nexthop: BTreeMap<A, BTreeSet<A::Prefix>>,
}

fn stamp<A: Afi>(
    mut msg: InternalMessage<A>,
    answer: NexthopAnswer,
) -> InternalMessage<A> {
    msg.route.nexthop_resolved = answer.resolves;
    msg.route.igp_metric = if answer.resolves { answer.metric } else { 0 };
    msg
}

impl<A: Afi> NhLookupTable<A> {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            queue: BTreeMap::new(),
            by_nexthop: BTreeMap::new(),
        }
    }

    /// Number of routes held waiting on an answer.
    pub fn held(&self) -> usize {
        self.queue.len()
    }

    pub fn is_held(&self, net: &A::Prefix) -> bool {
        self.queue.contains_key(net)
    }

    fn register(
        &self,
        msg: &InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Option<NexthopAnswer> {
        if msg.origin.is_local() {
            return Some(NexthopAnswer::resolved(0));
        }
        cx.resolver
            .register_nexthop(msg.route.nexthop(), msg.net(), self.peer, cx.rib)
    }

    fn deregister(
        &self,
        msg: &InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) {
        if msg.origin.is_local() {
            return;
        }
        cx.resolver.deregister_nexthop(
            msg.route.nexthop(),
            msg.net(),
            self.peer,
            cx.rib,
        );
    }

    fn hold(&mut self, queued: Queued<A>) {
        let pending = queued.pending();
        self.by_nexthop
            .entry(pending.route.nexthop())
            .or_default()
            .insert(pending.net());
        self.queue.insert(pending.net(), queued);
    }

    fn unhold(&mut self, net: &A::Prefix) -> Option<Queued<A>> {
        let queued = self.queue.remove(net)?;
        let nexthop = queued.pending().route.nexthop();
        if let Some(nets) = self.by_nexthop.get_mut(&nexthop) {
            nets.remove(net);
            if nets.is_empty() {
                self.by_nexthop.remove(&nexthop);
            }
        }
        Some(queued)
    }

    /// The resolver has answered for `nexthop`. Release every route held on
    /// it.
    pub fn lookup_done(
        &mut self,
        nexthop: A,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        let Some(answer) = cx.resolver.lookup(nexthop) else {
            return Vec::new();
        };
        let nets: Vec<A::Prefix> = self
            .by_nexthop
            .get(&nexthop)
            .map(|nets| nets.iter().copied().collect())
            .unwrap_or_default();
        if nets.is_empty() {
            return Vec::new();
        }

        pipeline_log!(cx.log, debug, self.name(),
            "{} answered, releasing {} routes", nexthop, nets.len()
        );

        let mut ops = Vec::with_capacity(nets.len() + 1);
        for net in nets {
            match self.unhold(&net) {
                Some(Queued::Add(msg)) => {
                    ops.push(RouteOp::Add(stamp(msg, answer)))
                }
                Some(Queued::Replace { old, new }) => {
                    ops.push(RouteOp::Replace {
                        old,
                        new: stamp(new, answer),
                    })
                }
                None => {}
            }
        }
        ops.push(RouteOp::Push(self.peer));
        ops
    }
}

impl<A: Afi> RouteTable<A> for NhLookupTable<A> {
    fn name(&self) -> String {
        format!("nhlookup-{}-{}", A::NAME, self.peer)
    }

    fn add_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        match self.register(&msg, cx) {
            Some(answer) => vec![RouteOp::Add(stamp(msg, answer))],
            None => {
                self.hold(Queued::Add(msg));
                Vec::new()
            }
        }
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        let held = self.unhold(&msg.net());
        self.deregister(&msg, cx);
        match held {
            // never seen downstream
            Some(Queued::Add(_)) => Vec::new(),
            Some(Queued::Replace { old, .. }) => vec![RouteOp::Delete(old)],
            None => vec![RouteOp::Delete(msg)],
        }
    }

    fn replace_route(
        &mut self,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        // Register the new next-hop before dropping the old one so a shared
        // next-hop keeps its cached answer.
        let answer = self.register(&new, cx);
        let held = self.unhold(&old.net());
        self.deregister(&old, cx);

        let forwarded = match held {
            Some(Queued::Add(_)) => None,
            Some(Queued::Replace { old, .. }) => Some(old),
            None => Some(old),
        };

        match (answer, forwarded) {
            (Some(answer), None) => vec![RouteOp::Add(stamp(new, answer))],
            (Some(answer), Some(old)) => vec![RouteOp::Replace {
                old,
                new: stamp(new, answer),
            }],
            (None, None) => {
                self.hold(Queued::Add(new));
                Vec::new()
            }
            (None, Some(old)) => {
                self.hold(Queued::Replace { old, new });
                Vec::new()
            }
        }
    }
}
