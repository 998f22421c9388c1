// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::log::pipeline_log;
use crate::table::{RouteTable, TableContext};
use crate::types::{Afi, GenId, InternalMessage, PeerId, RouteOp, SubnetRoute};
use std::collections::BTreeMap;

/// The routes of a session that went down, withdrawn a few at a time in the
/// background.
///
/// The table sits between the peer's RibIn and the rest of its branch. If the
/// next session announces a prefix that is still waiting to be withdrawn,
/// the announcement leaves as a replace of the stale route, and the stale
/// route is forgotten.
pub struct DeletionTable<A: Afi> {
    peer: PeerId,
    genid: GenId,
    routes: BTreeMap<A::Prefix, SubnetRoute<A>>,
    done: bool,
}

impl<A: Afi> DeletionTable<A> {
    pub fn new(
        peer: PeerId,
        genid: GenId,
        routes: BTreeMap<A::Prefix, SubnetRoute<A>>,
    ) -> Self {
        Self {
            peer,
            genid,
            routes,
            done: false,
        }
    }

    pub fn genid(&self) -> GenId {
        self.genid
    }

    pub fn pending(&self) -> usize {
        self.routes.len()
    }

    /// True once every route has been withdrawn and the closing push sent.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Withdraw up to `budget` routes. The final step also emits a push.
    pub fn step(
        &mut self,
        budget: usize,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        if self.done {
            return Vec::new();
        }
        let mut ops = Vec::new();
        for _ in 0..budget {
            let Some((_, route)) = self.routes.pop_first() else {
                break;
            };
            ops.push(RouteOp::Delete(InternalMessage::new(
                route, self.peer, self.genid,
            )));
        }
        if self.routes.is_empty() {
            pipeline_log!(cx.log, debug, self.name(), "deletion complete");
            self.done = true;
        }
        ops.push(RouteOp::Push(self.peer));
        ops
    }
}

impl<A: Afi> RouteTable<A> for DeletionTable<A> {
    fn name(&self) -> String {
        format!("deletion-{}-{}-{}", A::NAME, self.peer, self.genid)
    }

    fn add_route(
        &mut self,
        msg: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        match self.routes.remove(&msg.net()) {
            Some(stale) => vec![RouteOp::Replace {
                old: InternalMessage::new(stale, self.peer, self.genid),
                new: msg,
            }],
            None => vec![RouteOp::Add(msg)],
        }
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        vec![RouteOp::Delete(msg)]
    }

    fn replace_route(
        &mut self,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        vec![RouteOp::Replace { old, new }]
    }
}
