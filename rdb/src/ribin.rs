// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::log::pipeline_log;
use crate::table::{RouteTable, TableContext};
use crate::types::{Afi, GenId, InternalMessage, PeerId, RouteOp, SubnetRoute};
use std::collections::BTreeMap;

/// Routes received from one peer, as received. The head of a peer's branch.
///
/// At most one route per prefix is held. A second add for a prefix already
/// present leaves the table as a replace, and an add carrying exactly the
/// route already held is dropped.
pub struct RibInTable<A: Afi> {
    peer: PeerId,
    genid: GenId,
    routes: BTreeMap<A::Prefix, SubnetRoute<A>>,
}

impl<A: Afi> RibInTable<A> {
    pub fn new(peer: PeerId, genid: GenId) -> Self {
        Self {
            peer,
            genid,
            routes: BTreeMap::new(),
        }
    }

    pub fn genid(&self) -> GenId {
        self.genid
    }

    /// Start holding routes for a new session.
    pub fn set_genid(&mut self, genid: GenId) {
        self.genid = genid;
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn get(&self, net: &A::Prefix) -> Option<&SubnetRoute<A>> {
        self.routes.get(net)
    }

    pub fn routes(&self) -> impl Iterator<Item = &SubnetRoute<A>> {
        self.routes.values()
    }

    /// Empty the table, handing back everything it held. Used when the
    /// session goes down and the contents move to a deletion table.
    pub fn take_all(&mut self) -> BTreeMap<A::Prefix, SubnetRoute<A>> {
        std::mem::take(&mut self.routes)
    }

    fn msg(&self, route: SubnetRoute<A>) -> InternalMessage<A> {
        InternalMessage::new(route, self.peer, self.genid)
    }
}

impl<A: Afi> RouteTable<A> for RibInTable<A> {
    fn name(&self) -> String {
        format!("ribin-{}-{}", A::NAME, self.peer)
    }

    fn add_route(
        &mut self,
        msg: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        let route = msg.route;
        match self.routes.insert(route.net, route.clone()) {
            Some(old) if old == route => Vec::new(),
            Some(old) => vec![RouteOp::Replace {
                old: self.msg(old),
                new: self.msg(route),
            }],
            None => vec![RouteOp::Add(self.msg(route))],
        }
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        match self.routes.remove(&msg.net()) {
            Some(old) => vec![RouteOp::Delete(self.msg(old))],
            None => {
                pipeline_log!(cx.log, debug, self.name(),
                    "withdraw of unknown prefix {}", msg.net()
                );
                Vec::new()
            }
        }
    }

    fn replace_route(
        &mut self,
        _old: InternalMessage<A>,
        new: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        self.add_route(new, cx)
    }

    fn push(
        &mut self,
        _peer: PeerId,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        vec![RouteOp::Push(self.peer)]
    }
}
