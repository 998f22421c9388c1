// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::log::pipeline_log;
use crate::table::{RouteTable, TableContext};
use crate::types::{Afi, InternalMessage, PeerId, RouteOp};
use std::collections::BTreeMap;

/// Remembers the exact route last forwarded for each prefix so that deletes
/// and replaces carry what downstream stages were actually given, whatever
/// the upstream filters did to it.
pub struct CacheTable<A: Afi> {
    peer: PeerId,
    routes: BTreeMap<A::Prefix, InternalMessage<A>>,
}

impl<A: Afi> CacheTable<A> {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            routes: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<A: Afi> RouteTable<A> for CacheTable<A> {
    fn name(&self) -> String {
        format!("cache-{}-{}", A::NAME, self.peer)
    }

    fn add_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        match self.routes.insert(msg.net(), msg.clone()) {
            Some(old) => {
                pipeline_log!(cx.log, warn, self.name(),
                    "add for cached prefix {}", msg.net()
                );
                vec![RouteOp::Replace { old, new: msg }]
            }
            None => vec![RouteOp::Add(msg)],
        }
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        match self.routes.remove(&msg.net()) {
            Some(cached) => vec![RouteOp::Delete(cached)],
            None => Vec::new(),
        }
    }

    fn replace_route(
        &mut self,
        _old: InternalMessage<A>,
        new: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        match self.routes.insert(new.net(), new.clone()) {
            Some(old) => vec![RouteOp::Replace { old, new }],
            None => vec![RouteOp::Add(new)],
        }
    }
}
