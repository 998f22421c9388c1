// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::table::{RouteTable, TableContext};
use crate::types::{Afi, InternalMessage, PathAttributeList, PeerId, RouteOp};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// A batch of changes ready to be encoded toward one peer. Prefixes sharing
/// an attribute list are announced together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RibOutUpdate<A: Afi> {
    pub withdrawn: Vec<A::Prefix>,
    pub announce: Vec<(Arc<PathAttributeList<A>>, Vec<A::Prefix>)>,
}

impl<A: Afi> RibOutUpdate<A> {
    pub fn is_empty(&self) -> bool {
        self.withdrawn.is_empty() && self.announce.is_empty()
    }

    pub fn announced(&self) -> usize {
        self.announce.iter().map(|(_, nets)| nets.len()).sum()
    }
}

/// The routes sent to one peer. Changes accumulate until a push, then
/// leave as one update. Only differences from what the peer already has are
/// sent, so the peer never sees the same announcement twice or a withdrawal
/// of something it was never told about.
pub struct RibOutTable<A: Afi> {
    peer: PeerId,
    sent: BTreeMap<A::Prefix, Arc<PathAttributeList<A>>>,
    pending: BTreeMap<A::Prefix, Option<Arc<PathAttributeList<A>>>>,
    updates: VecDeque<RibOutUpdate<A>>,
}

impl<A: Afi> RibOutTable<A> {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            sent: BTreeMap::new(),
            pending: BTreeMap::new(),
            updates: VecDeque::new(),
        }
    }

    pub fn sent(&self) -> &BTreeMap<A::Prefix, Arc<PathAttributeList<A>>> {
        &self.sent
    }

    pub fn take_updates(&mut self) -> Vec<RibOutUpdate<A>> {
        self.updates.drain(..).collect()
    }

    fn announce(&mut self, msg: InternalMessage<A>) {
        self.pending
            .insert(msg.net(), Some(msg.route.attributes.clone()));
    }

    fn withdraw(&mut self, net: A::Prefix) {
        self.pending.insert(net, None);
    }

    fn flush(&mut self) {
        let mut withdrawn = Vec::new();
        let mut groups: Vec<(Arc<PathAttributeList<A>>, Vec<A::Prefix>)> =
            Vec::new();

        for (net, change) in std::mem::take(&mut self.pending) {
            match change {
                None => {
                    if self.sent.remove(&net).is_some() {
                        withdrawn.push(net);
                    }
                }
                Some(attrs) => {
                    if self.sent.get(&net) == Some(&attrs) {
                        continue;
                    }
                    self.sent.insert(net, attrs.clone());
                    match groups.iter_mut().find(|(a, _)| *a == attrs) {
                        Some((_, nets)) => nets.push(net),
                        None => groups.push((attrs, vec![net])),
                    }
                }
            }
        }

        let update = RibOutUpdate {
            withdrawn,
            announce: groups,
        };
        if !update.is_empty() {
            self.updates.push_back(update);
        }
    }
}

impl<A: Afi> RouteTable<A> for RibOutTable<A> {
    fn name(&self) -> String {
        format!("ribout-{}-{}", A::NAME, self.peer)
    }

    fn add_route(
        &mut self,
        msg: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        self.announce(msg);
        Vec::new()
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        self.withdraw(msg.net());
        Vec::new()
    }

    fn replace_route(
        &mut self,
        _old: InternalMessage<A>,
        new: InternalMessage<A>,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        self.announce(new);
        Vec::new()
    }

    fn push(
        &mut self,
        _peer: PeerId,
        _cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        self.flush();
        Vec::new()
    }
}
