// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed route filters applied on the way into and out of the pipeline.
//!
//! Filters are pure functions of the route and the peers known to the
//! pipeline. The same route always filters the same way, so a stage
//! downstream of a filter sees consistent adds and deletes.

use crate::table::{RouteTable, TableContext};
use crate::types::{Afi, InternalMessage, PeerId, PeerInfo, RouteOp};

/// The default LOCAL_PREF given to routes learned over EBGP and to routes
/// originated locally.
pub const DEFAULT_LOCAL_PREF: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter<A: Afi> {
    /// Drop routes whose AS path contains the given AS.
    SimpleAsPath(u32),

    /// Set LOCAL_PREF when the route does not carry one.
    LocalPrefInsertion(u32),

    LocalPrefRemoval,

    AsPrepend(u32),

    MedRemoval,

    /// Set MED to the IGP distance of locally originated routes.
    MedInsertion,

    NexthopRewrite(A),

    /// Never pass routes learned from an IBGP peer.
    IbgpLoop,
}

impl<A: Afi> Filter<A> {
    /// Returns the filtered message, or `None` if the route is dropped.
    pub fn apply(
        &self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Option<InternalMessage<A>> {
        let attrs = &msg.route.attributes;
        let modified = match self {
            Filter::SimpleAsPath(asn) => {
                return (!attrs.as_path.contains(*asn)).then_some(msg);
            }
            Filter::IbgpLoop => {
                return (!cx.peer_is_ibgp(msg.origin)).then_some(msg);
            }
            Filter::LocalPrefInsertion(pref) => {
                if attrs.local_pref.is_some() {
                    return Some(msg);
                }
                let mut a = (**attrs).clone();
                a.local_pref = Some(*pref);
                a
            }
            Filter::LocalPrefRemoval => {
                if attrs.local_pref.is_none() {
                    return Some(msg);
                }
                let mut a = (**attrs).clone();
                a.local_pref = None;
                a
            }
            Filter::AsPrepend(asn) => {
                let mut a = (**attrs).clone();
                a.as_path = attrs.as_path.prepend(*asn);
                a
            }
            Filter::MedRemoval => {
                if attrs.med.is_none() {
                    return Some(msg);
                }
                let mut a = (**attrs).clone();
                a.med = None;
                a
            }
            Filter::MedInsertion => {
                if !msg.origin.is_local() {
                    return Some(msg);
                }
                let mut a = (**attrs).clone();
                a.med = Some(msg.route.igp_metric);
                a
            }
            Filter::NexthopRewrite(nexthop) => {
                if attrs.nexthop == *nexthop {
                    return Some(msg);
                }
                let mut a = (**attrs).clone();
                a.nexthop = *nexthop;
                a
            }
        };

        let mut msg = msg;
        msg.route.attributes = cx.attrs.intern(modified);
        Some(msg)
    }
}

/// A chain of filters. Replaces are split into adds or deletes when only
/// one side survives.
pub struct FilterTable<A: Afi> {
    name: String,
    filters: Vec<Filter<A>>,
}

impl<A: Afi> FilterTable<A> {
    pub fn new(name: impl Into<String>, filters: Vec<Filter<A>>) -> Self {
        Self {
            name: name.into(),
            filters,
        }
    }

    /// Filters for routes arriving from `peer`.
    pub fn inbound(peer: PeerId, local_asn: u32, info: &PeerInfo<A>) -> Self {
        let mut filters = vec![Filter::SimpleAsPath(local_asn)];
        if !info.ibgp {
            filters.push(Filter::LocalPrefInsertion(DEFAULT_LOCAL_PREF));
        }
        Self::new(format!("filter-in-{}-{}", A::NAME, peer), filters)
    }

    /// Filters for routes leaving toward `peer`.
    pub fn outbound(peer: PeerId, local_asn: u32, info: &PeerInfo<A>) -> Self {
        let mut filters = vec![Filter::SimpleAsPath(info.asn)];
        if info.ibgp {
            filters.push(Filter::IbgpLoop);
        } else {
            filters.push(Filter::AsPrepend(local_asn));
            filters.push(Filter::MedRemoval);
            filters.push(Filter::MedInsertion);
            if let Some(addr) = info.local_addr {
                filters.push(Filter::NexthopRewrite(addr));
            }
            filters.push(Filter::LocalPrefRemoval);
        }
        Self::new(format!("filter-out-{}-{}", A::NAME, peer), filters)
    }

    pub fn filters(&self) -> &[Filter<A>] {
        &self.filters
    }

    fn apply(
        &self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Option<InternalMessage<A>> {
        self.filters
            .iter()
            .try_fold(msg, |msg, filter| filter.apply(msg, cx))
    }
}

impl<A: Afi> RouteTable<A> for FilterTable<A> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn add_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        self.apply(msg, cx).map(RouteOp::Add).into_iter().collect()
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        self.apply(msg, cx).map(RouteOp::Delete).into_iter().collect()
    }

    fn replace_route(
        &mut self,
        old: InternalMessage<A>,
        new: InternalMessage<A>,
        cx: &mut TableContext<'_, A>,
    ) -> Vec<RouteOp<A>> {
        match (self.apply(old, cx), self.apply(new, cx)) {
            (Some(old), Some(new)) => vec![RouteOp::Replace { old, new }],
            (Some(old), None) => vec![RouteOp::Delete(old)],
            (None, Some(new)) => vec![RouteOp::Add(new)],
            (None, None) => Vec::new(),
        }
    }
}
