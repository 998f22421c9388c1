// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary between the BGP pipeline and the local routing table. The
//! pipeline asks the RIB whether next-hops are reachable and pushes the
//! routes it selects back down for installation.

use crate::log::resolver_log;
use crate::resolver::{NexthopAnswer, QueryId};
use crate::types::{Afi, Origin};
use slog::Logger;
use std::collections::{BTreeMap, VecDeque};

/// A selected route handed to the RIB for installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibRoute<A: Afi> {
    pub net: A::Prefix,
    pub nexthop: A,
    pub asn: Option<u32>,
    pub origin: Origin,
    pub igp_metric: u32,
}

/// Unsolicited reachability news from the RIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RibNotification<A: Afi> {
    /// Whatever was said about next-hops within this prefix may no longer
    /// hold. Answers must be fetched again.
    Invalid(A::Prefix),

    /// Next-hops within this prefix are now reached at a new IGP distance.
    Changed(A::Prefix, u32),
}

pub trait RibClient<A: Afi>: Send {
    /// Ask whether `nexthop` resolves. The answer arrives later through
    /// `poll_answers` (or is delivered by the embedding application).
    fn register_interest(&mut self, query: QueryId, nexthop: A);

    /// The answer to `query` is no longer wanted.
    fn deregister_interest(&mut self, query: QueryId, nexthop: A);

    fn add_route(&mut self, route: FibRoute<A>);
    fn delete_route(&mut self, net: A::Prefix);

    fn poll_answers(&mut self) -> Vec<(QueryId, NexthopAnswer)> {
        Vec::new()
    }

    fn poll_notifications(&mut self) -> Vec<RibNotification<A>> {
        Vec::new()
    }
}

/// An in-memory RIB. Next-hops resolve against a configured set of IGP
/// destinations by longest match, and installed routes are kept in a table
/// that can be inspected.
pub struct StaticRib<A: Afi> {
    igp: BTreeMap<A::Prefix, u32>,
    pending: VecDeque<(QueryId, A)>,
    notifications: Vec<RibNotification<A>>,
    fib: BTreeMap<A::Prefix, FibRoute<A>>,
    log: Logger,
}

impl<A: Afi> StaticRib<A> {
    pub fn new(log: Logger) -> Self {
        Self {
            igp: BTreeMap::new(),
            pending: VecDeque::new(),
            notifications: Vec::new(),
            fib: BTreeMap::new(),
            log,
        }
    }

    pub fn set_igp_route(&mut self, prefix: A::Prefix, metric: u32) {
        match self.igp.insert(prefix, metric) {
            Some(old) if old != metric => self
                .notifications
                .push(RibNotification::Changed(prefix, metric)),
            Some(_) => {}
            None => self.notifications.push(RibNotification::Invalid(prefix)),
        }
    }

    pub fn remove_igp_route(&mut self, prefix: A::Prefix) {
        if self.igp.remove(&prefix).is_some() {
            self.notifications.push(RibNotification::Invalid(prefix));
        }
    }

    pub fn lookup(&self, nexthop: A) -> NexthopAnswer {
        self.igp
            .iter()
            .filter(|(p, _)| A::prefix_contains(p, nexthop))
            .max_by_key(|(p, _)| A::prefix_len(p))
            .map(|(_, metric)| NexthopAnswer::resolved(*metric))
            .unwrap_or(NexthopAnswer::UNRESOLVED)
    }

    pub fn fib(&self) -> &BTreeMap<A::Prefix, FibRoute<A>> {
        &self.fib
    }
}

impl<A: Afi> RibClient<A> for StaticRib<A> {
    fn register_interest(&mut self, query: QueryId, nexthop: A) {
        self.pending.push_back((query, nexthop));
    }

    fn deregister_interest(&mut self, query: QueryId, _nexthop: A) {
        self.pending.retain(|(q, _)| *q != query);
    }

    fn add_route(&mut self, route: FibRoute<A>) {
        resolver_log!(self.log, info, "install {} via {}", route.net, route.nexthop;
            "afi" => A::NAME
        );
        self.fib.insert(route.net, route);
    }

    fn delete_route(&mut self, net: A::Prefix) {
        if self.fib.remove(&net).is_some() {
            resolver_log!(self.log, info, "uninstall {}", net;
                "afi" => A::NAME
            );
        }
    }

    fn poll_answers(&mut self) -> Vec<(QueryId, NexthopAnswer)> {
        let pending: Vec<_> = self.pending.drain(..).collect();
        pending
            .into_iter()
            .map(|(q, nh)| (q, self.lookup(nh)))
            .collect()
    }

    fn poll_notifications(&mut self) -> Vec<RibNotification<A>> {
        std::mem::take(&mut self.notifications)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Prefix4;
    use std::net::Ipv4Addr;

    #[test]
    fn longest_match_wins() {
        let mut rib =
            StaticRib::<Ipv4Addr>::new(bgp_common::log::discard_logger());
        rib.set_igp_route("10.0.0.0/8".parse::<Prefix4>().unwrap(), 20);
        rib.set_igp_route("10.1.0.0/16".parse::<Prefix4>().unwrap(), 5);

        assert_eq!(
            rib.lookup(Ipv4Addr::new(10, 1, 2, 3)),
            NexthopAnswer::resolved(5)
        );
        assert_eq!(
            rib.lookup(Ipv4Addr::new(10, 2, 2, 3)),
            NexthopAnswer::resolved(20)
        );
        assert_eq!(
            rib.lookup(Ipv4Addr::new(192, 0, 2, 1)),
            NexthopAnswer::UNRESOLVED
        );

        rib.register_interest(QueryId(1), Ipv4Addr::new(10, 1, 0, 1));
        rib.register_interest(QueryId(2), Ipv4Addr::new(10, 9, 0, 1));
        rib.deregister_interest(QueryId(2), Ipv4Addr::new(10, 9, 0, 1));
        assert_eq!(
            rib.poll_answers(),
            vec![(QueryId(1), NexthopAnswer::resolved(5))]
        );
        assert!(rib.poll_answers().is_empty());
    }
}
