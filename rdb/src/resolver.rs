// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Next-hop resolution.
//!
//! The resolver sits between the next-hop lookup stages of every peer branch
//! and the RIB client. It keeps one entry per next-hop address with the last
//! answer the RIB gave for it and the set of (subscriber, prefix) pairs that
//! care. Interest from many subscribers in the same next-hop results in a
//! single outstanding query to the RIB.
//!
//! Answers are asynchronous. A subscriber registering interest in a next-hop
//! with no cached answer is put on the entry's waiting list, and when the
//! answer arrives the resolver reports `(subscriber, nexthop)` pairs for the
//! caller to dispatch. Deregistering removes the subscriber from the waiting
//! list, so an answer that arrives after a subscriber lost interest is never
//! reported to it. When an entry loses its last interest the query is
//! cancelled and a late answer is dropped on the floor.

use crate::log::resolver_log;
use crate::rib::RibClient;
use crate::types::{Afi, PeerId};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub u64);

impl Display for QueryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NexthopAnswer {
    pub resolves: bool,
    pub metric: u32,
}

impl NexthopAnswer {
    pub const UNRESOLVED: NexthopAnswer = NexthopAnswer {
        resolves: false,
        metric: 0,
    };

    pub fn resolved(metric: u32) -> Self {
        Self {
            resolves: true,
            metric,
        }
    }
}

struct NexthopEntry<A: Afi> {
    answer: Option<NexthopAnswer>,
    query: Option<QueryId>,
    interest: BTreeMap<PeerId, BTreeMap<A::Prefix, usize>>,
    waiting: BTreeSet<PeerId>,
}

impl<A: Afi> NexthopEntry<A> {
    fn new() -> Self {
        Self {
            answer: None,
            query: None,
            interest: BTreeMap::new(),
            waiting: BTreeSet::new(),
        }
    }

    fn refcount(&self) -> usize {
        self.interest.values().flat_map(|nets| nets.values()).sum()
    }
}

/// Outcome of feeding an answer into the resolver.
#[derive(Debug, PartialEq, Eq)]
pub struct ResolverEvents<A: Afi> {
    /// Subscribers that were waiting on a first answer for the next-hop.
    pub ready: Vec<(PeerId, A)>,

    /// Next-hops whose answer differs from the previously cached one.
    pub changed: Vec<A>,
}

impl<A: Afi> Default for ResolverEvents<A> {
    fn default() -> Self {
        Self {
            ready: Vec::new(),
            changed: Vec::new(),
        }
    }
}

impl<A: Afi> ResolverEvents<A> {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.changed.is_empty()
    }
}

pub struct NextHopResolver<A: Afi> {
    entries: BTreeMap<A, NexthopEntry<A>>,
    queries: BTreeMap<QueryId, A>,
    next_query: u64,
    log: Logger,
}

impl<A: Afi> NextHopResolver<A> {
    pub fn new(log: Logger) -> Self {
        Self {
            entries: BTreeMap::new(),
            queries: BTreeMap::new(),
            next_query: 1,
            log,
        }
    }

    /// Register interest of `subscriber` in `nexthop` on behalf of `net`.
    /// Returns the cached answer when there is one. Otherwise the subscriber
    /// is queued to hear about the answer once it arrives.
    pub fn register_nexthop(
        &mut self,
        nexthop: A,
        net: A::Prefix,
        subscriber: PeerId,
        rib: &mut dyn RibClient<A>,
    ) -> Option<NexthopAnswer> {
        let entry = self.entries.entry(nexthop).or_insert_with(NexthopEntry::new);
        *entry
            .interest
            .entry(subscriber)
            .or_default()
            .entry(net)
            .or_default() += 1;

        if let Some(answer) = entry.answer {
            return Some(answer);
        }

        entry.waiting.insert(subscriber);
        if entry.query.is_none() {
            let query = QueryId(self.next_query);
            self.next_query += 1;
            entry.query = Some(query);
            self.queries.insert(query, nexthop);
            resolver_log!(self.log, debug, "query {} for {}", query, nexthop;
                "afi" => A::NAME
            );
            rib.register_interest(query, nexthop);
        }
        None
    }

    pub fn deregister_nexthop(
        &mut self,
        nexthop: A,
        net: A::Prefix,
        subscriber: PeerId,
        rib: &mut dyn RibClient<A>,
    ) {
        let Some(entry) = self.entries.get_mut(&nexthop) else {
            resolver_log!(self.log, warn,
                "deregister of unknown nexthop {} for {}", nexthop, net;
                "afi" => A::NAME
            );
            return;
        };

        if let Some(nets) = entry.interest.get_mut(&subscriber) {
            if let Some(count) = nets.get_mut(&net) {
                *count -= 1;
                if *count == 0 {
                    nets.remove(&net);
                }
            }
            if nets.is_empty() {
                entry.interest.remove(&subscriber);
                entry.waiting.remove(&subscriber);
            }
        }

        if entry.refcount() > 0 {
            return;
        }

        if let Some(query) = entry.query.take() {
            self.queries.remove(&query);
            resolver_log!(self.log, debug, "cancel {} for {}", query, nexthop;
                "afi" => A::NAME
            );
            rib.deregister_interest(query, nexthop);
        }
        self.entries.remove(&nexthop);
    }

    /// The cached answer for `nexthop`, if any.
    pub fn lookup(&self, nexthop: A) -> Option<NexthopAnswer> {
        self.entries.get(&nexthop).and_then(|e| e.answer)
    }

    /// Deliver the RIB's answer to an outstanding query.
    pub fn answer(
        &mut self,
        query: QueryId,
        answer: NexthopAnswer,
    ) -> ResolverEvents<A> {
        let mut events = ResolverEvents::default();

        let Some(nexthop) = self.queries.remove(&query) else {
            resolver_log!(self.log, debug, "answer for cancelled {}", query;
                "afi" => A::NAME
            );
            return events;
        };
        let Some(entry) = self.entries.get_mut(&nexthop) else {
            return events;
        };
        if entry.query != Some(query) {
            return events;
        }
        entry.query = None;

        let previous = entry.answer.replace(answer);
        resolver_log!(self.log, debug, "{} answered {:?}", nexthop, answer;
            "afi" => A::NAME,
            "previous" => format!("{previous:?}")
        );

        for subscriber in std::mem::take(&mut entry.waiting) {
            events.ready.push((subscriber, nexthop));
        }
        if previous.is_some_and(|p| p != answer) {
            events.changed.push(nexthop);
        }
        events
    }

    /// The RIB says previously reported information covering `prefix` is no
    /// longer valid. Every cached answer inside the prefix is queried again,
    /// once. Returns the number of queries issued.
    pub fn route_info_invalid(
        &mut self,
        prefix: A::Prefix,
        rib: &mut dyn RibClient<A>,
    ) -> usize {
        let mut issued = 0;
        for (nexthop, entry) in self.entries.iter_mut() {
            if !A::prefix_contains(&prefix, *nexthop) {
                continue;
            }
            if entry.answer.is_none() || entry.query.is_some() {
                continue;
            }
            let query = QueryId(self.next_query);
            self.next_query += 1;
            entry.query = Some(query);
            self.queries.insert(query, *nexthop);
            rib.register_interest(query, *nexthop);
            issued += 1;
        }
        if issued > 0 {
            resolver_log!(self.log, debug,
                "{} invalidated, {} requeries", prefix, issued;
                "afi" => A::NAME
            );
        }
        issued
    }

    /// The IGP distance to destinations within `prefix` changed. Returns the
    /// resolved next-hops whose metric moved.
    pub fn route_info_changed(
        &mut self,
        prefix: A::Prefix,
        metric: u32,
    ) -> Vec<A> {
        let mut changed = Vec::new();
        for (nexthop, entry) in self.entries.iter_mut() {
            if !A::prefix_contains(&prefix, *nexthop) {
                continue;
            }
            match entry.answer {
                Some(ref mut a) if a.resolves && a.metric != metric => {
                    a.metric = metric;
                    changed.push(*nexthop);
                }
                _ => {}
            }
        }
        changed
    }

    pub fn interest(&self, nexthop: A) -> usize {
        self.entries.get(&nexthop).map(|e| e.refcount()).unwrap_or(0)
    }

    pub fn outstanding(&self) -> impl Iterator<Item = (&QueryId, &A)> {
        self.queries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
