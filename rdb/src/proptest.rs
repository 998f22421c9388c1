// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for prefixes and the decision process.

use crate::bestpath::select_best;
use crate::types::{
    Afi, AsPath, InternalMessage, Origin, PathAttributeList, PeerId, PeerInfo,
    Prefix4, Prefix6, SubnetRoute,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

// Strategy for generating valid IPv4 prefixes
fn ipv4_prefix_strategy() -> impl Strategy<Value = Prefix4> {
    (any::<u32>(), 0u8..=32u8).prop_map(|(addr_bits, length)| {
        Prefix4::new(Ipv4Addr::from(addr_bits), length)
    })
}

// Strategy for generating valid IPv6 prefixes
fn ipv6_prefix_strategy() -> impl Strategy<Value = Prefix6> {
    (any::<u128>(), 0u8..=128u8).prop_map(|(addr_bits, length)| {
        Prefix6::new(Ipv6Addr::from(addr_bits), length)
    })
}

#[derive(Debug, Clone)]
struct Candidate {
    peer: u32,
    local_pref: Option<u32>,
    first_as: u32,
    path_len: usize,
    origin: Origin,
    med: Option<u32>,
    ibgp: bool,
    metric: u32,
    resolved: bool,
    id: u8,
}

fn origin_strategy() -> impl Strategy<Value = Origin> {
    prop_oneof![Just(Origin::Igp), Just(Origin::Egp), Just(Origin::Incomplete)]
}

// Small value ranges so that ties on every criterion are common.
fn candidate_strategy(peer: u32) -> impl Strategy<Value = Candidate> {
    (
        proptest::option::of(100u32..=102),
        64501u32..=64503,
        1usize..=3,
        origin_strategy(),
        proptest::option::of(0u32..=2),
        any::<bool>(),
        0u32..=2,
        prop::bool::weighted(0.9),
        0u8..=2,
    )
        .prop_map(
            move |(
                local_pref,
                first_as,
                path_len,
                origin,
                med,
                ibgp,
                metric,
                resolved,
                id,
            )| Candidate {
                peer,
                local_pref,
                first_as,
                path_len,
                origin,
                med,
                ibgp,
                metric,
                resolved,
                id,
            },
        )
}

fn candidates_strategy() -> impl Strategy<Value = Vec<Candidate>> {
    (1usize..=8).prop_flat_map(|n| {
        (1..=n as u32)
            .map(candidate_strategy)
            .collect::<Vec<_>>()
    })
}

fn build(
    cands: &[Candidate],
) -> (Vec<InternalMessage<Ipv4Addr>>, BTreeMap<PeerId, PeerInfo<Ipv4Addr>>) {
    let net = Prefix4::new(Ipv4Addr::new(198, 51, 100, 0), 24);
    let mut msgs = Vec::new();
    let mut peers = BTreeMap::new();
    for c in cands {
        let mut path = vec![c.first_as];
        path.extend(std::iter::repeat(64999).take(c.path_len - 1));
        let mut attrs = PathAttributeList::new(
            Ipv4Addr::new(192, 0, 2, 1),
            c.origin,
            AsPath::sequence(&path),
        );
        attrs.local_pref = c.local_pref;
        attrs.med = c.med;
        let mut route = SubnetRoute::new(net, Arc::new(attrs));
        route.nexthop_resolved = c.resolved;
        route.igp_metric = c.metric;
        msgs.push(InternalMessage::new(route, PeerId(c.peer), 1));
        peers.insert(
            PeerId(c.peer),
            PeerInfo {
                asn: c.first_as,
                bgp_id: Ipv4Addr::new(10, 0, 0, c.id),
                ibgp: c.ibgp,
                local_addr: None,
            },
        );
    }
    (msgs, peers)
}

proptest! {
    /// Property: IPv4 host bits are always unset after construction
    #[test]
    fn prop_ipv4_host_bits_always_unset(prefix in ipv4_prefix_strategy()) {
        prop_assert!(
            prefix.host_bits_are_unset(),
            "IPv4 prefix {prefix} should have host bits unset"
        );
    }

    /// Property: IPv6 host bits are always unset after construction
    #[test]
    fn prop_ipv6_host_bits_always_unset(prefix in ipv6_prefix_strategy()) {
        prop_assert!(
            prefix.host_bits_are_unset(),
            "IPv6 prefix {prefix} should have host bits unset"
        );
    }

    /// Property: a prefix contains its own network address
    #[test]
    fn prop_prefix_contains_network(prefix in ipv4_prefix_strategy()) {
        prop_assert!(<Ipv4Addr as Afi>::prefix_contains(&prefix, prefix.value));
    }

    /// Property: the string form parses back to the same prefix
    #[test]
    fn prop_ipv6_display_parses(prefix in ipv6_prefix_strategy()) {
        let parsed: Prefix6 = prefix.to_string().parse().unwrap();
        prop_assert_eq!(parsed, prefix);
    }

    /// Property: the decision winner does not depend on the order in which
    /// candidates are presented
    #[test]
    fn prop_decision_order_independent(
        (cands, shuffled) in candidates_strategy()
            .prop_flat_map(|c| (Just(c.clone()), Just(c).prop_shuffle())),
        current in proptest::option::of(1u32..=8),
    ) {
        let (a, peers) = build(&cands);
        let (b, _) = build(&shuffled);
        let current = current.map(PeerId);
        prop_assert_eq!(
            select_best(&a, current, &peers),
            select_best(&b, current, &peers)
        );
    }

    /// Property: MEDs of routes from different neighboring ASes never decide
    /// between them
    #[test]
    fn prop_med_isolated_across_neighbors(
        med1 in any::<u32>(),
        med2 in any::<u32>(),
    ) {
        let mut a = Candidate {
            peer: 1,
            local_pref: Some(100),
            first_as: 64501,
            path_len: 2,
            origin: Origin::Igp,
            med: Some(med1),
            ibgp: false,
            metric: 1,
            resolved: true,
            id: 2,
        };
        let mut b = a.clone();
        b.peer = 2;
        b.first_as = 64502;
        b.med = Some(med2);
        b.id = 1;

        // identifier decides, MED does not
        let (msgs, peers) = build(&[a.clone(), b.clone()]);
        prop_assert_eq!(select_best(&msgs, None, &peers), Some(PeerId(2)));

        // same neighbor, now the MED decides
        a.first_as = 64502;
        let (msgs, peers) = build(&[a, b]);
        let expected = if med1 < med2 { PeerId(1) } else { PeerId(2) };
        prop_assert_eq!(select_best(&msgs, None, &peers), Some(expected));
    }
}
