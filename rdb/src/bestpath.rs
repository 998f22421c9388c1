// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::types::{Afi, InternalMessage, PeerId, PeerInfo};
use itertools::Itertools;

/// The bestpath algorithm chooses the single best route for a prefix from
/// the candidates offered by each peer branch. It narrows the candidate set
/// with the following ordered sequence of filters.
///
/// - drop candidates whose next-hop does not resolve
/// - keep the candidates with the largest local preference, a missing
///   local preference counting as zero
/// - keep the candidates with the smallest AS path length
/// - keep the candidates with the lowest origin
/// - group the candidates by the first AS in their path and keep, within
///   each group, the ones with the smallest multi-exit discriminator (MED).
///   MEDs of routes from different neighboring ASes are never compared. A
///   missing MED counts as zero.
/// - prefer EBGP learned candidates over IBGP learned ones
/// - keep the candidates with the smallest IGP distance to the next-hop
/// - keep the candidates with the smallest advertising BGP identifier
///
/// If more than one candidate remains, the current winner is kept when it is
/// among them. Otherwise the candidate from the lowest peer id is chosen.
/// Each filter works on sets, so the outcome does not depend on the order in
/// which candidates are presented.
pub fn select_best<'a, A: Afi>(
    candidates: impl IntoIterator<Item = &'a InternalMessage<A>>,
    current: Option<PeerId>,
    peers: &BTreeMap<PeerId, PeerInfo<A>>,
) -> Option<PeerId> {
    let ibgp = |m: &InternalMessage<A>| {
        peers.get(&m.origin).map(|p| p.ibgp).unwrap_or(false)
    };
    let bgp_id = |m: &InternalMessage<A>| {
        peers
            .get(&m.origin)
            .map(|p| p.bgp_id)
            .unwrap_or(Ipv4Addr::BROADCAST)
    };

    let candidates: Vec<&InternalMessage<A>> = candidates
        .into_iter()
        .filter(|m| m.route.nexthop_resolved)
        .collect();

    if candidates.len() <= 1 {
        return candidates.first().map(|m| m.origin);
    }

    // Filter down to paths with the highest local preference
    let candidates = candidates
        .into_iter()
        .max_set_by_key(|m| m.attributes().local_pref.unwrap_or(0));

    // Filter down to paths with the shortest AS-Path length
    let candidates = candidates
        .into_iter()
        .min_set_by_key(|m| m.attributes().as_path.path_length());

    let candidates = candidates
        .into_iter()
        .min_set_by_key(|m| m.attributes().origin);

    // Group candidates by neighboring AS for MED selection. Locally
    // originated routes have an empty path and share the `None` group.
    let as_groups = candidates
        .into_iter()
        .into_group_map_by(|m| m.attributes().as_path.first_asn());

    // Filter AS groups to paths with lowest MED. A missing MED is taken as
    // zero, so it ties with an explicit zero rather than beating it.
    let candidates: Vec<&InternalMessage<A>> = as_groups
        .into_values()
        .flat_map(|group| {
            group
                .into_iter()
                .min_set_by_key(|m| m.attributes().med.unwrap_or(0))
        })
        .collect();

    let candidates = candidates.into_iter().min_set_by_key(|m| ibgp(*m));

    let candidates = candidates
        .into_iter()
        .min_set_by_key(|m| m.route.igp_metric);

    let candidates = candidates.into_iter().min_set_by_key(|m| bgp_id(*m));

    if let Some(current) = current {
        if candidates.iter().any(|m| m.origin == current) {
            return Some(current);
        }
    }
    candidates.iter().map(|m| m.origin).min()
}
