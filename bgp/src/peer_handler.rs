// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation between UPDATE messages and pipeline operations for one
//! peering. Received updates become adds and deletes on the peer's RibIn
//! branches, and whatever the pipeline queues in the peer's RibOut becomes
//! outgoing updates.

use crate::error::Error;
use crate::messages::{
    as_path_segments, path_attribute_flags, Aggregator, AsPathSegment,
    AsPathType, AsPathWidth, CeaseErrorSubcode, MpReachNlri, MpUnreachNlri,
    NotificationMessage, PathAttribute, PathAttributeTypeCode,
    PathAttributeValue, Prefix, UpdateMessage, AFI_IPV4, AFI_IPV6, AS_TRANS,
    SAFI_UNICAST,
};
use rdb::ribout::RibOutUpdate;
use rdb::types::{AsPath, AsSegment, Origin, PathAttributeList, SubnetRoute};
use rdb::{Afi, BgpPlumbing, PeerId, Plumbing, Prefix4, Prefix6};
use slog::{debug, warn, Logger};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Prefixes packed into one UPDATE before it is split further to fit.
pub const UPDATE_CHUNK: usize = 500;

/// What was agreed on with the peer when the session opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub asn: u32,
    pub bgp_id: Ipv4Addr,
    pub ibgp: bool,
    pub hold_time: u16,
    pub width: AsPathWidth,
    pub ipv4: bool,
    pub ipv6: bool,
}

/// The pipeline side of one peering.
pub struct PeerHandler {
    pub peer: PeerId,
    pub prefix_limit: Option<usize>,
    log: Logger,
}

/// Attributes shared by every route of an update, before a next-hop of a
/// particular family is attached.
struct ReceivedAttributes {
    origin: Origin,
    as_path: AsPath,
    med: Option<u32>,
    local_pref: Option<u32>,
    atomic_aggregate: bool,
    aggregator: Option<(u32, Ipv4Addr)>,
    communities: Vec<u32>,
    unknown: Vec<rdb::types::UnknownAttribute>,
}

impl ReceivedAttributes {
    fn from_update(update: &UpdateMessage, width: AsPathWidth) -> Self {
        let mut r = Self {
            origin: Origin::Incomplete,
            as_path: AsPath::default(),
            med: None,
            local_pref: None,
            atomic_aggregate: false,
            aggregator: None,
            communities: Vec::new(),
            unknown: Vec::new(),
        };
        let mut as_path = Vec::new();
        let mut as4_path = None;
        let mut aggregator = None;
        let mut as4_aggregator = None;

        for a in &update.path_attributes {
            match &a.value {
                PathAttributeValue::Origin(o) => r.origin = (*o).into(),
                PathAttributeValue::AsPath(segs) => as_path = segs.clone(),
                PathAttributeValue::As4Path(segs) => as4_path = Some(segs),
                PathAttributeValue::MultiExitDisc(v) => r.med = Some(*v),
                PathAttributeValue::LocalPref(v) => r.local_pref = Some(*v),
                PathAttributeValue::AtomicAggregate => {
                    r.atomic_aggregate = true
                }
                PathAttributeValue::Aggregator(agg) => aggregator = Some(*agg),
                PathAttributeValue::As4Aggregator(agg) => {
                    as4_aggregator = Some(*agg)
                }
                PathAttributeValue::Communities(c) => {
                    r.communities = c.clone()
                }
                PathAttributeValue::Unknown {
                    flags,
                    type_code,
                    value,
                } => {
                    // Unrecognized non-transitive attributes are quietly
                    // dropped, transitive ones travel on.
                    if flags & path_attribute_flags::TRANSITIVE != 0 {
                        r.unknown.push(rdb::types::UnknownAttribute {
                            flags: *flags,
                            type_code: *type_code,
                            value: value.clone(),
                        });
                    }
                }
                PathAttributeValue::NextHop(_)
                | PathAttributeValue::MpReachNlri(_)
                | PathAttributeValue::MpUnreachNlri(_) => {}
            }
        }

        // AS4_PATH and AS4_AGGREGATOR only mean something on a session
        // that could not carry four-octet numbers itself.
        if width == AsPathWidth::Two {
            if let Some(as4) = as4_path {
                as_path = merge_as4_path(&as_path, as4);
            }
            if let (Some(agg), Some(agg4)) = (aggregator, as4_aggregator) {
                if agg.asn == u32::from(AS_TRANS) {
                    aggregator = Some(agg4);
                }
            }
        }

        r.as_path = AsPath {
            segments: as_path.iter().map(AsSegment::from).collect(),
        };
        r.aggregator = aggregator.map(|a| (a.asn, a.address));
        r
    }

    fn with_nexthop<A: Afi>(&self, nexthop: A) -> PathAttributeList<A> {
        PathAttributeList {
            nexthop,
            origin: self.origin,
            as_path: self.as_path.clone(),
            med: self.med,
            local_pref: self.local_pref,
            atomic_aggregate: self.atomic_aggregate,
            aggregator: self.aggregator,
            communities: self.communities.clone(),
            unknown: self.unknown.clone(),
        }
    }
}

fn segment_length(s: &AsPathSegment) -> usize {
    match s.typ {
        AsPathType::AsSequence => s.value.len(),
        AsPathType::AsSet => 1,
    }
}

/// Reconstruct the full path of a route received over a two-octet session.
/// The leading numbers of AS_PATH that AS4_PATH does not cover were added by
/// two-octet speakers and are kept, the rest is taken from AS4_PATH.
///
/// Ref: RFC 6793 §4.2.3
pub fn merge_as4_path(
    as_path: &[AsPathSegment],
    as4_path: &[AsPathSegment],
) -> Vec<AsPathSegment> {
    let len: usize = as_path.iter().map(segment_length).sum();
    let len4: usize = as4_path.iter().map(segment_length).sum();
    if len4 > len {
        return as_path.to_vec();
    }
    let mut keep = len - len4;
    let mut merged = Vec::new();
    for s in as_path {
        if keep == 0 {
            break;
        }
        match s.typ {
            AsPathType::AsSequence => {
                let n = keep.min(s.value.len());
                merged.push(AsPathSegment::sequence(s.value[..n].to_vec()));
                keep -= n;
            }
            AsPathType::AsSet => {
                merged.push(s.clone());
                keep -= 1;
            }
        }
    }
    merged.extend_from_slice(as4_path);
    merged
}

impl PeerHandler {
    pub fn new(peer: PeerId, prefix_limit: Option<usize>, log: Logger) -> Self {
        Self {
            peer,
            prefix_limit,
            log,
        }
    }

    /// Feed a validated UPDATE into the pipeline. Returns the notification
    /// to send if the peer has exceeded its prefix limit.
    pub fn process_update(
        &mut self,
        update: &UpdateMessage,
        session: &Negotiated,
        plumbing: &mut BgpPlumbing,
    ) -> Result<Option<NotificationMessage>, Error> {
        let peer = self.peer;

        for p in &update.withdrawn {
            plumbing.ipv4.delete_route(peer, Prefix4::from(p))?;
        }
        if let Some(mp) = update.mp_unreach() {
            for p in &mp.withdrawn {
                match mp.afi {
                    AFI_IPV4 => plumbing.ipv4.delete_route(peer, p.into())?,
                    AFI_IPV6 => plumbing.ipv6.delete_route(peer, p.into())?,
                    _ => {}
                }
            }
        }

        if update.announces() {
            let attrs = ReceivedAttributes::from_update(update, session.width);

            if !update.nlri.is_empty() {
                match update.nexthop4() {
                    Some(nh) => add_routes(
                        &mut plumbing.ipv4,
                        peer,
                        attrs.with_nexthop(nh),
                        &update.nlri,
                    )?,
                    None => warn!(self.log, "nlri without next-hop dropped"),
                }
            }

            if let Some(mp) = update.mp_reach() {
                match mp.nexthop {
                    IpAddr::V4(nh) if mp.afi == AFI_IPV4 => add_routes(
                        &mut plumbing.ipv4,
                        peer,
                        attrs.with_nexthop(nh),
                        &mp.nlri,
                    )?,
                    IpAddr::V6(nh) if mp.afi == AFI_IPV6 => add_routes(
                        &mut plumbing.ipv6,
                        peer,
                        attrs.with_nexthop(nh),
                        &mp.nlri,
                    )?,
                    nh => warn!(self.log,
                        "mp_reach afi {} with next-hop {nh} dropped", mp.afi
                    ),
                }
            }
        }

        plumbing.ipv4.push(peer)?;
        plumbing.ipv6.push(peer)?;

        if let Some(limit) = self.prefix_limit {
            let count = plumbing.route_count(peer);
            if count > limit {
                warn!(self.log, "prefix limit {limit} exceeded with {count}");
                return Ok(Some(NotificationMessage::cease(
                    CeaseErrorSubcode::MaximumNumberofPrefixesReached,
                )));
            }
        }
        Ok(None)
    }

    /// Everything queued for this peer, packed into UPDATE messages. Routes
    /// of a family the peer did not negotiate are discarded.
    pub fn updates_to_send(
        &mut self,
        session: &Negotiated,
        plumbing: &mut BgpPlumbing,
    ) -> Vec<UpdateMessage> {
        let mut out = Vec::new();
        let v4 = plumbing.ipv4.take_updates(self.peer);
        let v6 = plumbing.ipv6.take_updates(self.peer);
        if session.ipv4 {
            for u in &v4 {
                out.extend(ipv4_updates(u, session.width));
            }
        }
        if session.ipv6 {
            for u in &v6 {
                out.extend(ipv6_updates(u, session.width));
            }
        }
        if !out.is_empty() {
            debug!(self.log, "{} updates for {}", out.len(), self.peer);
        }
        out
    }
}

fn add_routes<A: Afi>(
    plumbing: &mut Plumbing<A>,
    peer: PeerId,
    attrs: PathAttributeList<A>,
    nlri: &[Prefix],
) -> Result<(), Error>
where
    A::Prefix: for<'a> From<&'a Prefix>,
{
    let attrs = plumbing.intern(attrs);
    for p in nlri {
        plumbing.add_route(peer, SubnetRoute::new(p.into(), attrs.clone()))?;
    }
    Ok(())
}

/// The attributes of an outgoing route, without any next-hop.
fn wire_attributes<A: Afi>(
    attrs: &PathAttributeList<A>,
    width: AsPathWidth,
) -> Vec<PathAttribute> {
    let mut out: Vec<PathAttribute> = vec![
        PathAttributeValue::Origin(attrs.origin.into()).into(),
        PathAttributeValue::AsPath(as_path_segments(&attrs.as_path)).into(),
    ];
    let wide = |asn: &u32| *asn > u32::from(u16::MAX);
    if width == AsPathWidth::Two
        && attrs.as_path.segments.iter().any(|s| s.asns().iter().any(wide))
    {
        out.push(
            PathAttributeValue::As4Path(as_path_segments(&attrs.as_path)).into(),
        );
    }
    if let Some(med) = attrs.med {
        out.push(PathAttributeValue::MultiExitDisc(med).into());
    }
    if let Some(lp) = attrs.local_pref {
        out.push(PathAttributeValue::LocalPref(lp).into());
    }
    if attrs.atomic_aggregate {
        out.push(PathAttributeValue::AtomicAggregate.into());
    }
    if let Some((asn, address)) = attrs.aggregator {
        out.push(
            PathAttributeValue::Aggregator(Aggregator { asn, address }).into(),
        );
        if width == AsPathWidth::Two && wide(&asn) {
            out.push(
                PathAttributeValue::As4Aggregator(Aggregator { asn, address })
                    .into(),
            );
        }
    }
    if !attrs.communities.is_empty() {
        out.push(PathAttributeValue::Communities(attrs.communities.clone()).into());
    }
    for u in &attrs.unknown {
        out.push(
            PathAttributeValue::Unknown {
                flags: u.flags | path_attribute_flags::PARTIAL,
                type_code: u.type_code,
                value: u.value.clone(),
            }
            .into(),
        );
    }
    out
}

fn sorted(mut attrs: Vec<PathAttribute>) -> Vec<PathAttribute> {
    attrs.sort_by_key(|a| u8::from(a.typ.type_code));
    attrs
}

/// Build updates for `prefixes`, splitting until every message fits.
fn pack<F>(prefixes: &[Prefix], width: AsPathWidth, make: &F) -> Vec<UpdateMessage>
where
    F: Fn(&[Prefix]) -> UpdateMessage,
{
    let mut out = Vec::new();
    for chunk in prefixes.chunks(UPDATE_CHUNK) {
        let m = make(chunk);
        match m.to_wire(width) {
            Err(Error::TooLarge(_)) if chunk.len() > 1 => {
                let (a, b) = chunk.split_at(chunk.len() / 2);
                out.extend(pack(a, width, make));
                out.extend(pack(b, width, make));
            }
            _ => out.push(m),
        }
    }
    out
}

fn ipv4_updates(
    u: &RibOutUpdate<Ipv4Addr>,
    width: AsPathWidth,
) -> Vec<UpdateMessage> {
    let mut out = Vec::new();
    let withdrawn: Vec<Prefix> =
        u.withdrawn.iter().copied().map(Prefix::from).collect();
    out.extend(pack(&withdrawn, width, &|chunk: &[Prefix]| UpdateMessage {
        withdrawn: chunk.to_vec(),
        ..Default::default()
    }));

    for (attrs, nets) in &u.announce {
        let mut base = wire_attributes(attrs.as_ref(), width);
        base.push(PathAttributeValue::NextHop(attrs.nexthop).into());
        let base = sorted(base);
        let nlri: Vec<Prefix> = nets.iter().copied().map(Prefix::from).collect();
        out.extend(pack(&nlri, width, &|chunk: &[Prefix]| UpdateMessage {
            path_attributes: base.clone(),
            nlri: chunk.to_vec(),
            ..Default::default()
        }));
    }
    out
}

fn ipv6_updates(
    u: &RibOutUpdate<Ipv6Addr>,
    width: AsPathWidth,
) -> Vec<UpdateMessage> {
    let mut out = Vec::new();
    let withdrawn: Vec<Prefix> =
        u.withdrawn.iter().copied().map(Prefix::from).collect();
    out.extend(pack(&withdrawn, width, &|chunk: &[Prefix]| UpdateMessage {
        path_attributes: vec![PathAttributeValue::MpUnreachNlri(
            MpUnreachNlri {
                afi: AFI_IPV6,
                safi: SAFI_UNICAST,
                withdrawn: chunk.to_vec(),
            },
        )
        .into()],
        ..Default::default()
    }));

    for (attrs, nets) in &u.announce {
        let base = wire_attributes(attrs.as_ref(), width);
        let nexthop = IpAddr::V6(attrs.nexthop);
        let nlri: Vec<Prefix> = nets.iter().copied().map(Prefix::from).collect();
        out.extend(pack(&nlri, width, &|chunk: &[Prefix]| {
            let mut attrs = base.clone();
            attrs.push(
                PathAttributeValue::MpReachNlri(MpReachNlri {
                    afi: AFI_IPV6,
                    safi: SAFI_UNICAST,
                    nexthop,
                    link_local: None,
                    nlri: chunk.to_vec(),
                })
                .into(),
            );
            UpdateMessage {
                path_attributes: sorted(attrs),
                ..Default::default()
            }
        }));
    }
    out
}
