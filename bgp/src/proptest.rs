// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for the BGP wire format.
//!
//! These check that anything we build survives encoding and decoding, that
//! the two-octet AS encoding degrades to AS_TRANS and nothing else, and that
//! arbitrary input never panics the decoder.

use crate::messages::{
    path_attribute_flags, AsPathSegment, AsPathType, AsPathWidth, Capability,
    Message, MpReachNlri, MpUnreachNlri, OpenMessage, PathAttribute,
    PathAttributeValue, PathOrigin, Prefix, UpdateMessage, AFI_IPV6, AS_TRANS,
    SAFI_UNICAST,
};
use proptest::prelude::*;
use rdb::types::{Prefix4, Prefix6};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// =============================================================================
// Strategies
// =============================================================================

fn ipv4_prefix_strategy() -> impl Strategy<Value = Prefix4> {
    (any::<u32>(), 0u8..=32u8)
        .prop_map(|(bits, length)| Prefix4::new(Ipv4Addr::from(bits), length))
}

fn ipv6_prefix_strategy() -> impl Strategy<Value = Prefix6> {
    (any::<u128>(), 0u8..=128u8)
        .prop_map(|(bits, length)| Prefix6::new(Ipv6Addr::from(bits), length))
}

fn origin_strategy() -> impl Strategy<Value = PathOrigin> {
    prop_oneof![
        Just(PathOrigin::Igp),
        Just(PathOrigin::Egp),
        Just(PathOrigin::Incomplete),
    ]
}

/// AS path segments small enough that the attribute never needs the
/// extended length encoding.
fn segments_strategy(
    asn: impl Strategy<Value = u32> + Clone,
) -> impl Strategy<Value = Vec<AsPathSegment>> {
    prop::collection::vec(
        (
            prop_oneof![Just(AsPathType::AsSequence), Just(AsPathType::AsSet)],
            prop::collection::vec(asn, 1..=12),
        )
            .prop_map(|(typ, value)| AsPathSegment { typ, value }),
        0..=3,
    )
}

/// An optional transitive attribute nobody here understands.
fn unknown_strategy() -> impl Strategy<Value = PathAttributeValue> {
    (200u8..=250, prop::collection::vec(any::<u8>(), 0..=32)).prop_map(
        |(type_code, value)| PathAttributeValue::Unknown {
            flags: path_attribute_flags::OPTIONAL
                | path_attribute_flags::TRANSITIVE,
            type_code,
            value,
        },
    )
}

fn ipv4_update_strategy() -> impl Strategy<Value = UpdateMessage> {
    (
        prop::collection::vec(ipv4_prefix_strategy(), 0..8),
        origin_strategy(),
        segments_strategy(any::<u32>()),
        any::<u32>(),
        proptest::option::of(any::<u32>()),
        proptest::option::of(any::<u32>()),
        prop::collection::vec(any::<u32>(), 0..=8),
        proptest::option::of(unknown_strategy()),
        prop::collection::vec(ipv4_prefix_strategy(), 1..8),
    )
        .prop_map(
            |(
                withdrawn,
                origin,
                path,
                nexthop,
                med,
                local_pref,
                communities,
                unknown,
                nlri,
            )| {
                let mut attrs = vec![
                    PathAttributeValue::Origin(origin),
                    PathAttributeValue::AsPath(path),
                    PathAttributeValue::NextHop(Ipv4Addr::from(nexthop)),
                ];
                if let Some(med) = med {
                    attrs.push(PathAttributeValue::MultiExitDisc(med));
                }
                if let Some(lp) = local_pref {
                    attrs.push(PathAttributeValue::LocalPref(lp));
                }
                if !communities.is_empty() {
                    attrs.push(PathAttributeValue::Communities(communities));
                }
                attrs.extend(unknown);
                UpdateMessage {
                    withdrawn: withdrawn.into_iter().map(Prefix::from).collect(),
                    path_attributes: attrs
                        .into_iter()
                        .map(PathAttribute::from)
                        .collect(),
                    nlri: nlri.into_iter().map(Prefix::from).collect(),
                }
            },
        )
}

fn ipv6_update_strategy() -> impl Strategy<Value = UpdateMessage> {
    (
        any::<u128>(),
        proptest::option::of(any::<u128>()),
        prop::collection::vec(ipv6_prefix_strategy(), 1..6),
        prop::collection::vec(ipv6_prefix_strategy(), 0..6),
    )
        .prop_map(|(nexthop, link_local, nlri, withdrawn)| {
            let mut attrs = vec![
                PathAttributeValue::Origin(PathOrigin::Igp),
                PathAttributeValue::AsPath(vec![AsPathSegment::sequence(
                    vec![65001],
                )]),
                PathAttributeValue::MpReachNlri(MpReachNlri {
                    afi: AFI_IPV6,
                    safi: SAFI_UNICAST,
                    nexthop: IpAddr::V6(Ipv6Addr::from(nexthop)),
                    link_local: link_local.map(Ipv6Addr::from),
                    nlri: nlri.into_iter().map(Prefix::from).collect(),
                }),
            ];
            if !withdrawn.is_empty() {
                attrs.push(PathAttributeValue::MpUnreachNlri(MpUnreachNlri {
                    afi: AFI_IPV6,
                    safi: SAFI_UNICAST,
                    withdrawn: withdrawn.into_iter().map(Prefix::from).collect(),
                }));
            }
            UpdateMessage {
                withdrawn: Vec::new(),
                path_attributes: attrs
                    .into_iter()
                    .map(PathAttribute::from)
                    .collect(),
                nlri: Vec::new(),
            }
        })
}

fn round_trip(m: &Message, width: AsPathWidth) -> Message {
    let frame = m.to_frame(width).expect("encode");
    Message::from_frame(&frame, width).expect("decode")
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    /// Wire prefixes carry just enough octets and convert back to the same
    /// prefix.
    #[test]
    fn prop_prefix_conversion(p4 in ipv4_prefix_strategy(), p6 in ipv6_prefix_strategy()) {
        let w4 = Prefix::from(p4);
        prop_assert_eq!(w4.value.len(), usize::from(p4.length).div_ceil(8));
        prop_assert_eq!(Prefix4::from(&w4), p4);

        let w6 = Prefix::from(p6);
        prop_assert_eq!(w6.value.len(), usize::from(p6.length).div_ceil(8));
        prop_assert_eq!(Prefix6::from(&w6), p6);
    }

    /// IPv4 updates with four-octet paths decode to what was encoded.
    #[test]
    fn prop_ipv4_update_round_trip(update in ipv4_update_strategy()) {
        let m = Message::Update(update);
        prop_assert_eq!(round_trip(&m, AsPathWidth::Four), m);
    }

    /// MP_REACH and MP_UNREACH survive encoding, link-local next-hop
    /// included.
    #[test]
    fn prop_ipv6_update_round_trip(update in ipv6_update_strategy()) {
        let m = Message::Update(update);
        let back = round_trip(&m, AsPathWidth::Four);
        prop_assert_eq!(&back, &m);
        if let Message::Update(u) = back {
            prop_assert!(u.announces());
        }
    }

    /// With two-octet paths, ASNs that fit come back unchanged and the rest
    /// come back as AS_TRANS.
    #[test]
    fn prop_two_octet_paths(path in segments_strategy(any::<u32>())) {
        let update = UpdateMessage {
            withdrawn: Vec::new(),
            path_attributes: vec![
                PathAttributeValue::Origin(PathOrigin::Igp).into(),
                PathAttributeValue::AsPath(path.clone()).into(),
                PathAttributeValue::NextHop(Ipv4Addr::new(192, 0, 2, 1)).into(),
            ],
            nlri: vec![Prefix4::new(Ipv4Addr::new(198, 51, 100, 0), 24).into()],
        };
        let back = round_trip(&Message::Update(update), AsPathWidth::Two);
        let Message::Update(back) = back else {
            panic!("expected update");
        };
        let Some(PathAttributeValue::AsPath(decoded)) = back
            .attribute(crate::messages::PathAttributeTypeCode::AsPath)
            .cloned()
        else {
            panic!("as path missing");
        };
        prop_assert_eq!(decoded.len(), path.len());
        for (got, sent) in decoded.iter().zip(path.iter()) {
            prop_assert_eq!(got.typ, sent.typ);
            let expected: Vec<u32> = sent
                .value
                .iter()
                .map(|asn| u16::try_from(*asn).map(u32::from).unwrap_or(u32::from(AS_TRANS)))
                .collect();
            prop_assert_eq!(&got.value, &expected);
        }
    }

    /// OPEN messages keep their fields, and the sender's ASN is recovered
    /// from the four-octet capability whatever its width.
    #[test]
    fn prop_open_round_trip(
        asn in any::<u32>(),
        hold_time in any::<u16>(),
        id in any::<u32>(),
        ipv6 in any::<bool>(),
    ) {
        let mut caps = vec![
            Capability::MultiprotocolExtensions { afi: 1, safi: 1 },
            Capability::FourOctetAs { asn },
        ];
        if ipv6 {
            caps.push(Capability::MultiprotocolExtensions {
                afi: AFI_IPV6,
                safi: SAFI_UNICAST,
            });
        }
        let open = OpenMessage::new(asn, hold_time, id, caps);
        let back = round_trip(&Message::Open(open.clone()), AsPathWidth::Two);
        let Message::Open(back) = back else {
            panic!("expected open");
        };
        prop_assert_eq!(&back, &open);
        prop_assert_eq!(back.peer_asn(), asn);
        prop_assert_eq!(back.families().len(), if ipv6 { 2 } else { 1 });
        if asn > u32::from(u16::MAX) {
            prop_assert_eq!(back.asn, AS_TRANS);
        }
    }

    /// Decoding arbitrary bytes returns an error or a message, never
    /// panics.
    #[test]
    fn prop_decode_never_panics(
        body in prop::collection::vec(any::<u8>(), 0..512),
        typ in 1u8..=4,
        four in any::<bool>(),
    ) {
        let width = if four { AsPathWidth::Four } else { AsPathWidth::Two };
        let mut frame = vec![0xff; 16];
        frame.extend_from_slice(&((body.len() + 19) as u16).to_be_bytes());
        frame.push(typ);
        frame.extend_from_slice(&body);
        let _ = Message::from_frame(&frame, width);
    }

    /// A frame cut short is always rejected.
    #[test]
    fn prop_truncated_frames_rejected(
        update in ipv4_update_strategy(),
        cut in 1usize..64,
    ) {
        let frame = Message::Update(update)
            .to_frame(AsPathWidth::Four)
            .expect("encode");
        let cut = cut.min(frame.len() - 1);
        prop_assert!(
            Message::from_frame(&frame[..frame.len() - cut], AsPathWidth::Four)
                .is_err()
        );
    }
}
