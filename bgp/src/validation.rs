// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Semantic checks on received OPEN and UPDATE messages. Structural problems
//! are caught while decoding, what is left here needs session context.

use crate::error::CorruptMessage;
use crate::messages::{
    path_attribute_flags, AsPathWidth, OpenErrorSubcode, OpenMessage,
    OptionalParameter, PathAttributeTypeCode, PathAttributeValue,
    UpdateErrorSubcode, UpdateMessage, AS_TRANS, BGP4,
};
use slog::{warn, Logger};
use std::collections::BTreeSet;

/// Validate a received OPEN against the ASN we expect the peer to have.
///
/// Ref: RFC 4271 §6.2
pub fn check_open(
    open: &OpenMessage,
    peer_asn: u32,
) -> Result<(), CorruptMessage> {
    if open.version != BGP4 {
        return Err(CorruptMessage::new(
            OpenErrorSubcode::UnsupportedVersionNumber,
            u16::from(BGP4).to_be_bytes().to_vec(),
            format!("version {}", open.version),
        ));
    }

    let asn = open.peer_asn();
    if asn != peer_asn {
        return Err(CorruptMessage::new(
            OpenErrorSubcode::BadPeerAS,
            Vec::new(),
            format!("expected asn {peer_asn} got {asn}"),
        ));
    }

    for p in &open.parameters {
        if let OptionalParameter::Unknown { code, .. } = p {
            return Err(CorruptMessage::new(
                OpenErrorSubcode::UnsupportedOptionalParameter,
                Vec::new(),
                format!("optional parameter {code}"),
            ));
        }
    }

    if open.hold_time == 1 || open.hold_time == 2 {
        return Err(CorruptMessage::new(
            OpenErrorSubcode::UnacceptableHoldTime,
            Vec::new(),
            format!("hold time {}", open.hold_time),
        ));
    }

    Ok(())
}

/// The hold time both ends will use.
pub fn negotiate_hold(offered: u16, configured: u16) -> u16 {
    offered.min(configured)
}

/// Validate a received UPDATE.
///
/// Ref: RFC 4271 §6.3
pub fn check_update(
    update: &UpdateMessage,
    peer_asn: u32,
    ibgp: bool,
    width: AsPathWidth,
    log: &Logger,
) -> Result<(), CorruptMessage> {
    if update.path_attributes.is_empty() {
        if !update.nlri.is_empty() {
            return Err(CorruptMessage::new(
                UpdateErrorSubcode::MalformedAttributeList,
                Vec::new(),
                "nlri without path attributes",
            ));
        }
        return Ok(());
    }

    let mut seen = BTreeSet::new();
    for a in &update.path_attributes {
        if !seen.insert(a.typ.type_code) {
            return Err(CorruptMessage::new(
                UpdateErrorSubcode::MalformedAttributeList,
                Vec::new(),
                format!("duplicate {:?} attribute", a.typ.type_code),
            ));
        }
        if let PathAttributeTypeCode::Other(code) = a.typ.type_code {
            if a.typ.flags & path_attribute_flags::OPTIONAL == 0 {
                return Err(CorruptMessage::new(
                    UpdateErrorSubcode::UnrecognizedWellKnownAttribute,
                    a.to_wire(width).unwrap_or_default(),
                    format!("unrecognized well-known attribute {code}"),
                ));
            }
        }
    }

    if !ibgp && seen.contains(&PathAttributeTypeCode::AsPath) {
        check_ebgp_path(update, peer_asn)?;
    }

    if let Some(mp) = update.mp_reach() {
        if mp.nexthop.is_unspecified() {
            return Err(CorruptMessage::new(
                UpdateErrorSubcode::MissingWellKnownAttribute,
                vec![PathAttributeTypeCode::NextHop.into()],
                "unspecified MP_REACH_NLRI next-hop",
            ));
        }
    }

    // Attributes are only required alongside something to announce.
    if !update.announces() {
        return Ok(());
    }

    let mut required =
        vec![PathAttributeTypeCode::Origin, PathAttributeTypeCode::AsPath];
    if !update.nlri.is_empty() {
        required.push(PathAttributeTypeCode::NextHop);
    }
    for code in required {
        if !seen.contains(&code) {
            return Err(CorruptMessage::new(
                UpdateErrorSubcode::MissingWellKnownAttribute,
                vec![code.into()],
                format!("missing {code:?} attribute"),
            ));
        }
    }

    match (ibgp, update.attribute(PathAttributeTypeCode::LocalPref)) {
        (false, Some(_)) => {
            warn!(log, "LOCAL_PREF from external peer AS{peer_asn}");
        }
        (true, None) => {
            warn!(log, "no LOCAL_PREF from internal peer AS{peer_asn}");
        }
        _ => {}
    }

    Ok(())
}

fn check_ebgp_path(
    update: &UpdateMessage,
    peer_asn: u32,
) -> Result<(), CorruptMessage> {
    let first = match update.attribute(PathAttributeTypeCode::AsPath) {
        Some(PathAttributeValue::AsPath(segments)) => {
            segments.first().and_then(|s| s.value.first().copied())
        }
        _ => None,
    };
    let ok = match first {
        Some(asn) if asn == peer_asn => true,
        // A four-octet neighbor seen through a two-octet session.
        Some(asn) => asn == u32::from(AS_TRANS) && peer_asn > 0xffff,
        None => false,
    };
    if ok {
        Ok(())
    } else {
        Err(CorruptMessage::new(
            UpdateErrorSubcode::MalformedAsPath,
            Vec::new(),
            format!("first as {first:?} is not peer as {peer_asn}"),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::{
        AsPathSegment, Capability, ErrorSubcode, MpReachNlri, PathOrigin,
        Prefix, AFI_IPV6, SAFI_UNICAST,
    };
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn log() -> Logger {
        bgp_common::log::discard_logger()
    }

    fn nlri() -> Vec<Prefix> {
        vec!["198.51.100.0/24".parse().unwrap()]
    }

    fn announce(path: Vec<u32>) -> UpdateMessage {
        UpdateMessage {
            path_attributes: vec![
                PathAttributeValue::Origin(PathOrigin::Igp).into(),
                PathAttributeValue::AsPath(vec![AsPathSegment::sequence(
                    path,
                )])
                .into(),
                PathAttributeValue::NextHop(Ipv4Addr::new(192, 0, 2, 1))
                    .into(),
            ],
            nlri: nlri(),
            ..Default::default()
        }
    }

    fn subcode(r: Result<(), CorruptMessage>) -> ErrorSubcode {
        r.expect_err("expected validation failure").error_subcode
    }

    #[test]
    fn open_wrong_asn() {
        let open = OpenMessage::new(666, 90, 1, vec![]);
        assert_eq!(
            subcode(check_open(&open, 65001)),
            OpenErrorSubcode::BadPeerAS.into()
        );
        assert!(check_open(&open, 666).is_ok());
    }

    #[test]
    fn open_four_octet_asn_compared() {
        let open = OpenMessage::new(
            4200000000,
            90,
            1,
            vec![Capability::FourOctetAs { asn: 4200000000 }],
        );
        assert!(check_open(&open, 4200000000).is_ok());
        assert!(check_open(&open, u32::from(AS_TRANS)).is_err());
    }

    #[test]
    fn open_version() {
        let mut open = OpenMessage::new(65001, 90, 1, vec![]);
        open.version = 3;
        let e = check_open(&open, 65001).unwrap_err();
        assert_eq!(
            e.error_subcode,
            OpenErrorSubcode::UnsupportedVersionNumber.into()
        );
        assert_eq!(e.data, vec![0, 4]);
    }

    #[test]
    fn open_hold_time_one_or_two_rejected() {
        for hold in [1, 2] {
            let open = OpenMessage::new(65001, hold, 1, vec![]);
            assert_eq!(
                subcode(check_open(&open, 65001)),
                OpenErrorSubcode::UnacceptableHoldTime.into()
            );
        }
        for hold in [0, 3, 90] {
            let open = OpenMessage::new(65001, hold, 1, vec![]);
            assert!(check_open(&open, 65001).is_ok());
        }
    }

    #[test]
    fn open_unknown_parameter() {
        let mut open = OpenMessage::new(65001, 90, 1, vec![]);
        open.parameters.push(OptionalParameter::Unknown {
            code: 1,
            value: vec![0],
        });
        assert_eq!(
            subcode(check_open(&open, 65001)),
            OpenErrorSubcode::UnsupportedOptionalParameter.into()
        );
    }

    #[test]
    fn hold_negotiation() {
        assert_eq!(negotiate_hold(180, 90), 90);
        assert_eq!(negotiate_hold(30, 90), 30);
        assert_eq!(negotiate_hold(0, 90), 0);
    }

    #[test]
    fn nlri_without_attributes() {
        let update = UpdateMessage {
            nlri: nlri(),
            ..Default::default()
        };
        assert_eq!(
            subcode(check_update(
                &update,
                65001,
                false,
                AsPathWidth::Four,
                &log()
            )),
            UpdateErrorSubcode::MalformedAttributeList.into()
        );
    }

    #[test]
    fn withdraw_only_is_fine() {
        let update = UpdateMessage {
            withdrawn: nlri(),
            ..Default::default()
        };
        assert!(
            check_update(&update, 65001, false, AsPathWidth::Four, &log())
                .is_ok()
        );
    }

    #[test]
    fn missing_nexthop() {
        let mut update = announce(vec![65001]);
        update.path_attributes.pop();
        let e = check_update(&update, 65001, false, AsPathWidth::Four, &log())
            .unwrap_err();
        assert_eq!(
            e.error_subcode,
            UpdateErrorSubcode::MissingWellKnownAttribute.into()
        );
        assert_eq!(e.data, vec![3]);
    }

    #[test]
    fn mp_reach_satisfies_nexthop() {
        let update = UpdateMessage {
            path_attributes: vec![
                PathAttributeValue::Origin(PathOrigin::Igp).into(),
                PathAttributeValue::AsPath(vec![AsPathSegment::sequence(
                    vec![65001],
                )])
                .into(),
                PathAttributeValue::MpReachNlri(MpReachNlri {
                    afi: AFI_IPV6,
                    safi: SAFI_UNICAST,
                    nexthop: "2001:db8::1".parse().unwrap(),
                    link_local: None,
                    nlri: vec!["2001:db8:1::/48".parse().unwrap()],
                })
                .into(),
            ],
            ..Default::default()
        };
        assert!(
            check_update(&update, 65001, false, AsPathWidth::Four, &log())
                .is_ok()
        );
    }

    #[test]
    fn duplicate_attribute() {
        let mut update = announce(vec![65001]);
        update
            .path_attributes
            .push(PathAttributeValue::Origin(PathOrigin::Egp).into());
        assert_eq!(
            subcode(check_update(
                &update,
                65001,
                false,
                AsPathWidth::Four,
                &log()
            )),
            UpdateErrorSubcode::MalformedAttributeList.into()
        );
    }

    #[test]
    fn unrecognized_well_known() {
        let mut update = announce(vec![65001]);
        update.path_attributes.push(
            PathAttributeValue::Unknown {
                flags: path_attribute_flags::TRANSITIVE,
                type_code: 40,
                value: vec![1],
            }
            .into(),
        );
        let e = check_update(&update, 65001, false, AsPathWidth::Four, &log())
            .unwrap_err();
        assert_eq!(
            e.error_subcode,
            UpdateErrorSubcode::UnrecognizedWellKnownAttribute.into()
        );
        assert_eq!(e.data, vec![path_attribute_flags::TRANSITIVE, 40, 1, 1]);
    }

    #[test]
    fn ebgp_first_as() {
        let update = announce(vec![65002, 65001]);
        assert_eq!(
            subcode(check_update(
                &update,
                65001,
                false,
                AsPathWidth::Four,
                &log()
            )),
            UpdateErrorSubcode::MalformedAsPath.into()
        );
        assert!(
            check_update(&update, 65001, true, AsPathWidth::Four, &log())
                .is_ok()
        );

        let empty = announce(vec![]);
        assert!(
            check_update(&empty, 65001, false, AsPathWidth::Four, &log())
                .is_err()
        );
        assert!(
            check_update(&empty, 65001, true, AsPathWidth::Four, &log())
                .is_ok()
        );
    }

    #[test]
    fn ebgp_bad_path_without_nlri() {
        let mut update = announce(vec![65002, 65001]);
        update.nlri.clear();
        update.withdrawn = nlri();
        assert_eq!(
            subcode(check_update(
                &update,
                65001,
                false,
                AsPathWidth::Four,
                &log()
            )),
            UpdateErrorSubcode::MalformedAsPath.into()
        );
        assert!(
            check_update(&update, 65001, true, AsPathWidth::Four, &log())
                .is_ok()
        );

        let mut empty = announce(vec![]);
        empty.nlri.clear();
        assert_eq!(
            subcode(check_update(
                &empty,
                65001,
                false,
                AsPathWidth::Four,
                &log()
            )),
            UpdateErrorSubcode::MalformedAsPath.into()
        );
    }

    #[test]
    fn mp_reach_zero_nexthop() {
        let update = UpdateMessage {
            path_attributes: vec![
                PathAttributeValue::Origin(PathOrigin::Igp).into(),
                PathAttributeValue::AsPath(vec![AsPathSegment::sequence(
                    vec![65001],
                )])
                .into(),
                PathAttributeValue::MpReachNlri(MpReachNlri {
                    afi: AFI_IPV6,
                    safi: SAFI_UNICAST,
                    nexthop: "::".parse().unwrap(),
                    link_local: None,
                    nlri: vec!["2001:db8:1::/48".parse().unwrap()],
                })
                .into(),
            ],
            ..Default::default()
        };
        let e = check_update(&update, 65001, false, AsPathWidth::Four, &log())
            .unwrap_err();
        assert_eq!(
            e.error_subcode,
            UpdateErrorSubcode::MissingWellKnownAttribute.into()
        );
        assert_eq!(e.data, vec![3]);
    }

    #[test]
    fn as_trans_accepted_for_wide_peer() {
        let update = announce(vec![u32::from(AS_TRANS)]);
        assert!(check_update(
            &update,
            4200000000,
            false,
            AsPathWidth::Two,
            &log()
        )
        .is_ok());
    }
}
