// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::{CorruptMessage, Error};
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32, u8 as parse_u8},
};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use rdb::types::{AsPath, AsSegment, Origin, UnknownAttribute};
use rdb::{Prefix4, Prefix6};
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const MAX_MESSAGE_SIZE: usize = 4096;

/// IANA address family numbers.
pub const AFI_IPV4: u16 = 1;
pub const AFI_IPV6: u16 = 2;

/// Unicast subsequent address family.
pub const SAFI_UNICAST: u8 = 1;

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    /// The first message sent by each side once a TCP connection is
    /// established.
    ///
    /// RFC 4271 §4.2
    Open = 1,

    /// Used to transfer routing information between BGP peers.
    ///
    /// RFC 4271 §4.3
    Update = 2,

    /// Sent when an error condition is detected.
    ///
    /// RFC 4271 §4.5
    Notification = 3,

    /// Exchanged between peers often enough not to cause the hold timer to
    /// expire.
    ///
    /// RFC 4271 §4.4
    KeepAlive = 4,
}

impl MessageType {
    /// Smallest legal total length, header included.
    pub fn min_length(&self) -> usize {
        match self {
            Self::Open => 29,
            Self::Update => 23,
            Self::Notification => 21,
            Self::KeepAlive => Header::WIRE_SIZE,
        }
    }
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> Self {
        match m {
            Message::Open(_) => Self::Open,
            Message::Update(_) => Self::Update,
            Message::Notification(_) => Self::Notification,
            Message::KeepAlive => Self::KeepAlive,
        }
    }
}

/// The width of AS numbers inside AS_PATH and AGGREGATOR. Four octets are
/// used once both ends advertised the capability.
///
/// Ref: RFC 6793
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsPathWidth {
    #[default]
    Two,
    Four,
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
}

impl Message {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Update(_) => "update",
            Self::Notification(_) => "notification",
            Self::KeepAlive => "keepalive",
        }
    }

    /// Serialize the message body, without the header.
    pub fn to_wire(&self, width: AsPathWidth) -> Result<Vec<u8>, Error> {
        match self {
            Self::Open(m) => m.to_wire(),
            Self::Update(m) => m.to_wire(width),
            Self::Notification(m) => m.to_wire(),
            Self::KeepAlive => Ok(Vec::new()),
        }
    }

    /// Serialize the message including its header.
    pub fn to_frame(&self, width: AsPathWidth) -> Result<Vec<u8>, Error> {
        let body = self.to_wire(width)?;
        let length = body.len() + Header::WIRE_SIZE;
        if length > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge(format!(
                "{} message of {length} bytes",
                self.title()
            )));
        }
        let header = Header {
            length: length as u16,
            typ: MessageType::from(self),
        };
        let mut buf = header.to_wire();
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Deserialize a message body whose header has already been checked.
    pub fn from_wire(
        typ: MessageType,
        body: &[u8],
        width: AsPathWidth,
    ) -> Result<Message, CorruptMessage> {
        match typ {
            MessageType::Open => OpenMessage::from_wire(body)
                .map(Message::Open)
                .map_err(|e| {
                    CorruptMessage::new(
                        OpenErrorSubcode::Unspecific,
                        Vec::new(),
                        format!("open: {e}"),
                    )
                }),
            MessageType::Update => {
                UpdateMessage::from_wire(body, width).map(Message::Update)
            }
            MessageType::Notification => NotificationMessage::from_wire(body)
                .map(Message::Notification)
                .map_err(|e| {
                    CorruptMessage::new(
                        HeaderErrorSubcode::Unspecific,
                        Vec::new(),
                        format!("notification: {e}"),
                    )
                }),
            MessageType::KeepAlive => Ok(Message::KeepAlive),
        }
    }

    /// Deserialize a complete message, header included.
    pub fn from_frame(
        buf: &[u8],
        width: AsPathWidth,
    ) -> Result<Message, CorruptMessage> {
        let header = Header::from_wire(buf)?;
        if buf.len() != usize::from(header.length) {
            return Err(CorruptMessage::new(
                HeaderErrorSubcode::BadMessageLength,
                header.length.to_be_bytes().to_vec(),
                format!(
                    "header length {} but frame is {} bytes",
                    header.length,
                    buf.len()
                ),
            ));
        }
        Self::from_wire(header.typ, &buf[Header::WIRE_SIZE..], width)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(m) => write!(
                f,
                "open asn={} hold={} id={}",
                m.asn,
                m.hold_time,
                Ipv4Addr::from(m.id)
            ),
            Self::Update(m) => write!(
                f,
                "update withdrawn={} attributes={} nlri={}",
                m.withdrawn.len(),
                m.path_attributes.len(),
                m.nlri.len()
            ),
            Self::Notification(m) => {
                write!(f, "notification {}", m.error_subcode)
            }
            Self::KeepAlive => write!(f, "keepalive"),
        }
    }
}

macro_rules! message_from {
    ($($kind:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$kind> for Message {
                fn from(m: $kind) -> Message {
                    Message::$variant(m)
                }
            }
        )*
    };
}

message_from! {
    OpenMessage => Open,
    UpdateMessage => Update,
    NotificationMessage => Notification,
}

/// Each BGP message has a fixed sized header.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                                                               +
///   |                                                               |
///   +                                                               +
///   |                           Marker                              |
///   +                                                               +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |          Length               |      Type     |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// This object contains the length and type fields. The marker is generated
/// by [`Header::to_wire`] and checked by [`Header::from_wire`].
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    /// Total length of the message, including the header. May be no larger than
    /// 4096.
    pub length: u16,

    /// Indicates the type of message.
    pub typ: MessageType,
}

/// According to RFC 4271 §4.1 the header marker is all ones.
const MARKER: [u8; 16] = [0xFFu8; 16];

impl Header {
    pub const WIRE_SIZE: usize = 19;

    /// Serialize the header to wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.push(self.typ as u8);
        buf
    }

    /// Deserialize and check a header.
    ///
    /// Ref: RFC 4271 §6.1
    pub fn from_wire(input: &[u8]) -> Result<Header, CorruptMessage> {
        if input.len() < Self::WIRE_SIZE {
            return Err(CorruptMessage::new(
                HeaderErrorSubcode::BadMessageLength,
                Vec::new(),
                format!("short header of {} bytes", input.len()),
            ));
        }
        if input[..16] != MARKER {
            return Err(CorruptMessage::new(
                HeaderErrorSubcode::ConnectionNotSynchronized,
                Vec::new(),
                "marker is not all ones",
            ));
        }

        let length = u16::from_be_bytes([input[16], input[17]]);
        let length_error = |reason: String| {
            CorruptMessage::new(
                HeaderErrorSubcode::BadMessageLength,
                length.to_be_bytes().to_vec(),
                reason,
            )
        };
        let len = usize::from(length);
        if !(Self::WIRE_SIZE..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(length_error(format!("length {len} out of range")));
        }

        let typ = MessageType::try_from(input[18]).map_err(|_| {
            CorruptMessage::new(
                HeaderErrorSubcode::BadMessageType,
                vec![input[18]],
                format!("unknown message type {}", input[18]),
            )
        })?;

        if len < typ.min_length() {
            return Err(length_error(format!(
                "length {len} too small for {typ:?}"
            )));
        }
        if typ == MessageType::KeepAlive && len != Self::WIRE_SIZE {
            return Err(length_error(format!("keepalive of length {len}")));
        }

        Ok(Header { length, typ })
    }
}

/// The autonomous system number used in place of ASNs that do not fit in
/// two octets.
///
/// Ref: RFC 6793 §9
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4
pub const BGP4: u8 = 4;

/// The first message sent by each side once a TCP connection is established.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     My Autonomous System      |   Hold Time   :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               |                BGP Identifier                 :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               | Opt Parm Len  |     Optional Parameters       :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :             Optional Parameters (cont, variable)              :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.2
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OpenMessage {
    /// BGP protocol version.
    pub version: u8,

    /// Autonomous system number of the sender. Senders whose ASN does not
    /// fit in two octets put AS_TRANS here and the real value in the
    /// four-octet AS capability.
    pub asn: u16,

    /// Number of seconds the sender proposes for the hold timer.
    pub hold_time: u16,

    /// BGP identifier of the sender
    pub id: u32,

    /// A list of optional parameters.
    pub parameters: Vec<OptionalParameter>,
}

impl OpenMessage {
    /// Create an open message. ASNs wider than two octets are sent as
    /// AS_TRANS, the caller adds the four-octet AS capability.
    pub fn new(
        asn: u32,
        hold_time: u16,
        id: u32,
        capabilities: Vec<Capability>,
    ) -> OpenMessage {
        let mut m = OpenMessage {
            version: BGP4,
            asn: u16::try_from(asn).unwrap_or(AS_TRANS),
            hold_time,
            id,
            parameters: Vec::new(),
        };
        m.add_capabilities(&capabilities);
        m
    }

    pub fn add_capabilities(&mut self, capabilities: &[Capability]) {
        if capabilities.is_empty() {
            return;
        }
        for p in &mut self.parameters {
            if let OptionalParameter::Capabilities(cs) = p {
                cs.extend_from_slice(capabilities);
                return;
            }
        }
        self.parameters
            .push(OptionalParameter::Capabilities(capabilities.into()));
    }

    /// Every capability carried, across all capability parameters.
    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.parameters.iter().flat_map(|p| match p {
            OptionalParameter::Capabilities(cs) => cs.as_slice(),
            OptionalParameter::Unknown { .. } => &[],
        })
    }

    pub fn four_octet_asn(&self) -> Option<u32> {
        self.capabilities().find_map(|c| match c {
            Capability::FourOctetAs { asn } => Some(*asn),
            _ => None,
        })
    }

    /// The sender's ASN, preferring the four-octet capability.
    pub fn peer_asn(&self) -> u32 {
        self.four_octet_asn().unwrap_or(u32::from(self.asn))
    }

    /// Address families the sender asked for. A sender that lists none is
    /// assumed to speak IPv4 unicast only.
    ///
    /// Ref: RFC 4760 §8
    pub fn families(&self) -> Vec<(u16, u8)> {
        let families: Vec<(u16, u8)> = self
            .capabilities()
            .filter_map(|c| match c {
                Capability::MultiprotocolExtensions { afi, safi } => {
                    Some((*afi, *safi))
                }
                _ => None,
            })
            .collect();
        if families.is_empty() {
            vec![(AFI_IPV4, SAFI_UNICAST)]
        } else {
            families
        }
    }

    /// Serialize an open message to wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let params = self
            .parameters
            .iter()
            .map(OptionalParameter::to_wire)
            .collect::<Result<Vec<_>, _>>()?
            .concat();
        let params_len = u8::try_from(params.len()).map_err(|_| {
            Error::TooLarge(format!("open parameters of {}", params.len()))
        })?;

        let mut buf = Vec::with_capacity(10 + params.len());
        buf.push(self.version);
        buf.extend_from_slice(&self.asn.to_be_bytes());
        buf.extend_from_slice(&self.hold_time.to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.push(params_len);
        buf.extend_from_slice(&params);
        Ok(buf)
    }

    /// Deserialize an open message from wire format.
    pub fn from_wire(input: &[u8]) -> Result<OpenMessage, Error> {
        let (input, version) = parse_u8(input)?;
        let (input, asn) = be_u16(input)?;
        let (input, hold_time) = be_u16(input)?;
        let (input, id) = be_u32(input)?;
        let (input, params_len) = parse_u8(input)?;
        let (rest, mut params) = take(params_len)(input)?;
        if !rest.is_empty() {
            return Err(Error::TooLarge(format!(
                "{} bytes after open parameters",
                rest.len()
            )));
        }

        let mut parameters = Vec::new();
        while !params.is_empty() {
            let (tail, p) = OptionalParameter::from_wire(params)?;
            parameters.push(p);
            params = tail;
        }

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            id,
            parameters,
        })
    }
}

/// An update message is used to advertise feasible routes that share common
/// path attributes to a peer, or to withdraw multiple unfeasible routes from
/// service.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |        Witdrawn Length        |       Withdrawn Routes        :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :                Withdrawn Routes (cont, variable)              :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Path Attribute Length      |       Path Attributes         :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :                Path Attributes (cont, variable)               :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :       Network Layer Reachability Information (variable)       :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.3
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix>,
    pub path_attributes: Vec<PathAttribute>,
    pub nlri: Vec<Prefix>,
}

impl UpdateMessage {
    pub fn to_wire(&self, width: AsPathWidth) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        // withdrawn
        let withdrawn = prefixes_to_wire(&self.withdrawn)?;
        if withdrawn.len() > u16::MAX as usize {
            return Err(Error::TooLarge(
                "update: too many withdrawn prefixes".into(),
            ));
        }
        let len = withdrawn.len() as u16;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&withdrawn);

        // path attributes
        let attrs = self.path_attrs_to_wire(width)?;
        if attrs.len() > u16::MAX as usize {
            return Err(Error::TooLarge(
                "update: too many path attributes".into(),
            ));
        }
        let len = attrs.len() as u16;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&attrs);

        // nlri
        buf.extend_from_slice(&prefixes_to_wire(&self.nlri)?);

        if buf.len() + Header::WIRE_SIZE > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge(
                "update exceeds max message size".into(),
            ));
        }

        Ok(buf)
    }

    fn path_attrs_to_wire(&self, width: AsPathWidth) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for p in &self.path_attributes {
            buf.extend_from_slice(&p.to_wire(width)?);
        }
        Ok(buf)
    }

    pub fn from_wire(
        input: &[u8],
        width: AsPathWidth,
    ) -> Result<UpdateMessage, CorruptMessage> {
        let malformed = |reason: &str| {
            CorruptMessage::new(
                UpdateErrorSubcode::MalformedAttributeList,
                Vec::new(),
                reason,
            )
        };

        if input.len() < 2 {
            return Err(malformed("missing withdrawn length"));
        }
        let len = usize::from(u16::from_be_bytes([input[0], input[1]]));
        let input = &input[2..];
        if input.len() < len {
            return Err(malformed("withdrawn length exceeds message"));
        }
        let (withdrawn_input, input) = input.split_at(len);
        let withdrawn =
            prefixes_from_wire(withdrawn_input, Ipv4Addr::MAX_PREFIX_LEN)?;

        if input.len() < 2 {
            return Err(malformed("missing path attribute length"));
        }
        let len = usize::from(u16::from_be_bytes([input[0], input[1]]));
        let input = &input[2..];
        if input.len() < len {
            return Err(malformed("path attribute length exceeds message"));
        }
        let (attrs_input, nlri_input) = input.split_at(len);
        let path_attributes = Self::path_attrs_from_wire(attrs_input, width)?;

        let nlri = prefixes_from_wire(nlri_input, Ipv4Addr::MAX_PREFIX_LEN)?;

        Ok(UpdateMessage {
            withdrawn,
            path_attributes,
            nlri,
        })
    }

    fn path_attrs_from_wire(
        mut buf: &[u8],
        width: AsPathWidth,
    ) -> Result<Vec<PathAttribute>, CorruptMessage> {
        let mut result = Vec::new();
        while !buf.is_empty() {
            let (out, pa) = PathAttribute::from_wire(buf, width)?;
            result.push(pa);
            buf = out;
        }
        Ok(result)
    }

    pub fn attribute(
        &self,
        code: PathAttributeTypeCode,
    ) -> Option<&PathAttributeValue> {
        self.path_attributes
            .iter()
            .find(|a| a.typ.type_code == code)
            .map(|a| &a.value)
    }

    pub fn nexthop4(&self) -> Option<Ipv4Addr> {
        match self.attribute(PathAttributeTypeCode::NextHop) {
            Some(PathAttributeValue::NextHop(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn mp_reach(&self) -> Option<&MpReachNlri> {
        match self.attribute(PathAttributeTypeCode::MpReachNlri) {
            Some(PathAttributeValue::MpReachNlri(mp)) => Some(mp),
            _ => None,
        }
    }

    pub fn mp_unreach(&self) -> Option<&MpUnreachNlri> {
        match self.attribute(PathAttributeTypeCode::MpUnreachNlri) {
            Some(PathAttributeValue::MpUnreachNlri(mp)) => Some(mp),
            _ => None,
        }
    }

    /// True when the update announces anything, in any family.
    pub fn announces(&self) -> bool {
        !self.nlri.is_empty()
            || self.mp_reach().is_some_and(|mp| !mp.nlri.is_empty())
    }
}

trait MaxPrefixLen {
    const MAX_PREFIX_LEN: u8;
}

impl MaxPrefixLen for Ipv4Addr {
    const MAX_PREFIX_LEN: u8 = 32;
}

impl MaxPrefixLen for Ipv6Addr {
    const MAX_PREFIX_LEN: u8 = 128;
}

fn prefixes_to_wire(prefixes: &[Prefix]) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    for p in prefixes {
        buf.extend_from_slice(&p.to_wire()?);
    }
    Ok(buf)
}

fn prefixes_from_wire(
    mut buf: &[u8],
    max_len: u8,
) -> Result<Vec<Prefix>, CorruptMessage> {
    let mut result = Vec::new();
    while !buf.is_empty() {
        let (out, pfx) = Prefix::from_wire(buf, max_len).map_err(|e| {
            CorruptMessage::new(
                UpdateErrorSubcode::InvalidNetworkField,
                Vec::new(),
                format!("prefix: {e}"),
            )
        })?;
        result.push(pfx);
        buf = out;
    }
    Ok(result)
}

/// This data structure captures a network prefix as it's layed out in a BGP
/// message. There is a prefix length followed by a variable number of bytes.
/// Just enough bytes to express the prefix.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Prefix {
    pub length: u8,
    pub value: Vec<u8>,
}

impl Prefix {
    fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let n = (self.length as usize).div_ceil(8);
        if self.value.len() < n {
            return Err(Error::TooLarge(format!(
                "prefix length {} with {} bytes",
                self.length,
                self.value.len()
            )));
        }
        let mut buf = vec![self.length];
        buf.extend_from_slice(&self.value[..n]);
        Ok(buf)
    }

    fn from_wire(input: &[u8], max_len: u8) -> Result<(&[u8], Prefix), Error> {
        let (input, len) = parse_u8(input)?;
        if len > max_len {
            return Err(Error::InvalidAddress(format!(
                "prefix length {len} exceeds {max_len}"
            )));
        }
        let (input, value) = take(len.div_ceil(8))(input)?;
        Ok((
            input,
            Prefix {
                value: value.to_owned(),
                length: len,
            },
        ))
    }

    fn octets<const N: usize>(&self) -> [u8; N] {
        let mut octets = [0u8; N];
        let n = self.value.len().min(N);
        octets[..n].copy_from_slice(&self.value[..n]);
        octets
    }
}

impl std::str::FromStr for Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = match s.split_once('/') {
            Some(split) => split,
            None => return Err("invalid prefix".to_owned()),
        };
        let addr: IpAddr = match addr.parse() {
            Ok(addr) => addr,
            Err(_) => return Err("invalid addr".to_owned()),
        };
        let length: u8 = match len.parse() {
            Ok(len) => len,
            Err(_) => return Err("invalid length".to_owned()),
        };
        Ok(match addr {
            IpAddr::V4(a) => Prefix4::new(a, length).into(),
            IpAddr::V6(a) => Prefix6::new(a, length).into(),
        })
    }
}

/// The BGP prefix format only contains enough bytes to describe the prefix
/// so missing trailing octets are zero. Host bits are cleared.
impl From<&Prefix> for Prefix4 {
    fn from(p: &Prefix) -> Self {
        Prefix4::new(Ipv4Addr::from(p.octets::<4>()), p.length.min(32))
    }
}

impl From<&Prefix> for Prefix6 {
    fn from(p: &Prefix) -> Self {
        Prefix6::new(Ipv6Addr::from(p.octets::<16>()), p.length.min(128))
    }
}

impl From<Prefix4> for Prefix {
    fn from(p: Prefix4) -> Self {
        let n = (p.length as usize).div_ceil(8);
        Self {
            value: p.value.octets()[..n].to_vec(),
            length: p.length,
        }
    }
}

impl From<Prefix6> for Prefix {
    fn from(p: Prefix6) -> Self {
        let n = (p.length as usize).div_ceil(8);
        Self {
            value: p.value.octets()[..n].to_vec(),
            length: p.length,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PathAttribute {
    pub typ: PathAttributeType,
    pub value: PathAttributeValue,
}

impl From<PathAttributeValue> for PathAttribute {
    fn from(v: PathAttributeValue) -> Self {
        use path_attribute_flags::{OPTIONAL, TRANSITIVE};
        let type_code = v.type_code();
        let flags = match &v {
            PathAttributeValue::Unknown { flags, .. } => *flags,
            _ if type_code.is_well_known() => TRANSITIVE,
            PathAttributeValue::MultiExitDisc(_)
            | PathAttributeValue::MpReachNlri(_)
            | PathAttributeValue::MpUnreachNlri(_) => OPTIONAL,
            _ => OPTIONAL | TRANSITIVE,
        };
        Self {
            typ: PathAttributeType { flags, type_code },
            value: v,
        }
    }
}

impl PathAttribute {
    pub fn to_wire(&self, width: AsPathWidth) -> Result<Vec<u8>, Error> {
        let mut buf = self.typ.to_wire();
        let val = &self.value.to_wire(width)?;
        if self.typ.flags & path_attribute_flags::EXTENDED_LENGTH != 0 {
            if val.len() > u16::MAX as usize {
                return Err(Error::TooLarge("extended path attribute".into()));
            }
            let len = val.len() as u16;
            buf.extend_from_slice(&len.to_be_bytes())
        } else {
            if val.len() > u8::MAX as usize {
                return Err(Error::TooLarge("pathattribute".into()));
            }
            buf.push(val.len() as u8);
        }
        buf.extend_from_slice(val);
        Ok(buf)
    }

    fn from_wire(
        input: &[u8],
        width: AsPathWidth,
    ) -> Result<(&[u8], PathAttribute), CorruptMessage> {
        let malformed = |reason: &str| {
            CorruptMessage::new(
                UpdateErrorSubcode::MalformedAttributeList,
                Vec::new(),
                reason,
            )
        };
        if input.len() < 3 {
            return Err(malformed("truncated attribute header"));
        }
        let typ = PathAttributeType {
            flags: input[0],
            type_code: PathAttributeTypeCode::from(input[1]),
        };
        let (header_len, len) =
            if typ.flags & path_attribute_flags::EXTENDED_LENGTH != 0 {
                if input.len() < 4 {
                    return Err(malformed("truncated attribute header"));
                }
                (4, usize::from(u16::from_be_bytes([input[2], input[3]])))
            } else {
                (3, usize::from(input[2]))
            };
        if input.len() < header_len + len {
            return Err(malformed("attribute length exceeds attribute list"));
        }
        let raw = &input[..header_len + len];
        let rest = &input[header_len + len..];

        if let Some(expected) = typ.type_code.expected_optional() {
            let optional = typ.flags & path_attribute_flags::OPTIONAL != 0;
            if optional != expected {
                return Err(CorruptMessage::new(
                    UpdateErrorSubcode::AttributeFlags,
                    raw.to_vec(),
                    format!("bad flags {:#04x} on {:?}", typ.flags, typ.type_code),
                ));
            }
        }

        let value = PathAttributeValue::from_wire(
            &raw[header_len..],
            typ.flags,
            typ.type_code,
            width,
        )
        .map_err(|subcode| {
            CorruptMessage::new(
                subcode,
                raw.to_vec(),
                format!("{:?} attribute", typ.type_code),
            )
        })?;
        Ok((rest, PathAttribute { typ, value }))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PathAttributeType {
    pub flags: u8,
    pub type_code: PathAttributeTypeCode,
}

impl PathAttributeType {
    pub fn to_wire(&self) -> Vec<u8> {
        vec![self.flags, self.type_code.into()]
    }
}

pub mod path_attribute_flags {
    pub const OPTIONAL: u8 = 0b10000000;
    pub const TRANSITIVE: u8 = 0b01000000;
    pub const PARTIAL: u8 = 0b00100000;
    pub const EXTENDED_LENGTH: u8 = 0b00010000;
}

#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Copy,
    Clone,
    FromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum PathAttributeTypeCode {
    /// RFC 4271
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,

    /// RFC 1997
    Communities = 8,

    /// RFC 4760
    MpReachNlri = 14,
    MpUnreachNlri = 15,

    /// RFC 6793
    As4Path = 17,
    As4Aggregator = 18,

    #[num_enum(catch_all)]
    Other(u8),
}

impl PathAttributeTypeCode {
    pub fn is_well_known(&self) -> bool {
        matches!(
            self,
            Self::Origin
                | Self::AsPath
                | Self::NextHop
                | Self::LocalPref
                | Self::AtomicAggregate
        )
    }

    /// Whether the OPTIONAL flag must be set, for attributes we recognize.
    fn expected_optional(&self) -> Option<bool> {
        match self {
            Self::Other(_) => None,
            x => Some(!x.is_well_known()),
        }
    }
}

/// The aggregating speaker, with an ASN of either width.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Aggregator {
    pub asn: u32,
    pub address: Ipv4Addr,
}

/// Reachable destinations of a family other than IPv4 unicast, together with
/// their next-hop.
///
/// Ref: RFC 4760 §3
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MpReachNlri {
    pub afi: u16,
    pub safi: u8,
    pub nexthop: IpAddr,

    /// Present when an IPv6 next-hop is followed by its link-local twin.
    pub link_local: Option<Ipv6Addr>,
    pub nlri: Vec<Prefix>,
}

/// Withdrawn destinations of a family other than IPv4 unicast.
///
/// Ref: RFC 4760 §4
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MpUnreachNlri {
    pub afi: u16,
    pub safi: u8,
    pub withdrawn: Vec<Prefix>,
}

fn family_max_len(afi: u16, safi: u8) -> Option<u8> {
    match (afi, safi) {
        (AFI_IPV4, SAFI_UNICAST) => Some(Ipv4Addr::MAX_PREFIX_LEN),
        (AFI_IPV6, SAFI_UNICAST) => Some(Ipv6Addr::MAX_PREFIX_LEN),
        _ => None,
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PathAttributeValue {
    Origin(PathOrigin),
    AsPath(Vec<AsPathSegment>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator(Aggregator),
    Communities(Vec<u32>),
    MpReachNlri(MpReachNlri),
    MpUnreachNlri(MpUnreachNlri),
    As4Path(Vec<AsPathSegment>),
    As4Aggregator(Aggregator),

    /// An attribute we do not interpret, carried verbatim.
    Unknown {
        flags: u8,
        type_code: u8,
        value: Vec<u8>,
    },
}

fn exact<const N: usize>(input: &[u8]) -> Result<[u8; N], UpdateErrorSubcode> {
    input
        .try_into()
        .map_err(|_| UpdateErrorSubcode::AttributeLength)
}

impl PathAttributeValue {
    pub fn type_code(&self) -> PathAttributeTypeCode {
        use PathAttributeTypeCode as Code;
        match self {
            Self::Origin(_) => Code::Origin,
            Self::AsPath(_) => Code::AsPath,
            Self::NextHop(_) => Code::NextHop,
            Self::MultiExitDisc(_) => Code::MultiExitDisc,
            Self::LocalPref(_) => Code::LocalPref,
            Self::AtomicAggregate => Code::AtomicAggregate,
            Self::Aggregator(_) => Code::Aggregator,
            Self::Communities(_) => Code::Communities,
            Self::MpReachNlri(_) => Code::MpReachNlri,
            Self::MpUnreachNlri(_) => Code::MpUnreachNlri,
            Self::As4Path(_) => Code::As4Path,
            Self::As4Aggregator(_) => Code::As4Aggregator,
            Self::Unknown { type_code, .. } => Code::from(*type_code),
        }
    }

    pub fn to_wire(&self, width: AsPathWidth) -> Result<Vec<u8>, Error> {
        match self {
            Self::Origin(x) => Ok(vec![*x as u8]),
            Self::AsPath(segments) => {
                let mut buf = Vec::new();
                for s in segments {
                    buf.extend_from_slice(&s.to_wire(width)?);
                }
                Ok(buf)
            }
            Self::As4Path(segments) => {
                let mut buf = Vec::new();
                for s in segments {
                    buf.extend_from_slice(&s.to_wire(AsPathWidth::Four)?);
                }
                Ok(buf)
            }
            Self::NextHop(addr) => Ok(addr.octets().into()),
            Self::MultiExitDisc(v) | Self::LocalPref(v) => {
                Ok(v.to_be_bytes().into())
            }
            Self::AtomicAggregate => Ok(Vec::new()),
            Self::Aggregator(a) => Ok(a.to_wire(width)),
            Self::As4Aggregator(a) => Ok(a.to_wire(AsPathWidth::Four)),
            Self::Communities(communities) => {
                let mut buf = Vec::new();
                for community in communities {
                    buf.extend_from_slice(&community.to_be_bytes());
                }
                Ok(buf)
            }
            Self::MpReachNlri(mp) => {
                let mut buf = mp.afi.to_be_bytes().to_vec();
                buf.push(mp.safi);
                let mut nh = match mp.nexthop {
                    IpAddr::V4(a) => a.octets().to_vec(),
                    IpAddr::V6(a) => a.octets().to_vec(),
                };
                if let Some(ll) = mp.link_local {
                    nh.extend_from_slice(&ll.octets());
                }
                buf.push(nh.len() as u8);
                buf.extend_from_slice(&nh);
                // reserved
                buf.push(0);
                buf.extend_from_slice(&prefixes_to_wire(&mp.nlri)?);
                Ok(buf)
            }
            Self::MpUnreachNlri(mp) => {
                let mut buf = mp.afi.to_be_bytes().to_vec();
                buf.push(mp.safi);
                buf.extend_from_slice(&prefixes_to_wire(&mp.withdrawn)?);
                Ok(buf)
            }
            Self::Unknown { value, .. } => Ok(value.clone()),
        }
    }

    /// Decode an attribute value. Failures name the UPDATE error subcode to
    /// report.
    pub fn from_wire(
        input: &[u8],
        flags: u8,
        type_code: PathAttributeTypeCode,
        width: AsPathWidth,
    ) -> Result<PathAttributeValue, UpdateErrorSubcode> {
        use PathAttributeTypeCode as Code;
        match type_code {
            Code::Origin => {
                let [origin] = exact::<1>(input)?;
                PathOrigin::try_from(origin)
                    .map(PathAttributeValue::Origin)
                    .map_err(|_| UpdateErrorSubcode::InvalidOriginAttribute)
            }
            Code::AsPath => {
                Ok(PathAttributeValue::AsPath(segments_from_wire(input, width)?))
            }
            Code::As4Path => Ok(PathAttributeValue::As4Path(
                segments_from_wire(input, AsPathWidth::Four)?,
            )),
            Code::NextHop => {
                Ok(PathAttributeValue::NextHop(exact::<4>(input)?.into()))
            }
            Code::MultiExitDisc => Ok(PathAttributeValue::MultiExitDisc(
                u32::from_be_bytes(exact(input)?),
            )),
            Code::LocalPref => Ok(PathAttributeValue::LocalPref(
                u32::from_be_bytes(exact(input)?),
            )),
            Code::AtomicAggregate => {
                exact::<0>(input)?;
                Ok(PathAttributeValue::AtomicAggregate)
            }
            Code::Aggregator => Ok(PathAttributeValue::Aggregator(
                Aggregator::from_wire(input, width)?,
            )),
            Code::As4Aggregator => Ok(PathAttributeValue::As4Aggregator(
                Aggregator::from_wire(input, AsPathWidth::Four)?,
            )),
            Code::Communities => {
                if input.len() % 4 != 0 {
                    return Err(UpdateErrorSubcode::AttributeLength);
                }
                Ok(PathAttributeValue::Communities(
                    input
                        .chunks_exact(4)
                        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ))
            }
            Code::MpReachNlri => {
                Ok(PathAttributeValue::MpReachNlri(mp_reach_from_wire(input)?))
            }
            Code::MpUnreachNlri => {
                if input.len() < 3 {
                    return Err(UpdateErrorSubcode::AttributeLength);
                }
                let afi = u16::from_be_bytes([input[0], input[1]]);
                let safi = input[2];
                let max_len = family_max_len(afi, safi)
                    .ok_or(UpdateErrorSubcode::OptionalAttribute)?;
                let withdrawn = prefixes_from_wire(&input[3..], max_len)
                    .map_err(|_| UpdateErrorSubcode::OptionalAttribute)?;
                Ok(PathAttributeValue::MpUnreachNlri(MpUnreachNlri {
                    afi,
                    safi,
                    withdrawn,
                }))
            }
            Code::Other(code) => Ok(PathAttributeValue::Unknown {
                flags,
                type_code: code,
                value: input.to_vec(),
            }),
        }
    }
}

fn mp_reach_from_wire(input: &[u8]) -> Result<MpReachNlri, UpdateErrorSubcode> {
    if input.len() < 4 {
        return Err(UpdateErrorSubcode::AttributeLength);
    }
    let afi = u16::from_be_bytes([input[0], input[1]]);
    let safi = input[2];
    let max_len =
        family_max_len(afi, safi).ok_or(UpdateErrorSubcode::OptionalAttribute)?;
    let nh_len = usize::from(input[3]);
    let input = &input[4..];
    // next-hop, then one reserved octet
    if input.len() < nh_len + 1 {
        return Err(UpdateErrorSubcode::AttributeLength);
    }
    let nh = &input[..nh_len];
    let (nexthop, link_local) = match (afi, nh_len) {
        (AFI_IPV4, 4) => (IpAddr::V4(exact::<4>(nh)?.into()), None),
        (AFI_IPV6, 16) => (IpAddr::V6(exact::<16>(nh)?.into()), None),
        (AFI_IPV6, 32) => (
            IpAddr::V6(exact::<16>(&nh[..16])?.into()),
            Some(Ipv6Addr::from(exact::<16>(&nh[16..])?)),
        ),
        _ => return Err(UpdateErrorSubcode::OptionalAttribute),
    };
    let nlri = prefixes_from_wire(&input[nh_len + 1..], max_len)
        .map_err(|_| UpdateErrorSubcode::OptionalAttribute)?;
    Ok(MpReachNlri {
        afi,
        safi,
        nexthop,
        link_local,
        nlri,
    })
}

fn segments_from_wire(
    mut input: &[u8],
    width: AsPathWidth,
) -> Result<Vec<AsPathSegment>, UpdateErrorSubcode> {
    let mut segments = Vec::new();
    while !input.is_empty() {
        let (out, seg) = AsPathSegment::from_wire(input, width)?;
        segments.push(seg);
        input = out;
    }
    Ok(segments)
}

impl Aggregator {
    fn to_wire(&self, width: AsPathWidth) -> Vec<u8> {
        let mut buf = match width {
            AsPathWidth::Two => u16::try_from(self.asn)
                .unwrap_or(AS_TRANS)
                .to_be_bytes()
                .to_vec(),
            AsPathWidth::Four => self.asn.to_be_bytes().to_vec(),
        };
        buf.extend_from_slice(&self.address.octets());
        buf
    }

    fn from_wire(
        input: &[u8],
        width: AsPathWidth,
    ) -> Result<Aggregator, UpdateErrorSubcode> {
        let (asn, addr) = match width {
            AsPathWidth::Two => {
                let b = exact::<6>(input)?;
                (u32::from(u16::from_be_bytes([b[0], b[1]])), [b[2], b[3], b[4], b[5]])
            }
            AsPathWidth::Four => {
                let b = exact::<8>(input)?;
                (
                    u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
                    [b[4], b[5], b[6], b[7]],
                )
            }
        };
        Ok(Aggregator {
            asn,
            address: Ipv4Addr::from(addr),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum PathOrigin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl From<PathOrigin> for Origin {
    fn from(o: PathOrigin) -> Self {
        match o {
            PathOrigin::Igp => Origin::Igp,
            PathOrigin::Egp => Origin::Egp,
            PathOrigin::Incomplete => Origin::Incomplete,
        }
    }
}

impl From<Origin> for PathOrigin {
    fn from(o: Origin) -> Self {
        match o {
            Origin::Igp => PathOrigin::Igp,
            Origin::Egp => PathOrigin::Egp,
            Origin::Incomplete => PathOrigin::Incomplete,
        }
    }
}

/// One segment of an AS path. Values are held at full width whatever the
/// session encodes them with.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AsPathSegment {
    pub typ: AsPathType,
    pub value: Vec<u32>,
}

impl AsPathSegment {
    pub fn sequence(value: Vec<u32>) -> Self {
        Self {
            typ: AsPathType::AsSequence,
            value,
        }
    }

    pub fn to_wire(&self, width: AsPathWidth) -> Result<Vec<u8>, Error> {
        if self.value.len() > u8::MAX as usize {
            return Err(Error::TooLarge("AS path segment".into()));
        }
        let mut buf = vec![self.typ as u8, self.value.len() as u8];
        for v in &self.value {
            match width {
                AsPathWidth::Two => buf.extend_from_slice(
                    &u16::try_from(*v).unwrap_or(AS_TRANS).to_be_bytes(),
                ),
                AsPathWidth::Four => buf.extend_from_slice(&v.to_be_bytes()),
            }
        }
        Ok(buf)
    }

    pub fn from_wire(
        input: &[u8],
        width: AsPathWidth,
    ) -> Result<(&[u8], AsPathSegment), UpdateErrorSubcode> {
        if input.len() < 2 {
            return Err(UpdateErrorSubcode::MalformedAsPath);
        }
        let typ = AsPathType::try_from(input[0])
            .map_err(|_| UpdateErrorSubcode::MalformedAsPath)?;
        let count = usize::from(input[1]);
        let size = match width {
            AsPathWidth::Two => 2,
            AsPathWidth::Four => 4,
        };
        let input = &input[2..];
        if input.len() < count * size {
            return Err(UpdateErrorSubcode::MalformedAsPath);
        }
        let (values, rest) = input.split_at(count * size);
        let value = values
            .chunks_exact(size)
            .map(|c| match width {
                AsPathWidth::Two => u32::from(u16::from_be_bytes([c[0], c[1]])),
                AsPathWidth::Four => {
                    u32::from_be_bytes([c[0], c[1], c[2], c[3]])
                }
            })
            .collect();
        Ok((rest, AsPathSegment { typ, value }))
    }
}

impl From<&AsPathSegment> for AsSegment {
    fn from(s: &AsPathSegment) -> Self {
        match s.typ {
            AsPathType::AsSet => AsSegment::Set(s.value.clone()),
            AsPathType::AsSequence => AsSegment::Sequence(s.value.clone()),
        }
    }
}

impl From<&AsSegment> for AsPathSegment {
    fn from(s: &AsSegment) -> Self {
        match s {
            AsSegment::Set(v) => AsPathSegment {
                typ: AsPathType::AsSet,
                value: v.clone(),
            },
            AsSegment::Sequence(v) => AsPathSegment {
                typ: AsPathType::AsSequence,
                value: v.clone(),
            },
        }
    }
}

/// The wire segments of a pipeline AS path.
pub fn as_path_segments(path: &AsPath) -> Vec<AsPathSegment> {
    path.segments.iter().map(AsPathSegment::from).collect()
}

impl From<&PathAttributeValue> for Option<UnknownAttribute> {
    fn from(v: &PathAttributeValue) -> Self {
        match v {
            PathAttributeValue::Unknown {
                flags,
                type_code,
                value,
            } => Some(UnknownAttribute {
                flags: *flags,
                type_code: *type_code,
                value: value.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum AsPathType {
    AsSet = 1,
    AsSequence = 2,
}

/// Sent when an error condition is detected, right before the connection is
/// closed.
///
/// The data field content depends on the error. For header length errors it
/// is the erroneous length, for a bad message type the type octet, for an
/// unsupported version the highest version we speak, and for most UPDATE
/// attribute errors the offending attribute (type, length and value).
///
/// Ref: RFC 4271 §4.5, §6
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NotificationMessage {
    pub error_code: ErrorCode,
    pub error_subcode: ErrorSubcode,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(error_subcode: impl Into<ErrorSubcode>, data: Vec<u8>) -> Self {
        let error_subcode = error_subcode.into();
        Self {
            error_code: error_subcode.error_code(),
            error_subcode,
            data,
        }
    }

    pub fn cease(subcode: CeaseErrorSubcode) -> Self {
        Self::new(subcode, Vec::new())
    }

    pub fn hold_timer_expired() -> Self {
        Self::new(ErrorSubcode::HoldTime(0), Vec::new())
    }

    pub fn fsm_error() -> Self {
        Self::new(ErrorSubcode::Fsm(0), Vec::new())
    }

    /// The notification a malformed received notification is taken as.
    pub fn malformed() -> Self {
        Self::cease(CeaseErrorSubcode::Unspecific)
    }

    /// Code and subcode as they appear on the wire.
    pub fn codes(&self) -> (u8, u8) {
        (self.error_code as u8, self.error_subcode.as_u8())
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let (code, subcode) = self.codes();
        if self.error_subcode.error_code() != self.error_code
            || !self.error_subcode.is_valid()
        {
            return Err(Error::InvalidNotification(code, subcode));
        }
        let mut buf = vec![code, subcode];
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn from_wire(input: &[u8]) -> Result<NotificationMessage, Error> {
        let (input, code) = parse_u8(input)?;
        let (data, subcode) = parse_u8(input)?;
        let error_subcode = ErrorSubcode::from_codes(code, subcode)?;
        if !error_subcode.is_valid() {
            return Err(Error::InvalidNotification(code, subcode));
        }
        Ok(NotificationMessage {
            error_code: error_subcode.error_code(),
            error_subcode,
            data: data.to_vec(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open,
    Update,
    HoldTimerExpired,
    Fsm,
    Cease,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorSubcode {
    Header(HeaderErrorSubcode),
    Open(OpenErrorSubcode),
    Update(UpdateErrorSubcode),
    HoldTime(u8),
    Fsm(u8),
    Cease(CeaseErrorSubcode),
}

macro_rules! subcode_from {
    ($($kind:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$kind> for ErrorSubcode {
                fn from(x: $kind) -> ErrorSubcode {
                    ErrorSubcode::$variant(x)
                }
            }
        )*
    };
}

subcode_from! {
    HeaderErrorSubcode => Header,
    OpenErrorSubcode => Open,
    UpdateErrorSubcode => Update,
    CeaseErrorSubcode => Cease,
}

impl ErrorSubcode {
    /// Interpret a code and subcode pair read off the wire.
    pub fn from_codes(code: u8, subcode: u8) -> Result<Self, Error> {
        Ok(match ErrorCode::try_from(code)? {
            ErrorCode::Header => HeaderErrorSubcode::try_from(subcode)?.into(),
            ErrorCode::Open => OpenErrorSubcode::try_from(subcode)?.into(),
            ErrorCode::Update => UpdateErrorSubcode::try_from(subcode)?.into(),
            ErrorCode::HoldTimerExpired => Self::HoldTime(subcode),
            ErrorCode::Fsm => Self::Fsm(subcode),
            ErrorCode::Cease => CeaseErrorSubcode::try_from(subcode)?.into(),
        })
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Header(_) => ErrorCode::Header,
            Self::Open(_) => ErrorCode::Open,
            Self::Update(_) => ErrorCode::Update,
            Self::HoldTime(_) => ErrorCode::HoldTimerExpired,
            Self::Fsm(_) => ErrorCode::Fsm,
            Self::Cease(_) => ErrorCode::Cease,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Header(h) => *h as u8,
            Self::Open(o) => *o as u8,
            Self::Update(u) => *u as u8,
            Self::HoldTime(x) => *x,
            Self::Fsm(x) => *x,
            Self::Cease(c) => *c as u8,
        }
    }

    /// Hold timer expiry has no subcodes. FSM errors have the ones defined
    /// by RFC 6608.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::HoldTime(x) => *x == 0,
            Self::Fsm(x) => *x <= 3,
            _ => true,
        }
    }
}

impl Display for ErrorSubcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(s) => write!(f, "header error/{s:?}"),
            Self::Open(s) => write!(f, "open error/{s:?}"),
            Self::Update(s) => write!(f, "update error/{s:?}"),
            Self::HoldTime(_) => write!(f, "hold timer expired"),
            Self::Fsm(s) => write!(f, "fsm error/{s}"),
            Self::Cease(s) => write!(f, "cease/{s:?}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum HeaderErrorSubcode {
    Unspecific = 0,
    ConnectionNotSynchronized,
    BadMessageLength,
    BadMessageType,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum OpenErrorSubcode {
    Unspecific = 0,
    UnsupportedVersionNumber,
    BadPeerAS,
    BadBgpIdentifier,
    UnsupportedOptionalParameter,
    Deprecated,
    UnacceptableHoldTime,
    UnsupportedCapability,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum UpdateErrorSubcode {
    Unspecific = 0,
    MalformedAttributeList,
    UnrecognizedWellKnownAttribute,
    MissingWellKnownAttribute,
    AttributeFlags,
    AttributeLength,
    InvalidOriginAttribute,
    Deprecated,
    InvalidNexthopAttribute,
    OptionalAttribute,
    InvalidNetworkField,
    MalformedAsPath,
}

/// Ref: RFC 4486
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum CeaseErrorSubcode {
    Unspecific = 0,
    MaximumNumberofPrefixesReached,
    AdministrativeShutdown,
    PeerDeconfigured,
    AdministrativeReset,
    ConnectionRejected,
    OtherConfigurationChange,
    ConnectionCollisionResolution,
    OutOfResources,
}

/// Optional parameters of an OPEN message. Only capabilities are
/// understood, anything else is kept so that it can be refused.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum OptionalParameter {
    /// Code 2: RFC 5492
    Capabilities(Vec<Capability>),

    Unknown { code: u8, value: Vec<u8> },
}

#[derive(Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum OptionalParameterCode {
    Capabilities = 2,
}

impl OptionalParameter {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let (code, value) = match self {
            Self::Capabilities(cs) => {
                let mut csbuf = Vec::new();
                for c in cs {
                    csbuf.extend_from_slice(&c.to_wire()?);
                }
                (OptionalParameterCode::Capabilities as u8, csbuf)
            }
            Self::Unknown { code, value } => (*code, value.clone()),
        };
        if value.len() > u8::MAX as usize {
            return Err(Error::TooLarge("optional parameter".into()));
        }
        let mut buf = vec![code, value.len() as u8];
        buf.extend_from_slice(&value);
        Ok(buf)
    }

    pub fn from_wire(
        input: &[u8],
    ) -> Result<(&[u8], OptionalParameter), Error> {
        let (input, code) = parse_u8(input)?;
        let (input, len) = parse_u8(input)?;
        let (input, mut cap_input) = take(len)(input)?;

        match OptionalParameterCode::try_from(code) {
            Ok(OptionalParameterCode::Capabilities) => {
                let mut result = Vec::new();
                while !cap_input.is_empty() {
                    let (out, cap) = Capability::from_wire(cap_input)?;
                    result.push(cap);
                    cap_input = out;
                }
                Ok((input, OptionalParameter::Capabilities(result)))
            }
            Err(_) => Ok((
                input,
                OptionalParameter::Unknown {
                    code,
                    value: cap_input.to_vec(),
                },
            )),
        }
    }
}

/// Optional capabilities supported by this implementation. Anything else a
/// peer advertises is carried as `Unknown` and otherwise ignored.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Capability {
    /// RFC 4760
    MultiprotocolExtensions { afi: u16, safi: u8 },

    /// RFC 2918
    RouteRefresh,

    /// RFC 6793
    FourOctetAs { asn: u32 },

    Unknown { code: u8, value: Vec<u8> },
}

impl Capability {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let (code, value) = match self {
            Self::MultiprotocolExtensions { afi, safi } => {
                let mut buf = afi.to_be_bytes().to_vec();
                buf.push(0);
                buf.push(*safi);
                (CapabilityCode::MultiprotocolExtensions as u8, buf)
            }
            Self::RouteRefresh => {
                (CapabilityCode::RouteRefresh as u8, Vec::new())
            }
            Self::FourOctetAs { asn } => (
                CapabilityCode::FourOctetAs as u8,
                asn.to_be_bytes().to_vec(),
            ),
            Self::Unknown { code, value } => (*code, value.clone()),
        };
        if value.len() > u8::MAX as usize {
            return Err(Error::TooLarge("capability".into()));
        }
        let mut buf = vec![code, value.len() as u8];
        buf.extend_from_slice(&value);
        Ok(buf)
    }

    /// Capabilities whose value does not have the expected shape are kept
    /// as unknown rather than failing the whole OPEN.
    pub fn from_wire(input: &[u8]) -> Result<(&[u8], Capability), Error> {
        let (input, code) = parse_u8(input)?;
        let (input, len) = parse_u8(input)?;
        let (input, value) = take(len)(input)?;

        let cap = match (CapabilityCode::try_from(code), value) {
            (Ok(CapabilityCode::MultiprotocolExtensions), [a0, a1, 0, safi]) => {
                Capability::MultiprotocolExtensions {
                    afi: u16::from_be_bytes([*a0, *a1]),
                    safi: *safi,
                }
            }
            (Ok(CapabilityCode::RouteRefresh), []) => Capability::RouteRefresh,
            (Ok(CapabilityCode::FourOctetAs), [a, b, c, d]) => {
                Capability::FourOctetAs {
                    asn: u32::from_be_bytes([*a, *b, *c, *d]),
                }
            }
            _ => Capability::Unknown {
                code,
                value: value.to_vec(),
            },
        };
        Ok((input, cap))
    }
}

#[derive(Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum CapabilityCode {
    /// RFC 2858
    MultiprotocolExtensions = 1,

    /// RFC 2918
    RouteRefresh = 2,

    /// RFC 6793
    FourOctetAs = 65,
}
