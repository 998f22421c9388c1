// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Eq, Hash, PartialEq, JsonSchema,
)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl PartialOrd for Prefix4 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prefix4 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix4 {
    pub const HOST_MASK: u8 = 32;

    /// Create a new `Prefix4` from an IP address and net mask.
    /// The newly created `Prefix4` will have its host bits zeroed upon creation
    /// e.g.
    /// ```
    /// use rdb::types::Prefix4;
    /// use std::net::Ipv4Addr;
    /// use std::str::FromStr;
    /// let p4 = Prefix4::new(Ipv4Addr::from_str("10.0.0.10").unwrap(), 24);
    /// assert_eq!(p4.value, Ipv4Addr::from_str("10.0.0.0").unwrap());
    /// ```
    pub fn new(ip: Ipv4Addr, length: u8) -> Self {
        let mut new = Self {
            value: ip,
            length: length.min(Self::HOST_MASK),
        };
        new.unset_host_bits();
        new
    }

    fn mask(&self) -> u32 {
        match self.length {
            0 => 0,
            n => (!0u32) << (Self::HOST_MASK - n.min(Self::HOST_MASK)),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.value.to_bits() & self.mask() == self.value.to_bits()
    }

    pub fn unset_host_bits(&mut self) {
        self.value = Ipv4Addr::from_bits(self.value.to_bits() & self.mask())
    }

    /// Check if this prefix is contained within another prefix.
    /// Returns true if this prefix is equal to or more specific than the other.
    pub fn within(&self, other: &Prefix4) -> bool {
        if self.length < other.length {
            return false;
        }
        let mask = other.mask();
        self.value.to_bits() & mask == other.value.to_bits() & mask
    }

    /// True when `addr` falls inside this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr.to_bits() & self.mask() == self.value.to_bits()
    }
}

impl fmt::Display for Prefix4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) =
            s.split_once('/').ok_or("malformed prefix".to_string())?;
        let value: Ipv4Addr =
            value.parse().map_err(|_| "malformed ip addr".to_string())?;
        let length: u8 =
            length.parse().map_err(|_| "malformed length".to_string())?;
        if length > Self::HOST_MASK {
            return Err(format!("prefix length {length} out of range"));
        }
        Ok(Self::new(value, length))
    }
}

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, JsonSchema,
)]
pub struct Prefix6 {
    pub value: Ipv6Addr,
    pub length: u8,
}

impl PartialOrd for Prefix6 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prefix6 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl fmt::Display for Prefix6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl Prefix6 {
    pub const HOST_MASK: u8 = 128;

    /// Create a new `Prefix6` from an IP address and net mask.
    /// The newly created `Prefix6` will have its host bits zeroed upon creation
    /// e.g.
    /// ```
    /// use rdb::types::Prefix6;
    /// use std::net::Ipv6Addr;
    /// use std::str::FromStr;
    /// let p6 = Prefix6::new(Ipv6Addr::from_str("2001:db8::1").unwrap(), 64);
    /// assert_eq!(p6.value, Ipv6Addr::from_str("2001:db8::").unwrap());
    /// ```
    pub fn new(ip: Ipv6Addr, length: u8) -> Self {
        let mut new = Self {
            value: ip,
            length: length.min(Self::HOST_MASK),
        };
        new.unset_host_bits();
        new
    }

    fn mask(&self) -> u128 {
        match self.length {
            0 => 0,
            n => (!0u128) << (Self::HOST_MASK - n.min(Self::HOST_MASK)),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.value.to_bits() & self.mask() == self.value.to_bits()
    }

    pub fn unset_host_bits(&mut self) {
        self.value = Ipv6Addr::from_bits(self.value.to_bits() & self.mask())
    }

    /// Check if this prefix is contained within another prefix.
    /// Returns true if this prefix is equal to or more specific than the other.
    pub fn within(&self, other: &Prefix6) -> bool {
        if self.length < other.length {
            return false;
        }
        let mask = other.mask();
        self.value.to_bits() & mask == other.value.to_bits() & mask
    }

    /// True when `addr` falls inside this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        addr.to_bits() & self.mask() == self.value.to_bits()
    }
}

impl FromStr for Prefix6 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) =
            s.split_once('/').ok_or("malformed prefix".to_string())?;
        let value: Ipv6Addr =
            value.parse().map_err(|_| "malformed ip addr".to_string())?;
        let length: u8 =
            length.parse().map_err(|_| "malformed length".to_string())?;
        if length > Self::HOST_MASK {
            return Err(format!("prefix length {length} out of range"));
        }
        Ok(Self::new(value, length))
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    JsonSchema,
    PartialOrd,
    Ord,
)]
pub enum Prefix {
    V4(Prefix4),
    V6(Prefix6),
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::V4(p) => Display::fmt(p, f),
            Self::V6(p) => Display::fmt(p, f),
        }
    }
}

impl From<Prefix4> for Prefix {
    fn from(value: Prefix4) -> Self {
        Self::V4(value)
    }
}

impl From<Prefix6> for Prefix {
    fn from(value: Prefix6) -> Self {
        Self::V6(value)
    }
}

impl FromStr for Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(prefix4) = s.parse::<Prefix4>() {
            Ok(Prefix::V4(prefix4))
        } else if let Ok(prefix6) = s.parse::<Prefix6>() {
            Ok(Prefix::V6(prefix6))
        } else {
            Err(format!("invalid prefix: {s}"))
        }
    }
}

impl Prefix {
    pub fn new(ip: IpAddr, length: u8) -> Self {
        match ip {
            IpAddr::V4(ip4) => Self::V4(Prefix4::new(ip4, length)),
            IpAddr::V6(ip6) => Self::V6(Prefix6::new(ip6, length)),
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, Prefix::V4(_))
    }
}

/// The address family a pipeline is instantiated over. Routes, prefixes and
/// next-hops in one pipeline all share the same family.
pub trait Afi:
    Copy + Debug + Display + Eq + Ord + Hash + Send + Sync + 'static
{
    type Prefix: Copy
        + Debug
        + Display
        + Eq
        + Ord
        + Hash
        + Send
        + Sync
        + 'static;

    const NAME: &'static str;

    /// IANA address family number.
    const AFI: u16;

    const MAX_PREFIX_LEN: u8;

    fn make_prefix(addr: Self, length: u8) -> Self::Prefix;
    fn prefix_addr(prefix: &Self::Prefix) -> Self;
    fn prefix_len(prefix: &Self::Prefix) -> u8;

    fn prefix_contains(prefix: &Self::Prefix, addr: Self) -> bool {
        Self::make_prefix(addr, Self::prefix_len(prefix)) == *prefix
    }

    fn into_ip(self) -> IpAddr;
    fn from_ip(ip: IpAddr) -> Option<Self>;
    fn unspecified() -> Self;
}

impl Afi for Ipv4Addr {
    type Prefix = Prefix4;
    const NAME: &'static str = "ipv4";
    const AFI: u16 = 1;
    const MAX_PREFIX_LEN: u8 = Prefix4::HOST_MASK;

    fn make_prefix(addr: Self, length: u8) -> Prefix4 {
        Prefix4::new(addr, length)
    }

    fn prefix_addr(prefix: &Prefix4) -> Self {
        prefix.value
    }

    fn prefix_len(prefix: &Prefix4) -> u8 {
        prefix.length
    }

    fn prefix_contains(prefix: &Prefix4, addr: Self) -> bool {
        prefix.contains(addr)
    }

    fn into_ip(self) -> IpAddr {
        IpAddr::V4(self)
    }

    fn from_ip(ip: IpAddr) -> Option<Self> {
        match ip {
            IpAddr::V4(a) => Some(a),
            IpAddr::V6(a) => a.to_ipv4_mapped(),
        }
    }

    fn unspecified() -> Self {
        Ipv4Addr::UNSPECIFIED
    }
}

impl Afi for Ipv6Addr {
    type Prefix = Prefix6;
    const NAME: &'static str = "ipv6";
    const AFI: u16 = 2;
    const MAX_PREFIX_LEN: u8 = Prefix6::HOST_MASK;

    fn make_prefix(addr: Self, length: u8) -> Prefix6 {
        Prefix6::new(addr, length)
    }

    fn prefix_addr(prefix: &Prefix6) -> Self {
        prefix.value
    }

    fn prefix_len(prefix: &Prefix6) -> u8 {
        prefix.length
    }

    fn prefix_contains(prefix: &Prefix6, addr: Self) -> bool {
        prefix.contains(addr)
    }

    fn into_ip(self) -> IpAddr {
        IpAddr::V6(self)
    }

    fn from_ip(ip: IpAddr) -> Option<Self> {
        match ip {
            IpAddr::V6(a) if a.to_ipv4_mapped().is_none() => Some(a),
            _ => None,
        }
    }

    fn unspecified() -> Self {
        Ipv6Addr::UNSPECIFIED
    }
}

/// Identifies the source of routes entering the pipeline. Every configured
/// peering gets its own id; `LOCAL` is the branch carrying routes this router
/// originates itself.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct PeerId(pub u32);

impl PeerId {
    pub const LOCAL: PeerId = PeerId(0);

    pub fn is_local(&self) -> bool {
        *self == Self::LOCAL
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "local")
        } else {
            write!(f, "peer{}", self.0)
        }
    }
}

/// Generation of a peering session. Incremented each time the session with a
/// peer reaches the established state.
pub type GenId = u32;

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Igp => write!(f, "igp"),
            Origin::Egp => write!(f, "egp"),
            Origin::Incomplete => write!(f, "incomplete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AsSegment {
    Sequence(Vec<u32>),
    Set(Vec<u32>),
}

impl AsSegment {
    pub fn asns(&self) -> &[u32] {
        match self {
            Self::Sequence(v) | Self::Set(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AsPath {
    pub segments: Vec<AsSegment>,
}

impl AsPath {
    pub fn sequence(asns: &[u32]) -> Self {
        if asns.is_empty() {
            return Self::default();
        }
        Self {
            segments: vec![AsSegment::Sequence(asns.to_vec())],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.asns().is_empty())
    }

    /// Path length as used by the decision process. Every AS in a sequence
    /// counts, a set counts once regardless of its size.
    pub fn path_length(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s {
                AsSegment::Sequence(v) => v.len(),
                AsSegment::Set(v) => usize::from(!v.is_empty()),
            })
            .sum()
    }

    /// The left-most AS in the path, the neighbor that announced it.
    pub fn first_asn(&self) -> Option<u32> {
        self.segments
            .iter()
            .find_map(|s| s.asns().first().copied())
    }

    pub fn contains(&self, asn: u32) -> bool {
        self.segments.iter().any(|s| s.asns().contains(&asn))
    }

    pub fn prepend(&self, asn: u32) -> AsPath {
        let mut segments = self.segments.clone();
        match segments.first_mut() {
            Some(AsSegment::Sequence(v)) if v.len() < usize::from(u8::MAX) => {
                v.insert(0, asn)
            }
            _ => segments.insert(0, AsSegment::Sequence(vec![asn])),
        }
        AsPath { segments }
    }
}

impl Display for AsPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for s in &self.segments {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            match s {
                AsSegment::Sequence(v) => {
                    let v: Vec<String> =
                        v.iter().map(|a| a.to_string()).collect();
                    write!(f, "{}", v.join(" "))?;
                }
                AsSegment::Set(v) => {
                    let v: Vec<String> =
                        v.iter().map(|a| a.to_string()).collect();
                    write!(f, "{{{}}}", v.join(","))?;
                }
            }
        }
        Ok(())
    }
}

/// An optional transitive attribute we do not interpret but must pass on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnknownAttribute {
    pub flags: u8,
    pub type_code: u8,
    pub value: Vec<u8>,
}

/// The attributes shared by all routes announced together. Lists are
/// immutable once built and interned by the attribute manager, so routes
/// carrying identical attributes share one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathAttributeList<A: Afi> {
    pub nexthop: A,
    pub origin: Origin,
    pub as_path: AsPath,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<(u32, Ipv4Addr)>,
    pub communities: Vec<u32>,
    pub unknown: Vec<UnknownAttribute>,
}

impl<A: Afi> PathAttributeList<A> {
    pub fn new(nexthop: A, origin: Origin, as_path: AsPath) -> Self {
        Self {
            nexthop,
            origin,
            as_path,
            med: None,
            local_pref: None,
            atomic_aggregate: false,
            aggregator: None,
            communities: Vec::new(),
            unknown: Vec::new(),
        }
    }

    pub fn with_med(mut self, med: u32) -> Self {
        self.med = Some(med);
        self
    }

    pub fn with_local_pref(mut self, local_pref: u32) -> Self {
        self.local_pref = Some(local_pref);
        self
    }
}

impl<A: Afi> Display for PathAttributeList<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nexthop {} origin {} path [{}]",
            self.nexthop, self.origin, self.as_path
        )?;
        if let Some(med) = self.med {
            write!(f, " med {med}")?;
        }
        if let Some(lp) = self.local_pref {
            write!(f, " local-pref {lp}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRoute<A: Afi> {
    pub net: A::Prefix,
    pub attributes: Arc<PathAttributeList<A>>,

    /// Set by the next-hop lookup stage from the resolver's answer.
    pub nexthop_resolved: bool,

    /// IGP distance to the next-hop, valid when `nexthop_resolved` is set.
    pub igp_metric: u32,
}

impl<A: Afi> SubnetRoute<A> {
    pub fn new(net: A::Prefix, attributes: Arc<PathAttributeList<A>>) -> Self {
        Self {
            net,
            attributes,
            nexthop_resolved: false,
            igp_metric: 0,
        }
    }

    pub fn nexthop(&self) -> A {
        self.attributes.nexthop
    }
}

/// A route in flight between pipeline stages, tagged with the branch it came
/// from and the session generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMessage<A: Afi> {
    pub route: SubnetRoute<A>,
    pub origin: PeerId,
    pub genid: GenId,
}

impl<A: Afi> InternalMessage<A> {
    pub fn new(route: SubnetRoute<A>, origin: PeerId, genid: GenId) -> Self {
        Self {
            route,
            origin,
            genid,
        }
    }

    pub fn net(&self) -> A::Prefix {
        self.route.net
    }

    pub fn attributes(&self) -> &PathAttributeList<A> {
        &self.route.attributes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOp<A: Afi> {
    Add(InternalMessage<A>),
    Delete(InternalMessage<A>),
    Replace {
        old: InternalMessage<A>,
        new: InternalMessage<A>,
    },

    /// End of a burst of changes from the given branch.
    Push(PeerId),
}

impl<A: Afi> RouteOp<A> {
    pub fn net(&self) -> Option<A::Prefix> {
        match self {
            RouteOp::Add(m) | RouteOp::Delete(m) => Some(m.net()),
            RouteOp::Replace { new, .. } => Some(new.net()),
            RouteOp::Push(_) => None,
        }
    }
}

/// What the pipeline knows about the far end of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo<A: Afi> {
    pub asn: u32,
    pub bgp_id: Ipv4Addr,
    pub ibgp: bool,

    /// Our side of the session, used when rewriting next-hops toward this
    /// peer.
    pub local_addr: Option<A>,
}
