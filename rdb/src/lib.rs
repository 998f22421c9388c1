// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The BGP route table pipeline.
//!
//! Routes received from peers flow through a chain of table stages, one
//! branch per peer, into a decision stage that picks a single winner per
//! prefix. Winners are installed through a [`rib::RibClient`] and fanned out
//! to every established peer. Next-hop reachability is resolved
//! asynchronously by the [`resolver::NextHopResolver`].

pub mod attributes;
pub mod bestpath;
pub mod cache;
pub mod decision;
pub mod deletion;
pub mod dump;
pub mod error;
pub mod fanout;
pub mod filter;
pub mod log;
pub mod nhlookup;
pub mod plumbing;
pub mod resolver;
pub mod rib;
pub mod ribin;
pub mod ribout;
pub mod table;
pub mod types;

pub use plumbing::{BgpPlumbing, LocalConfig, Plumbing};
pub use types::*;

#[cfg(test)]
mod proptest;

#[cfg(test)]
mod test;

pub const COMPONENT_RDB: &str = "rdb";
pub const MOD_PIPELINE: &str = "pipeline";
pub const MOD_RESOLVER: &str = "nexthop resolver";
