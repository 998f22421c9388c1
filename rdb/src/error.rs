// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::PeerId;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unknown peering {0}")]
    UnknownPeer(PeerId),

    #[error("peering {0} already plumbed")]
    PeerExists(PeerId),

    #[error("peering {0} is up")]
    PeerUp(PeerId),

    #[error("peering {0} is down")]
    PeerDown(PeerId),

    #[error("invalid route: {0}")]
    InvalidRoute(String),
}
