// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("local configuration is already set")]
    AlreadyConfigured,

    #[error("local configuration has not been set")]
    NotConfigured,

    #[error("bgp error: {0}")]
    Bgp(#[from] bgp::error::Error),
}
