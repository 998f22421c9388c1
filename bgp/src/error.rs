// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::messages::{
    ErrorCode, ErrorSubcode, MessageType, NotificationMessage,
};
use crate::session::FsmStateKind;
use num_enum::TryFromPrimitiveError;
use std::{fmt::Display, net::IpAddr};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("too large: {0}")]
    TooLarge(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("channel send: {0}")]
    ChannelSend(String),

    #[error("Channel connect error")]
    ChannelConnect,

    #[error("Attempt to send a message when not connected")]
    NotConnected,

    #[error("corrupt message: {0}")]
    Corrupt(CorruptMessage),

    #[error("message parse error")]
    Parse(nom::Err<(Vec<u8>, nom::error::ErrorKind)>),

    #[error("Message type error")]
    MessageType(#[from] TryFromPrimitiveError<MessageType>),

    #[error("Error code")]
    ErrorCode(#[from] TryFromPrimitiveError<ErrorCode>),

    #[error("Header error subcode")]
    HeaderSubcode(
        #[from] TryFromPrimitiveError<crate::messages::HeaderErrorSubcode>,
    ),

    #[error("Open error subcode")]
    OpenSubcode(
        #[from] TryFromPrimitiveError<crate::messages::OpenErrorSubcode>,
    ),

    #[error("Update error subcode")]
    UpdateSubcode(
        #[from] TryFromPrimitiveError<crate::messages::UpdateErrorSubcode>,
    ),

    #[error("Cease error subcode")]
    CeaseSubcode(
        #[from] TryFromPrimitiveError<crate::messages::CeaseErrorSubcode>,
    ),

    #[error("invalid notification code {0} subcode {1}")]
    InvalidNotification(u8, u8),

    #[error("event {event} is impossible in state {state}")]
    InvalidTransition {
        state: FsmStateKind,
        event: String,
    },

    #[error("unknown peer {0}")]
    UnknownPeer(IpAddr),

    #[error("Session for peer {0} already exists")]
    PeerExists(IpAddr),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Datastore error: {0}")]
    Datastore(#[from] rdb::error::Error),

    #[error("Unexpected ASN: {0}")]
    UnexpectedAsn(ExpectationMismatch<u32>),

    #[error("Failed to send event: {0}")]
    EventSend(String),
}

/// A received message that cannot be accepted, together with the
/// NOTIFICATION that reports it to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptMessage {
    pub error_code: ErrorCode,
    pub error_subcode: ErrorSubcode,
    pub data: Vec<u8>,
    pub reason: String,
}

impl CorruptMessage {
    pub fn new(
        error_subcode: impl Into<ErrorSubcode>,
        data: Vec<u8>,
        reason: impl Into<String>,
    ) -> Self {
        let error_subcode = error_subcode.into();
        Self {
            error_code: error_subcode.error_code(),
            error_subcode,
            data,
            reason: reason.into(),
        }
    }

    pub fn notification(&self) -> NotificationMessage {
        NotificationMessage {
            error_code: self.error_code,
            error_subcode: self.error_subcode,
            data: self.data.clone(),
        }
    }
}

impl Display for CorruptMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.error_subcode)
    }
}

impl From<CorruptMessage> for Error {
    fn from(e: CorruptMessage) -> Error {
        Error::Corrupt(e)
    }
}

#[derive(Debug)]
pub struct ExpectationMismatch<T: Display> {
    pub expected: T,
    pub got: T,
}

impl<T: Display> Display for ExpectationMismatch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected: {} got: {}", self.expected, self.got)
    }
}

impl<'a> From<nom::Err<(&'a [u8], nom::error::ErrorKind)>> for Error {
    fn from(e: nom::Err<(&'a [u8], nom::error::ErrorKind)>) -> Error {
        Error::Parse(e.to_owned())
    }
}
