// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transport seam between sessions and the network. A connection owns
//! whatever threads move bytes, and reports everything it learns to the
//! router's event loop as [`RouterEvent`]s.

use crate::error::{CorruptMessage, Error};
use crate::messages::{AsPathWidth, Message, MessageType};
use rdb::PeerId;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;

/// Global counter for assigning connection serials.
static CONNECTION_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Identifies one transport connection for its whole lifetime. Events that
/// carry the id of a connection a session no longer holds are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    pub serial: u64,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

impl ConnectionId {
    pub fn new(local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            serial: CONNECTION_SERIAL.fetch_add(1, Ordering::Relaxed),
            local,
            peer,
        }
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.serial, self.local, self.peer)
    }
}

/// Outcome of handing a message to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted, and the connection can take more.
    Sent,

    /// Accepted, but the transmit queue is over its high-water mark. A
    /// `Drained` event follows once it empties.
    Queued,
}

/// What a connection reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message with a well-formed header. The body is decoded by the
    /// session, which knows the negotiated AS number width.
    Frame { typ: MessageType, body: Vec<u8> },

    /// The byte stream cannot be made sense of.
    Corrupt(CorruptMessage),

    /// The peer closed the connection, or reading from it failed.
    Closed,

    /// The transmit queue emptied after being busy or flushed.
    Drained,
}

impl TransportEvent {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Frame { .. } => "frame",
            Self::Corrupt(_) => "corrupt",
            Self::Closed => "closed",
            Self::Drained => "drained",
        }
    }
}

/// Everything the router's event loop is told by the threads that do I/O.
pub enum RouterEvent<Cnx: BgpConnection> {
    /// An inbound connection. The router routes it to the session that
    /// matches the remote address.
    Accepted(Cnx),

    /// An outbound connection attempt for `peer` succeeded.
    Connected { peer: PeerId, cnx: Cnx },

    /// An outbound connection attempt for `peer` failed.
    ConnectFailed { peer: PeerId, reason: String },

    Transport {
        id: ConnectionId,
        event: TransportEvent,
    },
}

impl<Cnx: BgpConnection> RouterEvent<Cnx> {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Accepted(_) => "accepted",
            Self::Connected { .. } => "connected",
            Self::ConnectFailed { .. } => "connect failed",
            Self::Transport { event, .. } => event.title(),
        }
    }
}

/// A live transport connection to a peer.
pub trait BgpConnection: Send + 'static {
    fn id(&self) -> ConnectionId;

    fn peer(&self) -> SocketAddr {
        self.id().peer
    }

    fn local(&self) -> SocketAddr {
        self.id().local
    }

    /// Encode and queue a message.
    fn send(
        &mut self,
        msg: &Message,
        width: AsPathWidth,
    ) -> Result<SendStatus, Error>;

    fn is_busy(&self) -> bool;

    /// Drop everything queued except notifications. A `Drained` event is
    /// posted once what is left has been written.
    fn flush_transmit_queue(&mut self);

    /// Stop delivering received messages.
    fn stop_reader(&mut self);

    /// Tear the connection down. No further events are posted.
    fn disconnect(&mut self);
}

/// Makes outbound connections. Attempts run in the background and report
/// through `events`.
pub trait BgpConnector<Cnx: BgpConnection>: Send {
    fn connect(
        &self,
        peer: PeerId,
        addr: SocketAddr,
        local: Option<SocketAddr>,
        events: Sender<RouterEvent<Cnx>>,
    );
}

/// Accepts inbound connections.
pub trait BgpListener<Cnx: BgpConnection> {
    fn accept(
        &self,
        events: Sender<RouterEvent<Cnx>>,
    ) -> Result<Option<Cnx>, Error>;

    fn local(&self) -> SocketAddr;
}

/// Post a transport event for connection `id`. Returns false when the
/// router has gone away.
pub(crate) fn post<Cnx: BgpConnection>(
    events: &Sender<RouterEvent<Cnx>>,
    id: ConnectionId,
    event: TransportEvent,
) -> bool {
    events.send(RouterEvent::Transport { id, event }).is_ok()
}

/// Check the header of a complete frame and wrap it as an event.
pub fn frame_event(frame: &[u8]) -> TransportEvent {
    match crate::messages::Header::from_wire(frame) {
        Ok(h) if usize::from(h.length) == frame.len() => TransportEvent::Frame {
            typ: h.typ,
            body: frame[crate::messages::Header::WIRE_SIZE..].to_vec(),
        },
        Ok(h) => TransportEvent::Corrupt(CorruptMessage::new(
            crate::messages::HeaderErrorSubcode::BadMessageLength,
            h.length.to_be_bytes().to_vec(),
            format!("header length {} in frame of {}", h.length, frame.len()),
        )),
        Err(e) => TransportEvent::Corrupt(e),
    }
}
