// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// This file contains code for testing purposes only. Note that it's only
/// included in `lib.rs` with a `#[cfg(test)]` guard. The purpose of the
/// code in this file is to implement BgpListener, BgpConnector and
/// BgpConnection such that routers may be tested against each other rapidly
/// using a simulated network. Frames are encoded and decoded exactly as
/// they would be on TCP.
use crate::{
    connection::{
        frame_event, post, BgpConnection, BgpConnector, BgpListener,
        ConnectionId, RouterEvent, SendStatus, TransportEvent,
    },
    error::Error,
    log::connection_log,
    messages::{AsPathWidth, Message},
    IO_TIMEOUT,
};
use bgp_common::lock;
use rdb::PeerId;
use slog::Logger;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::spawn,
};

const UNIT_CONNECTION: &str = "connection_channel";

lazy_static! {
    static ref NET: Network = Network::new();
}

type Frame = Vec<u8>;

/// A simulated network that maps socket addresses to channels that can send
/// connection requests to listeners for those addresses.
pub struct Network {
    #[allow(clippy::type_complexity)]
    endpoints: Mutex<HashMap<SocketAddr, Sender<(SocketAddr, Endpoint<Frame>)>>>,
}

// NOTE: this is not designed to be a full fidelity TCP/IP drop in. It gives
// us enough functionality to pass messages between BGP routers to test
// state machine transitions above TCP connection tracking. That's all we're
// aiming for with this.
impl Network {
    fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn bind(&self, sa: SocketAddr) -> Receiver<(SocketAddr, Endpoint<Frame>)> {
        let (tx, rx) = mpsc::channel();
        lock!(self.endpoints).insert(sa, tx);
        rx
    }

    fn unbind(&self, sa: &SocketAddr) {
        lock!(self.endpoints).remove(sa);
    }

    /// Send the far end of a new bidirectional channel to the listener at
    /// `to`, along with our `from` address.
    fn connect(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        ep: Endpoint<Frame>,
    ) -> Result<(), Error> {
        match lock!(self.endpoints).get(&to) {
            None => Err(Error::ChannelConnect),
            Some(sender) => sender
                .send((from, ep))
                .map_err(|e| Error::ChannelSend(e.to_string())),
        }
    }
}

pub struct BgpListenerChannel {
    addr: SocketAddr,
    rx: Receiver<(SocketAddr, Endpoint<Frame>)>,
    log: Logger,
}

impl BgpListenerChannel {
    pub fn bind(addr: SocketAddr, log: Logger) -> Self {
        Self {
            addr,
            rx: NET.bind(addr),
            log,
        }
    }
}

impl Drop for BgpListenerChannel {
    fn drop(&mut self) {
        NET.unbind(&self.addr);
    }
}

impl BgpListener<BgpConnectionChannel> for BgpListenerChannel {
    fn accept(
        &self,
        events: Sender<RouterEvent<BgpConnectionChannel>>,
    ) -> Result<Option<BgpConnectionChannel>, Error> {
        match self.rx.recv_timeout(IO_TIMEOUT) {
            Ok((peer, ep)) => Ok(Some(BgpConnectionChannel::with_endpoint(
                self.addr,
                peer,
                ep,
                events,
                self.log.clone(),
            ))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    fn local(&self) -> SocketAddr {
        self.addr
    }
}

pub struct BgpConnectionChannel {
    id: ConnectionId,
    tx: Option<Sender<Frame>>,
    events: Sender<RouterEvent<BgpConnectionChannel>>,
    reader_stop: Arc<AtomicBool>,
    log: Logger,
}

impl BgpConnectionChannel {
    fn with_endpoint(
        local: SocketAddr,
        peer: SocketAddr,
        ep: Endpoint<Frame>,
        events: Sender<RouterEvent<Self>>,
        log: Logger,
    ) -> Self {
        let id = ConnectionId::new(local, peer);
        let reader_stop = Arc::new(AtomicBool::new(false));
        Self::spawn_reader(id, ep.rx, events.clone(), reader_stop.clone());
        Self {
            id,
            tx: Some(ep.tx),
            events,
            reader_stop,
            log,
        }
    }

    fn spawn_reader(
        id: ConnectionId,
        rx: Receiver<Frame>,
        events: Sender<RouterEvent<Self>>,
        stop: Arc<AtomicBool>,
    ) {
        spawn(move || loop {
            let event = match rx.recv_timeout(IO_TIMEOUT) {
                Ok(frame) => frame_event(&frame),
                Err(RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => TransportEvent::Closed,
            };
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let last = !matches!(event, TransportEvent::Frame { .. });
            if !post(&events, id, event) || last {
                break;
            }
        });
    }
}

impl BgpConnection for BgpConnectionChannel {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(
        &mut self,
        msg: &Message,
        width: AsPathWidth,
    ) -> Result<SendStatus, Error> {
        let frame = msg.to_frame(width)?;
        let tx = self.tx.as_ref().ok_or(Error::NotConnected)?;
        connection_log!(self, trace, "send {}", msg.title();
            "message" => format!("{msg}")
        );
        tx.send(frame)
            .map_err(|e| Error::ChannelSend(e.to_string()))?;
        Ok(SendStatus::Sent)
    }

    fn is_busy(&self) -> bool {
        false
    }

    /// Frames are delivered as soon as they are sent, so the queue is
    /// always already empty.
    fn flush_transmit_queue(&mut self) {
        post(&self.events, self.id, TransportEvent::Drained);
    }

    fn stop_reader(&mut self) {
        self.reader_stop.store(true, Ordering::Relaxed);
    }

    fn disconnect(&mut self) {
        self.reader_stop.store(true, Ordering::Relaxed);
        if self.tx.take().is_some() {
            connection_log!(self, info, "disconnected");
        }
    }
}

impl Drop for BgpConnectionChannel {
    fn drop(&mut self) {
        self.reader_stop.store(true, Ordering::Relaxed);
    }
}

pub struct BgpConnectorChannel {
    pub log: Logger,
}

impl BgpConnector<BgpConnectionChannel> for BgpConnectorChannel {
    fn connect(
        &self,
        peer: PeerId,
        addr: SocketAddr,
        local: Option<SocketAddr>,
        events: Sender<RouterEvent<BgpConnectionChannel>>,
    ) {
        let log = self.log.clone();
        spawn(move || {
            let from = match local {
                Some(sa) => sa,
                None => {
                    let _ = events.send(RouterEvent::ConnectFailed {
                        peer,
                        reason: "channel connections need a source".into(),
                    });
                    return;
                }
            };
            let (near, far) = channel();
            let event = match NET.connect(from, addr, far) {
                Ok(()) => RouterEvent::Connected {
                    peer,
                    cnx: BgpConnectionChannel::with_endpoint(
                        from,
                        addr,
                        near,
                        events.clone(),
                        log,
                    ),
                },
                Err(e) => RouterEvent::ConnectFailed {
                    peer,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }
}

/// A combined mpsc sender/receiver.
pub struct Endpoint<T> {
    pub rx: Receiver<T>,
    pub tx: Sender<T>,
}

impl<T> Endpoint<T> {
    fn new(rx: Receiver<T>, tx: Sender<T>) -> Self {
        Self { rx, tx }
    }
}

/// Analogous to std::sync::mpsc::channel for bidirectional endpoints.
pub fn channel<T>() -> (Endpoint<T>, Endpoint<T>) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    (Endpoint::new(rx_a, tx_a), Endpoint::new(rx_b, tx_b))
}
