// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{
    post, BgpConnection, BgpConnector, BgpListener, ConnectionId,
    RouterEvent, SendStatus, TransportEvent,
};
use crate::error::Error;
use crate::log::connection_log;
use crate::messages::{AsPathWidth, Header, Message, MessageType};
use crate::IO_TIMEOUT;
use bgp_common::lock;
use rdb::PeerId;
use slog::{trace, warn, Logger};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::spawn;
use std::time::Duration;

const UNIT_CONNECTION: &str = "connection_tcp";

/// Queued frames above which a connection reports itself busy.
pub const TX_HIGH_WATER: usize = 32;

/// How long an outbound connect may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Map IPv4-mapped IPv6 addresses back to IPv4.
fn canonical(mut sa: SocketAddr) -> SocketAddr {
    if let SocketAddr::V6(v6) = sa {
        if let Some(v4) = v6.ip().to_ipv4_mapped() {
            sa.set_ip(v4.into());
        }
    }
    sa
}

#[derive(Default)]
struct TxState {
    frames: VecDeque<Vec<u8>>,
    busy: bool,
    notify_drained: bool,
    closed: bool,
}

#[derive(Default)]
struct TxQueue {
    state: Mutex<TxState>,
    cv: Condvar,
}

pub struct BgpConnectionTcp {
    id: ConnectionId,
    stream: TcpStream,
    tx: Arc<TxQueue>,
    reader_stop: Arc<AtomicBool>,
    log: Logger,
}

impl BgpConnectionTcp {
    fn with_stream(
        stream: TcpStream,
        events: Sender<RouterEvent<Self>>,
        log: Logger,
    ) -> Result<Self, Error> {
        let local = canonical(stream.local_addr()?);
        let peer = canonical(stream.peer_addr()?);
        let id = ConnectionId::new(local, peer);
        stream.set_nodelay(true)?;

        let tx = Arc::new(TxQueue::default());
        let reader_stop = Arc::new(AtomicBool::new(false));

        Self::spawn_reader(
            id,
            stream.try_clone()?,
            events.clone(),
            reader_stop.clone(),
            log.clone(),
        )?;
        Self::spawn_writer(id, stream.try_clone()?, events, tx.clone(), log.clone());

        Ok(Self {
            id,
            stream,
            tx,
            reader_stop,
            log,
        })
    }

    fn spawn_reader(
        id: ConnectionId,
        mut stream: TcpStream,
        events: Sender<RouterEvent<Self>>,
        stop: Arc<AtomicBool>,
        log: Logger,
    ) -> Result<(), Error> {
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        spawn(move || loop {
            let event = match Self::recv_frame(&mut stream, &stop) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    trace!(log, "[{id}] read: {e}");
                    TransportEvent::Closed
                }
            };
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let last = !matches!(event, TransportEvent::Frame { .. });
            if !post(&events, id, event) || last {
                break;
            }
        });
        Ok(())
    }

    /// Read exactly `buf.len()` bytes. Returns false if the reader was
    /// stopped first.
    fn read_full(
        stream: &mut TcpStream,
        buf: &mut [u8],
        stop: &AtomicBool,
    ) -> std::io::Result<bool> {
        let mut i = 0;
        while i < buf.len() {
            if stop.load(Ordering::Relaxed) {
                return Ok(false);
            }
            match stream.read(&mut buf[i..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ))
                }
                Ok(n) => i += n,
                // The read timeout set on the stream was hit. Go back around
                // and check whether we are shutting down.
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::TimedOut => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn recv_frame(
        stream: &mut TcpStream,
        stop: &AtomicBool,
    ) -> std::io::Result<Option<TransportEvent>> {
        let mut hbuf = [0u8; Header::WIRE_SIZE];
        if !Self::read_full(stream, &mut hbuf, stop)? {
            return Ok(None);
        }
        let header = match Header::from_wire(&hbuf) {
            Ok(h) => h,
            Err(e) => return Ok(Some(TransportEvent::Corrupt(e))),
        };
        let mut body = vec![0u8; usize::from(header.length) - Header::WIRE_SIZE];
        if !Self::read_full(stream, &mut body, stop)? {
            return Ok(None);
        }
        Ok(Some(TransportEvent::Frame {
            typ: header.typ,
            body,
        }))
    }

    fn spawn_writer(
        id: ConnectionId,
        mut stream: TcpStream,
        events: Sender<RouterEvent<Self>>,
        tx: Arc<TxQueue>,
        log: Logger,
    ) {
        spawn(move || loop {
            let frame = {
                let mut s = lock!(tx.state);
                loop {
                    if let Some(f) = s.frames.pop_front() {
                        break Some(f);
                    }
                    if s.closed {
                        break None;
                    }
                    if s.busy || s.notify_drained {
                        s.busy = false;
                        s.notify_drained = false;
                        post(&events, id, TransportEvent::Drained);
                        continue;
                    }
                    s = tx.cv.wait(s).expect("tx queue lock poisoned");
                }
            };
            let Some(frame) = frame else {
                break;
            };
            if let Err(e) = stream.write_all(&frame) {
                warn!(log, "[{id}] write: {e}");
                lock!(tx.state).closed = true;
                post(&events, id, TransportEvent::Closed);
                break;
            }
        });
    }

    pub fn connect(
        addr: SocketAddr,
        local: Option<SocketAddr>,
        timeout: Duration,
        events: Sender<RouterEvent<Self>>,
        log: Logger,
    ) -> Result<Self, Error> {
        let socket =
            Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(local) = local {
            socket.set_reuse_address(true)?;
            socket.bind(&SockAddr::from(SocketAddr::new(local.ip(), 0)))?;
        }
        socket.connect_timeout(&SockAddr::from(addr), timeout)?;
        Self::with_stream(socket.into(), events, log)
    }
}

impl BgpConnection for BgpConnectionTcp {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(
        &mut self,
        msg: &Message,
        width: AsPathWidth,
    ) -> Result<SendStatus, Error> {
        let frame = msg.to_frame(width)?;
        let mut s = lock!(self.tx.state);
        if s.closed {
            return Err(Error::NotConnected);
        }
        connection_log!(self, trace, "send {}", msg.title();
            "message" => format!("{msg}")
        );
        s.frames.push_back(frame);
        self.tx.cv.notify_one();
        if s.frames.len() > TX_HIGH_WATER {
            s.busy = true;
        }
        Ok(if s.busy {
            SendStatus::Queued
        } else {
            SendStatus::Sent
        })
    }

    fn is_busy(&self) -> bool {
        lock!(self.tx.state).busy
    }

    fn flush_transmit_queue(&mut self) {
        let mut s = lock!(self.tx.state);
        let before = s.frames.len();
        s.frames.retain(|f| {
            f.get(Header::WIRE_SIZE - 1) == Some(&(MessageType::Notification as u8))
        });
        s.notify_drained = true;
        self.tx.cv.notify_one();
        connection_log!(self, debug, "flushed transmit queue";
            "dropped" => before - s.frames.len()
        );
    }

    fn stop_reader(&mut self) {
        self.reader_stop.store(true, Ordering::Relaxed);
    }

    fn disconnect(&mut self) {
        self.reader_stop.store(true, Ordering::Relaxed);
        {
            let mut s = lock!(self.tx.state);
            s.closed = true;
            s.frames.clear();
        }
        self.tx.cv.notify_one();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!(self.log, "[{}] shutdown: {e}", self.id);
        }
        connection_log!(self, info, "disconnected");
    }
}

impl Drop for BgpConnectionTcp {
    fn drop(&mut self) {
        self.reader_stop.store(true, Ordering::Relaxed);
        lock!(self.tx.state).closed = true;
        self.tx.cv.notify_one();
    }
}

/// Outbound connections over TCP, one thread per attempt.
pub struct BgpConnectorTcp {
    pub timeout: Duration,
    pub log: Logger,
}

impl BgpConnectorTcp {
    pub fn new(log: Logger) -> Self {
        Self {
            timeout: CONNECT_TIMEOUT,
            log,
        }
    }
}

impl BgpConnector<BgpConnectionTcp> for BgpConnectorTcp {
    fn connect(
        &self,
        peer: PeerId,
        addr: SocketAddr,
        local: Option<SocketAddr>,
        events: Sender<RouterEvent<BgpConnectionTcp>>,
    ) {
        let timeout = self.timeout;
        let log = self.log.clone();
        spawn(move || {
            let event = match BgpConnectionTcp::connect(
                addr,
                local,
                timeout,
                events.clone(),
                log.clone(),
            ) {
                Ok(cnx) => RouterEvent::Connected { peer, cnx },
                Err(e) => RouterEvent::ConnectFailed {
                    peer,
                    reason: e.to_string(),
                },
            };
            if events.send(event).is_err() {
                warn!(log, "connect to {addr}: router gone");
            }
        });
    }
}

pub struct BgpListenerTcp {
    addr: SocketAddr,
    listener: TcpListener,
    log: Logger,
}

impl BgpListenerTcp {
    pub fn bind(addr: SocketAddr, log: Logger) -> Result<Self, Error> {
        let socket =
            Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        Ok(Self {
            addr,
            listener,
            log,
        })
    }
}

impl BgpListener<BgpConnectionTcp> for BgpListenerTcp {
    fn accept(
        &self,
        events: Sender<RouterEvent<BgpConnectionTcp>>,
    ) -> Result<Option<BgpConnectionTcp>, Error> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(BgpConnectionTcp::with_stream(
                    stream,
                    events,
                    self.log.clone(),
                )?))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(IO_TIMEOUT);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn local(&self) -> SocketAddr {
        self.addr
    }
}
