// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-peer BGP finite state machine.
//!
//! A [`SessionRunner`] owns the transport connection of one peering and
//! reacts to [`FsmEvent`]s. It does no I/O of its own beyond handing
//! messages to its connection: the router feeds it transport events, timer
//! expiries and administrative commands one at a time.

use crate::clock::{jittered, SessionClock, TimerKind, LARGE_HOLD_INTERVAL};
use crate::config::{PeerConfig, RouterConfig};
use crate::connection::{
    BgpConnection, BgpConnector, ConnectionId, RouterEvent, SendStatus,
    TransportEvent,
};
use crate::error::{CorruptMessage, Error};
use crate::log::session_log;
use crate::messages::{
    AsPathWidth, Capability, CeaseErrorSubcode, ErrorSubcode, Message,
    MessageType, NotificationMessage, OpenErrorSubcode, OpenMessage,
    UpdateMessage, AFI_IPV4, AFI_IPV6, SAFI_UNICAST,
};
use crate::peer_handler::{Negotiated, PeerHandler};
use crate::validation::{check_open, check_update, negotiate_hold};
use chrono::{DateTime, Utc};
use rdb::{BgpPlumbing, PeerId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::fmt::{self, Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::mpsc::Sender;
use std::time::Duration;

const UNIT_SESSION_RUNNER: &str = "session_runner";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum FsmStateKind {
    /// Refuse all incoming connections. No resources allocated to the peer.
    Idle,

    /// Waiting for an outbound connection attempt to complete.
    Connect,

    /// Waiting for the peer to connect, or for the connect retry timer.
    Active,

    /// Our OPEN is sent, waiting for the peer's.
    OpenSent,

    /// OPENs exchanged, waiting for the first KEEPALIVE.
    OpenConfirm,

    /// Able to exchange UPDATE, NOTIFICATION and KEEPALIVE messages.
    Established,

    /// A NOTIFICATION is queued and the session waits for it to be written
    /// before the connection is torn down. Nothing received is acted on.
    Stopped,
}

impl FsmStateKind {
    /// States in which the session holds a transport connection.
    pub fn has_transport(&self) -> bool {
        matches!(
            self,
            Self::OpenSent | Self::OpenConfirm | Self::Established | Self::Stopped
        )
    }
}

impl Display for FsmStateKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            FsmStateKind::Idle => write!(f, "idle"),
            FsmStateKind::Connect => write!(f, "connect"),
            FsmStateKind::Active => write!(f, "active"),
            FsmStateKind::OpenSent => write!(f, "open sent"),
            FsmStateKind::OpenConfirm => write!(f, "open confirm"),
            FsmStateKind::Established => write!(f, "established"),
            FsmStateKind::Stopped => write!(f, "stopped"),
        }
    }
}

pub enum FsmEvent<Cnx: BgpConnection> {
    /// Administrative start, or the automatic restart after an error.
    Start,

    /// Administrative stop.
    Stop,

    /// A transport connection to the peer is up, in either direction.
    TransportOpened(Cnx),

    TransportClosed,

    /// The received byte stream is broken beyond recovery.
    TransportFatal(CorruptMessage),

    ConnectFailed,

    ConnectRetryTimerExpires,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    StoppedTimerExpires,

    /// The connection's transmit queue drained.
    TransmitComplete,

    Message(Message),
}

impl<Cnx: BgpConnection> FsmEvent<Cnx> {
    pub fn title(&self) -> String {
        match self {
            Self::Start => "start".into(),
            Self::Stop => "stop".into(),
            Self::TransportOpened(_) => "transport opened".into(),
            Self::TransportClosed => "transport closed".into(),
            Self::TransportFatal(_) => "transport fatal".into(),
            Self::ConnectFailed => "connect failed".into(),
            Self::ConnectRetryTimerExpires => "connect retry timer".into(),
            Self::HoldTimerExpires => "hold timer".into(),
            Self::KeepaliveTimerExpires => "keepalive timer".into(),
            Self::StoppedTimerExpires => "stopped timer".into(),
            Self::TransmitComplete => "transmit complete".into(),
            Self::Message(m) => format!("{} message", m.title()),
        }
    }
}

/// The most recent error that brought the session down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LastError {
    pub code: u8,
    pub subcode: u8,

    /// True if the peer sent the notification, false if we did.
    pub received: bool,
    pub time: DateTime<Utc>,
    pub reason: String,
}

/// What a session borrows from its router while handling an event.
pub struct SessionContext<'a, Cnx: BgpConnection> {
    pub plumbing: &'a mut BgpPlumbing,
    pub connector: &'a dyn BgpConnector<Cnx>,
    pub events: &'a Sender<RouterEvent<Cnx>>,
    pub local: RouterConfig,
}

pub struct SessionRunner<Cnx: BgpConnection> {
    pub id: PeerId,
    pub config: PeerConfig,
    pub clock: SessionClock,

    state: FsmStateKind,

    /// Present exactly when the state has a transport.
    cnx: Option<Cnx>,
    handler: PeerHandler,
    negotiated: Option<Negotiated>,
    last_error: Option<LastError>,

    /// Set when the peer refused our capabilities. Later OPENs carry none.
    omit_capabilities: bool,
    enabled: bool,

    /// Whether the pipeline has been told the peering is up.
    up: bool,

    /// Whether to start again once the stopped state is left.
    restart: bool,
    log: Logger,
}

impl<Cnx: BgpConnection> SessionRunner<Cnx> {
    pub fn new(id: PeerId, config: PeerConfig, log: Logger) -> Self {
        let connect_retry = Duration::from_secs(config.connect_retry);
        Self {
            id,
            clock: SessionClock::new(connect_retry),
            handler: PeerHandler::new(id, config.prefix_limit, log.clone()),
            enabled: config.enabled,
            config,
            state: FsmStateKind::Idle,
            cnx: None,
            negotiated: None,
            last_error: None,
            omit_capabilities: false,
            up: false,
            restart: false,
            log,
        }
    }

    pub fn state(&self) -> FsmStateKind {
        self.state
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.cnx.as_ref().map(|c| c.id())
    }

    /// Whether a newly opened transport would be taken. Once a connection
    /// has progressed past the connect states any other one is refused.
    pub fn accepts_connection(&self) -> bool {
        matches!(self.state, FsmStateKind::Connect | FsmStateKind::Active)
    }

    fn width(&self) -> AsPathWidth {
        self.negotiated
            .as_ref()
            .map(|n| n.width)
            .unwrap_or_default()
    }

    fn transition(&mut self, to: FsmStateKind) {
        if self.state != to {
            session_log!(self, info, "{} -> {}", self.state, to);
            self.state = to;
        }
    }

    fn invalid(&self, event: &FsmEvent<Cnx>) -> Error {
        Error::InvalidTransition {
            state: self.state,
            event: event.title(),
        }
    }

    /// Turn something a connection reported into an FSM event and handle
    /// it.
    pub fn transport(
        &mut self,
        event: TransportEvent,
        cx: &mut SessionContext<'_, Cnx>,
    ) -> Result<(), Error> {
        let event = match event {
            TransportEvent::Frame { typ, body } => {
                match Message::from_wire(typ, &body, self.width()) {
                    Ok(m) => FsmEvent::Message(m),
                    // A notification that cannot be understood still ends
                    // the session.
                    Err(e) if typ == MessageType::Notification => {
                        session_log!(self, warn, "malformed notification: {e}");
                        FsmEvent::Message(Message::Notification(
                            NotificationMessage::malformed(),
                        ))
                    }
                    Err(e) => FsmEvent::TransportFatal(e),
                }
            }
            TransportEvent::Corrupt(e) => FsmEvent::TransportFatal(e),
            TransportEvent::Closed => FsmEvent::TransportClosed,
            TransportEvent::Drained => FsmEvent::TransmitComplete,
        };
        self.handle(event, cx)
    }

    /// Advance the session's timers and handle whatever fired. Once one
    /// expiry has changed the state the rest are dropped.
    pub fn tick(
        &mut self,
        elapsed: Duration,
        cx: &mut SessionContext<'_, Cnx>,
    ) -> Result<(), Error> {
        let state = self.state;
        for kind in self.clock.tick(elapsed) {
            if self.state != state {
                break;
            }
            let event = match kind {
                TimerKind::ConnectRetry => FsmEvent::ConnectRetryTimerExpires,
                TimerKind::Hold => FsmEvent::HoldTimerExpires,
                TimerKind::Keepalive => FsmEvent::KeepaliveTimerExpires,
                TimerKind::Stopped => FsmEvent::StoppedTimerExpires,
            };
            self.handle(event, cx)?;
        }
        Ok(())
    }

    pub fn handle(
        &mut self,
        event: FsmEvent<Cnx>,
        cx: &mut SessionContext<'_, Cnx>,
    ) -> Result<(), Error> {
        use FsmStateKind::*;
        session_log!(self, debug, "event {}", event.title());

        match event {
            FsmEvent::Start => {
                self.enabled = true;
                if self.state == Idle {
                    self.start(cx);
                }
                Ok(())
            }

            FsmEvent::Stop => {
                self.enabled = false;
                match self.state {
                    Idle => Ok(()),
                    Connect | Active | Stopped => {
                        self.enter_idle(false, cx);
                        Ok(())
                    }
                    OpenSent | OpenConfirm | Established => self.enter_stopped(
                        false,
                        NotificationMessage::cease(
                            CeaseErrorSubcode::AdministrativeShutdown,
                        ),
                        "administrative stop",
                        cx,
                    ),
                }
            }

            FsmEvent::TransportOpened(cnx) => {
                if !self.accepts_connection() {
                    let err = Error::InvalidTransition {
                        state: self.state,
                        event: "transport opened".into(),
                    };
                    let mut cnx = cnx;
                    cnx.disconnect();
                    return Err(err);
                }
                self.cnx = Some(cnx);
                let open = self.open_message(cx.local);
                self.send(&Message::Open(open))?;
                self.clock.connect_retry.disable();
                self.clock.hold.set_interval(LARGE_HOLD_INTERVAL);
                self.transition(OpenSent);
                Ok(())
            }

            FsmEvent::TransportClosed => {
                match self.state {
                    OpenSent => {
                        if let Some(mut cnx) = self.cnx.take() {
                            cnx.disconnect();
                        }
                        self.clock.hold.disable();
                        self.clock.connect_retry.restart();
                        self.transition(Active);
                    }
                    OpenConfirm | Established => {
                        self.record_error(
                            &NotificationMessage::cease(
                                CeaseErrorSubcode::Unspecific,
                            ),
                            true,
                            "connection closed by peer",
                        );
                        self.enter_idle(true, cx);
                    }
                    Stopped => self.enter_idle(self.restart, cx),
                    Idle | Connect | Active => {}
                }
                Ok(())
            }

            FsmEvent::TransportFatal(corrupt) => match self.state {
                OpenSent | OpenConfirm | Established => self.enter_stopped(
                    true,
                    corrupt.notification(),
                    corrupt.reason,
                    cx,
                ),
                Stopped => {
                    self.enter_idle(self.restart, cx);
                    Ok(())
                }
                Idle | Connect | Active => Ok(()),
            },

            FsmEvent::ConnectFailed => {
                if self.state == Connect {
                    self.clock.connect_retry.restart();
                    self.transition(Active);
                }
                Ok(())
            }

            FsmEvent::ConnectRetryTimerExpires => match self.state {
                Connect => {
                    self.clock.connect_retry.restart();
                    self.connect(cx);
                    Ok(())
                }
                Active => {
                    self.clock.connect_retry.restart();
                    if !self.config.passive {
                        self.transition(Connect);
                        self.connect(cx);
                    }
                    Ok(())
                }
                OpenSent | OpenConfirm | Established => self.enter_stopped(
                    true,
                    NotificationMessage::fsm_error(),
                    "connect retry timer in a connected state",
                    cx,
                ),
                Idle | Stopped => Ok(()),
            },

            FsmEvent::HoldTimerExpires => match self.state {
                Connect | Active => {
                    self.enter_idle(true, cx);
                    Ok(())
                }
                OpenSent | OpenConfirm | Established => self.enter_stopped(
                    true,
                    NotificationMessage::hold_timer_expired(),
                    "hold timer expired",
                    cx,
                ),
                Idle | Stopped => Ok(()),
            },

            FsmEvent::KeepaliveTimerExpires => match self.state {
                OpenConfirm | Established => {
                    self.send(&Message::KeepAlive)?;
                    self.restart_keepalive();
                    Ok(())
                }
                _ => Err(self.invalid(&FsmEvent::KeepaliveTimerExpires)),
            },

            FsmEvent::StoppedTimerExpires => {
                if self.state == Stopped {
                    session_log!(self, warn, "notification did not drain");
                    self.enter_idle(self.restart, cx);
                }
                Ok(())
            }

            FsmEvent::TransmitComplete => match self.state {
                Stopped => {
                    self.enter_idle(self.restart, cx);
                    Ok(())
                }
                Established => {
                    cx.plumbing.set_busy(self.id, false);
                    self.send_updates(cx)
                }
                _ => Ok(()),
            },

            FsmEvent::Message(msg) => self.message(msg, cx),
        }
    }

    fn message(
        &mut self,
        msg: Message,
        cx: &mut SessionContext<'_, Cnx>,
    ) -> Result<(), Error> {
        use FsmStateKind::*;
        match (self.state, msg) {
            (Idle | Connect | Active | Stopped, m) => {
                session_log!(self, debug, "ignoring {}", m.title());
                Ok(())
            }
            (_, Message::Notification(n)) => {
                session_log!(self, warn, "notification received: {}",
                    n.error_subcode;
                    "data" => format!("{:x?}", n.data)
                );
                if n.error_subcode
                    == ErrorSubcode::Open(
                        OpenErrorSubcode::UnsupportedOptionalParameter,
                    )
                {
                    self.omit_capabilities = true;
                }
                let reason = n.error_subcode.to_string();
                self.record_error(&n, true, reason);
                self.enter_idle(true, cx);
                Ok(())
            }
            (OpenSent, Message::Open(open)) => self.open_received(open, cx),
            (OpenConfirm, Message::KeepAlive) => self.established(cx),
            (Established, Message::KeepAlive) => {
                self.clock.hold.restart();
                Ok(())
            }
            (Established, Message::Update(update)) => {
                self.update_received(update, cx)
            }
            (_, m) => self.enter_stopped(
                true,
                NotificationMessage::fsm_error(),
                format!("unexpected {} message", m.title()),
                cx,
            ),
        }
    }

    fn open_message(&self, local: RouterConfig) -> OpenMessage {
        let mut caps = Vec::new();
        if !self.omit_capabilities {
            caps.push(Capability::MultiprotocolExtensions {
                afi: AFI_IPV4,
                safi: SAFI_UNICAST,
            });
            if self.config.ipv6 {
                caps.push(Capability::MultiprotocolExtensions {
                    afi: AFI_IPV6,
                    safi: SAFI_UNICAST,
                });
            }
            caps.push(Capability::FourOctetAs { asn: local.asn });
        }
        OpenMessage::new(
            local.asn,
            self.config.hold_time,
            u32::from(local.id),
            caps,
        )
    }

    fn open_received(
        &mut self,
        open: OpenMessage,
        cx: &mut SessionContext<'_, Cnx>,
    ) -> Result<(), Error> {
        if let Err(e) = check_open(&open, self.config.asn) {
            return self.enter_stopped(true, e.notification(), e.reason, cx);
        }
        if open.id == 0 || open.id == u32::from(cx.local.id) {
            return self.enter_stopped(
                true,
                NotificationMessage::new(
                    OpenErrorSubcode::BadBgpIdentifier,
                    Vec::new(),
                ),
                format!("bgp identifier {}", Ipv4Addr::from(open.id)),
                cx,
            );
        }

        self.send(&Message::KeepAlive)?;

        let hold = negotiate_hold(open.hold_time, self.config.hold_time);
        if hold == 0 {
            self.clock.hold.set_interval(Duration::ZERO);
            self.clock.keepalive.set_interval(Duration::ZERO);
        } else {
            self.clock
                .hold
                .set_interval(Duration::from_secs(u64::from(hold)));
        }

        let families = open.families();
        let width = if !self.omit_capabilities && open.four_octet_asn().is_some()
        {
            AsPathWidth::Four
        } else {
            AsPathWidth::Two
        };
        let asn = open.peer_asn();
        let negotiated = Negotiated {
            asn,
            bgp_id: Ipv4Addr::from(open.id),
            ibgp: asn == cx.local.asn,
            hold_time: hold,
            width,
            ipv4: families.contains(&(AFI_IPV4, SAFI_UNICAST)),
            ipv6: self.config.ipv6
                && !self.omit_capabilities
                && families.contains(&(AFI_IPV6, SAFI_UNICAST)),
        };
        session_log!(self, info, "open from {} accepted", negotiated.bgp_id;
            "hold_time" => hold,
            "ibgp" => negotiated.ibgp,
            "ipv6" => negotiated.ipv6
        );
        self.negotiated = Some(negotiated);
        self.restart_keepalive();
        self.transition(FsmStateKind::OpenConfirm);
        Ok(())
    }

    fn restart_keepalive(&mut self) {
        let hold = self.negotiated.as_ref().map(|n| n.hold_time).unwrap_or(0);
        let interval = Duration::from_secs(u64::from(hold / 3));
        self.clock.keepalive.set_interval(jittered(interval));
    }

    fn established(
        &mut self,
        cx: &mut SessionContext<'_, Cnx>,
    ) -> Result<(), Error> {
        let Some(n) = self.negotiated.clone() else {
            return self.enter_stopped(
                true,
                NotificationMessage::fsm_error(),
                "no negotiated parameters",
                cx,
            );
        };
        let local = self.cnx.as_ref().map(|c| c.local().ip());
        cx.plumbing
            .peering_came_up(self.id, n.asn, n.bgp_id, n.ibgp, local)?;
        self.up = true;
        self.clock.hold.restart();
        self.transition(FsmStateKind::Established);
        self.send_updates(cx)
    }

    fn update_received(
        &mut self,
        update: UpdateMessage,
        cx: &mut SessionContext<'_, Cnx>,
    ) -> Result<(), Error> {
        self.clock.hold.restart();
        let Some(n) = self.negotiated.clone() else {
            return Ok(());
        };
        if let Err(e) = check_update(&update, n.asn, n.ibgp, n.width, &self.log)
        {
            return self.enter_stopped(true, e.notification(), e.reason, cx);
        }
        match self.handler.process_update(&update, &n, cx.plumbing)? {
            Some(cease) => {
                self.enter_stopped(true, cease, "prefix limit exceeded", cx)
            }
            None => self.send_updates(cx),
        }
    }

    /// Send whatever the pipeline has queued for this peer.
    pub fn send_updates(
        &mut self,
        cx: &mut SessionContext<'_, Cnx>,
    ) -> Result<(), Error> {
        if self.state != FsmStateKind::Established {
            return Ok(());
        }
        let busy = self.cnx.as_ref().map(|c| c.is_busy()).unwrap_or(true);
        if busy {
            return Ok(());
        }
        let Some(n) = self.negotiated.clone() else {
            return Ok(());
        };
        for update in self.handler.updates_to_send(&n, cx.plumbing) {
            if self.send(&Message::Update(update))? == Some(SendStatus::Queued)
            {
                cx.plumbing.set_busy(self.id, true);
            }
        }
        Ok(())
    }

    /// Hand a message to the connection. Failures to write are left for the
    /// connection to report as a closed transport, only a notification we
    /// should never have built is an error.
    fn send(&mut self, msg: &Message) -> Result<Option<SendStatus>, Error> {
        let width = self.width();
        let Some(cnx) = self.cnx.as_mut() else {
            return Ok(None);
        };
        match cnx.send(msg, width) {
            Ok(status) => Ok(Some(status)),
            Err(e @ Error::InvalidNotification(..)) => Err(e),
            Err(e) => {
                session_log!(self, warn, "sending {} failed: {e}", msg.title());
                Ok(None)
            }
        }
    }

    fn connect(&self, cx: &mut SessionContext<'_, Cnx>) {
        session_log!(self, debug, "connecting");
        cx.connector.connect(
            self.id,
            self.config.host,
            self.config.local_addr,
            cx.events.clone(),
        );
    }

    fn start(&mut self, cx: &mut SessionContext<'_, Cnx>) {
        self.clock.connect_retry.restart();
        if self.config.passive {
            self.transition(FsmStateKind::Active);
        } else {
            self.transition(FsmStateKind::Connect);
            self.connect(cx);
        }
    }

    fn record_error(
        &mut self,
        n: &NotificationMessage,
        received: bool,
        reason: impl Into<String>,
    ) {
        let (code, subcode) = n.codes();
        self.last_error = Some(LastError {
            code,
            subcode,
            received,
            time: Utc::now(),
            reason: reason.into(),
        });
    }

    fn went_down(&mut self, cx: &mut SessionContext<'_, Cnx>) {
        if !self.up {
            return;
        }
        self.up = false;
        if let Err(e) = cx.plumbing.peering_went_down(self.id) {
            session_log!(self, error, "peering down: {e}");
        }
    }

    /// Queue `notification`, stop listening to the peer and wait for the
    /// notification to drain.
    fn enter_stopped(
        &mut self,
        restart: bool,
        notification: NotificationMessage,
        reason: impl Into<String>,
        cx: &mut SessionContext<'_, Cnx>,
    ) -> Result<(), Error> {
        let reason = reason.into();
        session_log!(self, warn, "stopping: {reason}";
            "notification" => notification.error_subcode.to_string()
        );
        self.send(&Message::Notification(notification.clone()))?;
        self.record_error(&notification, false, reason);

        self.clock.stop_all();
        self.went_down(cx);
        if let Some(cnx) = self.cnx.as_mut() {
            cnx.flush_transmit_queue();
            cnx.stop_reader();
        }
        self.restart = restart;
        self.clock.stopped.restart();
        self.transition(FsmStateKind::Stopped);
        Ok(())
    }

    /// Release the connection. After an error an enabled session goes back
    /// to waiting for a connection, dialing out again once the connect retry
    /// timer fires.
    fn enter_idle(&mut self, restart: bool, cx: &mut SessionContext<'_, Cnx>) {
        self.clock.stop_all();
        self.went_down(cx);
        if let Some(mut cnx) = self.cnx.take() {
            cnx.disconnect();
        }
        self.negotiated = None;
        self.restart = false;
        self.transition(FsmStateKind::Idle);

        if restart && self.enabled {
            self.clock.connect_retry.restart();
            self.transition(FsmStateKind::Active);
        }
    }

    /// Tear everything down without telling the peer.
    pub fn shutdown(&mut self, cx: &mut SessionContext<'_, Cnx>) {
        self.enabled = false;
        self.enter_idle(false, cx);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::{
        AsPathSegment, PathAttributeValue, PathOrigin, UpdateErrorSubcode,
    };
    use pretty_assertions::assert_eq;
    use rdb::rib::StaticRib;
    use rdb::LocalConfig;
    use std::net::SocketAddr;
    use std::sync::mpsc::{channel, Receiver};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Wire {
        sent: Vec<Message>,
        busy: bool,
        flushed: bool,
        disconnected: bool,
    }

    struct MockConnection {
        id: ConnectionId,
        wire: Arc<Mutex<Wire>>,
    }

    impl MockConnection {
        fn new() -> (Self, Arc<Mutex<Wire>>) {
            let wire = Arc::new(Mutex::new(Wire::default()));
            let cnx = Self {
                id: ConnectionId::new(
                    "198.51.100.1:179".parse().unwrap(),
                    "198.51.100.2:179".parse().unwrap(),
                ),
                wire: wire.clone(),
            };
            (cnx, wire)
        }
    }

    impl BgpConnection for MockConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn send(
            &mut self,
            msg: &Message,
            width: AsPathWidth,
        ) -> Result<SendStatus, Error> {
            msg.to_frame(width)?;
            let mut w = self.wire.lock().unwrap();
            w.sent.push(msg.clone());
            Ok(if w.busy {
                SendStatus::Queued
            } else {
                SendStatus::Sent
            })
        }

        fn is_busy(&self) -> bool {
            self.wire.lock().unwrap().busy
        }

        fn flush_transmit_queue(&mut self) {
            self.wire.lock().unwrap().flushed = true;
        }

        fn stop_reader(&mut self) {}

        fn disconnect(&mut self) {
            self.wire.lock().unwrap().disconnected = true;
        }
    }

    #[derive(Default)]
    struct MockConnector {
        attempts: Arc<Mutex<Vec<SocketAddr>>>,
    }

    impl BgpConnector<MockConnection> for MockConnector {
        fn connect(
            &self,
            _peer: PeerId,
            addr: SocketAddr,
            _local: Option<SocketAddr>,
            _events: Sender<RouterEvent<MockConnection>>,
        ) {
            self.attempts.lock().unwrap().push(addr);
        }
    }

    struct Harness {
        plumbing: BgpPlumbing,
        connector: MockConnector,
        tx: Sender<RouterEvent<MockConnection>>,
        _rx: Receiver<RouterEvent<MockConnection>>,
        local: RouterConfig,
    }

    const PEER: PeerId = PeerId(1);

    impl Harness {
        fn new() -> Self {
            let log = bgp_common::log::discard_logger();
            let local = RouterConfig {
                asn: 65001,
                id: Ipv4Addr::new(10, 0, 0, 1),
            };
            let mut plumbing = BgpPlumbing::new(
                LocalConfig {
                    asn: local.asn,
                    bgp_id: local.id,
                },
                Box::new(StaticRib::new(log.clone())),
                Box::new(StaticRib::new(log)),
                bgp_common::log::discard_logger(),
            );
            plumbing.add_peering(PEER).unwrap();
            let (tx, rx) = channel();
            Self {
                plumbing,
                connector: MockConnector::default(),
                tx,
                _rx: rx,
                local,
            }
        }

        fn cx(&mut self) -> SessionContext<'_, MockConnection> {
            SessionContext {
                plumbing: &mut self.plumbing,
                connector: &self.connector,
                events: &self.tx,
                local: self.local,
            }
        }
    }

    fn peer_config() -> PeerConfig {
        PeerConfig::new("r2", "198.51.100.2:179".parse().unwrap(), 65002)
    }

    fn session(config: PeerConfig) -> SessionRunner<MockConnection> {
        SessionRunner::new(PEER, config, bgp_common::log::discard_logger())
    }

    fn peer_open(asn: u32, hold: u16) -> Message {
        Message::Open(OpenMessage::new(
            asn,
            hold,
            u32::from(Ipv4Addr::new(10, 0, 0, 2)),
            vec![
                Capability::MultiprotocolExtensions {
                    afi: AFI_IPV4,
                    safi: SAFI_UNICAST,
                },
                Capability::FourOctetAs { asn },
            ],
        ))
    }

    fn last_sent(wire: &Arc<Mutex<Wire>>) -> Message {
        wire.lock().unwrap().sent.last().cloned().expect("a sent message")
    }

    /// Run a session up to OPENSENT.
    fn open_sent(
        h: &mut Harness,
        s: &mut SessionRunner<MockConnection>,
    ) -> Arc<Mutex<Wire>> {
        s.handle(FsmEvent::Start, &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Connect);
        let (cnx, wire) = MockConnection::new();
        s.handle(FsmEvent::TransportOpened(cnx), &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::OpenSent);
        match last_sent(&wire) {
            Message::Open(o) => {
                assert_eq!(o.peer_asn(), 65001);
                assert_eq!(o.hold_time, 90);
            }
            m => panic!("expected open, sent {m}"),
        }
        wire
    }

    fn established(
        h: &mut Harness,
        s: &mut SessionRunner<MockConnection>,
    ) -> Arc<Mutex<Wire>> {
        let wire = open_sent(h, s);
        s.handle(FsmEvent::Message(peer_open(65002, 90)), &mut h.cx())
            .unwrap();
        assert_eq!(s.state(), FsmStateKind::OpenConfirm);
        assert_eq!(last_sent(&wire), Message::KeepAlive);
        s.handle(FsmEvent::Message(Message::KeepAlive), &mut h.cx())
            .unwrap();
        assert_eq!(s.state(), FsmStateKind::Established);
        assert!(h.plumbing.ipv4.is_up(PEER));
        wire
    }

    fn notification(m: Message) -> NotificationMessage {
        match m {
            Message::Notification(n) => n,
            m => panic!("expected notification, got {m}"),
        }
    }

    #[test]
    fn session_establishes() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        established(&mut h, &mut s);
        let n = s.negotiated().unwrap();
        assert_eq!(n.hold_time, 90);
        assert_eq!(n.width, AsPathWidth::Four);
        assert!(!n.ibgp);
        assert!(n.ipv4 && !n.ipv6);
        assert_eq!(h.connector.attempts.lock().unwrap().len(), 1);
    }

    #[test]
    fn bad_peer_as_stops_then_drains() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        let wire = open_sent(&mut h, &mut s);

        s.handle(FsmEvent::Message(peer_open(65099, 90)), &mut h.cx())
            .unwrap();
        assert_eq!(s.state(), FsmStateKind::Stopped);
        let n = notification(last_sent(&wire));
        assert_eq!(n.error_subcode, ErrorSubcode::from(OpenErrorSubcode::BadPeerAS));
        assert!(wire.lock().unwrap().flushed);

        // anything from the peer is ignored while stopped
        s.handle(FsmEvent::Message(Message::KeepAlive), &mut h.cx())
            .unwrap();
        assert_eq!(s.state(), FsmStateKind::Stopped);

        s.handle(FsmEvent::TransmitComplete, &mut h.cx()).unwrap();
        assert!(wire.lock().unwrap().disconnected);
        // automatic restart waits for the peer or the retry timer
        assert_eq!(s.state(), FsmStateKind::Active);
        let e = s.last_error().unwrap();
        assert_eq!((e.code, e.subcode, e.received), (2, 2, false));

        s.tick(Duration::from_secs(30), &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Connect);
        assert_eq!(h.connector.attempts.lock().unwrap().len(), 2);
    }

    #[test]
    fn open_without_capabilities() {
        let mut h = Harness::new();
        let mut config = peer_config();
        config.asn = 666;
        let mut s = session(config);
        open_sent(&mut h, &mut s);

        let open = OpenMessage::new(
            666,
            1234,
            u32::from(Ipv4Addr::new(1, 2, 3, 4)),
            Vec::new(),
        );
        let wire = open.to_wire().unwrap();
        let decoded = OpenMessage::from_wire(&wire).unwrap();
        assert_eq!(decoded.hold_time, 1234);
        assert_eq!(decoded.peer_asn(), 666);
        assert_eq!(Ipv4Addr::from(decoded.id), Ipv4Addr::new(1, 2, 3, 4));

        s.handle(FsmEvent::Message(Message::Open(decoded)), &mut h.cx())
            .unwrap();
        assert_eq!(s.state(), FsmStateKind::OpenConfirm);
        let n = s.negotiated().unwrap();
        assert_eq!(n.hold_time, 90);
        assert_eq!(n.width, AsPathWidth::Two);
        assert!(n.ipv4 && !n.ipv6);
        assert!(s.clock.keepalive.interval <= Duration::from_secs(30));
    }

    #[test]
    fn unacceptable_hold_time() {
        for hold in [1, 2] {
            let mut h = Harness::new();
            let mut s = session(peer_config());
            let wire = open_sent(&mut h, &mut s);
            s.handle(FsmEvent::Message(peer_open(65002, hold)), &mut h.cx())
                .unwrap();
            assert_eq!(s.state(), FsmStateKind::Stopped);
            let n = notification(last_sent(&wire));
            assert_eq!(
                n.error_subcode,
                ErrorSubcode::from(OpenErrorSubcode::UnacceptableHoldTime)
            );
        }
    }

    #[test]
    fn stopped_times_out() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        let wire = established(&mut h, &mut s);

        s.handle(FsmEvent::Stop, &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Stopped);
        assert!(!h.plumbing.ipv4.is_up(PEER));
        let n = notification(last_sent(&wire));
        assert_eq!(
            n.error_subcode,
            ErrorSubcode::from(CeaseErrorSubcode::AdministrativeShutdown)
        );

        s.tick(Duration::from_secs(9), &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Stopped);
        s.tick(Duration::from_secs(1), &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Idle);
        assert!(wire.lock().unwrap().disconnected);
    }

    #[test]
    fn keepalives_and_hold_expiry() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        let wire = established(&mut h, &mut s);
        let sent = wire.lock().unwrap().sent.len();

        s.tick(Duration::from_secs(30), &mut h.cx()).unwrap();
        assert_eq!(wire.lock().unwrap().sent.len(), sent + 1);
        assert_eq!(last_sent(&wire), Message::KeepAlive);

        s.tick(Duration::from_secs(60), &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Stopped);
        let n = notification(last_sent(&wire));
        assert_eq!(n.codes(), (4, 0));
    }

    #[test]
    fn zero_hold_time_disables_timers() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        let wire = open_sent(&mut h, &mut s);
        s.handle(FsmEvent::Message(peer_open(65002, 0)), &mut h.cx())
            .unwrap();
        s.handle(FsmEvent::Message(Message::KeepAlive), &mut h.cx())
            .unwrap();
        assert_eq!(s.state(), FsmStateKind::Established);
        let sent = wire.lock().unwrap().sent.len();
        s.tick(Duration::from_secs(3600), &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Established);
        assert_eq!(wire.lock().unwrap().sent.len(), sent);
    }

    #[test]
    fn keepalive_timer_outside_open_states() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        let r = s.handle(FsmEvent::KeepaliveTimerExpires, &mut h.cx());
        assert!(matches!(
            r,
            Err(Error::InvalidTransition {
                state: FsmStateKind::Idle,
                ..
            })
        ));
    }

    #[test]
    fn malformed_notification_is_cease() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        let wire = established(&mut h, &mut s);

        s.transport(
            TransportEvent::Frame {
                typ: MessageType::Notification,
                body: vec![6, 99],
            },
            &mut h.cx(),
        )
        .unwrap();
        assert!(wire.lock().unwrap().disconnected);
        assert_eq!(s.state(), FsmStateKind::Active);
        let e = s.last_error().unwrap();
        assert_eq!((e.code, e.subcode, e.received), (6, 0, true));
        assert!(!h.plumbing.ipv4.is_up(PEER));
    }

    #[test]
    fn unsupported_parameter_drops_capabilities() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        open_sent(&mut h, &mut s);
        s.handle(
            FsmEvent::Message(Message::Notification(NotificationMessage::new(
                OpenErrorSubcode::UnsupportedOptionalParameter,
                Vec::new(),
            ))),
            &mut h.cx(),
        )
        .unwrap();
        assert_eq!(s.state(), FsmStateKind::Active);

        let (cnx, wire) = MockConnection::new();
        s.handle(FsmEvent::TransportOpened(cnx), &mut h.cx()).unwrap();
        match last_sent(&wire) {
            Message::Open(o) => assert!(o.parameters.is_empty()),
            m => panic!("expected open, sent {m}"),
        }
    }

    #[test]
    fn connection_refused_after_open() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        open_sent(&mut h, &mut s);
        assert!(!s.accepts_connection());
        let (cnx, wire) = MockConnection::new();
        let r = s.handle(FsmEvent::TransportOpened(cnx), &mut h.cx());
        assert!(r.is_err());
        assert!(wire.lock().unwrap().disconnected);
        assert_eq!(s.state(), FsmStateKind::OpenSent);
    }

    #[test]
    fn connect_failure_and_close_in_open_sent() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        s.handle(FsmEvent::Start, &mut h.cx()).unwrap();
        s.handle(FsmEvent::ConnectFailed, &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Active);

        let (cnx, wire) = MockConnection::new();
        s.handle(FsmEvent::TransportOpened(cnx), &mut h.cx()).unwrap();
        s.handle(FsmEvent::TransportClosed, &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Active);
        assert!(wire.lock().unwrap().disconnected);
        assert_eq!(s.connection_id(), None);
    }

    #[test]
    fn passive_session_waits() {
        let mut h = Harness::new();
        let mut config = peer_config();
        config.passive = true;
        let mut s = session(config);
        s.handle(FsmEvent::Start, &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Active);
        s.tick(Duration::from_secs(30), &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Active);
        assert!(h.connector.attempts.lock().unwrap().is_empty());
    }

    fn update(nlri: &[&str], nexthop: bool) -> Message {
        let mut path_attributes = vec![
            PathAttributeValue::Origin(PathOrigin::Igp).into(),
            PathAttributeValue::AsPath(vec![AsPathSegment::sequence(vec![
                65002,
            ])])
            .into(),
        ];
        if nexthop {
            path_attributes.push(
                PathAttributeValue::NextHop(Ipv4Addr::new(198, 51, 100, 2))
                    .into(),
            );
        }
        Message::Update(UpdateMessage {
            path_attributes,
            nlri: nlri.iter().map(|p| p.parse().unwrap()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn missing_nexthop_is_rejected() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        let wire = established(&mut h, &mut s);
        s.handle(
            FsmEvent::Message(update(&["203.0.113.0/24"], false)),
            &mut h.cx(),
        )
        .unwrap();
        assert_eq!(s.state(), FsmStateKind::Stopped);
        let n = notification(last_sent(&wire));
        assert_eq!(
            n.error_subcode,
            ErrorSubcode::from(UpdateErrorSubcode::MissingWellKnownAttribute)
        );
        assert_eq!(n.data, vec![3]);
    }

    #[test]
    fn prefix_limit_tears_down_session() {
        let mut h = Harness::new();
        let mut config = peer_config();
        config.prefix_limit = Some(1);
        let mut s = session(config);
        let wire = established(&mut h, &mut s);

        s.handle(
            FsmEvent::Message(update(&["203.0.113.0/24"], true)),
            &mut h.cx(),
        )
        .unwrap();
        assert_eq!(s.state(), FsmStateKind::Established);
        assert_eq!(h.plumbing.route_count(PEER), 1);

        s.handle(
            FsmEvent::Message(update(&["192.0.2.0/24", "192.0.2.128/25"], true)),
            &mut h.cx(),
        )
        .unwrap();
        assert_eq!(s.state(), FsmStateKind::Stopped);
        let n = notification(last_sent(&wire));
        assert_eq!(
            n.error_subcode,
            ErrorSubcode::from(CeaseErrorSubcode::MaximumNumberofPrefixesReached)
        );
        s.handle(FsmEvent::TransmitComplete, &mut h.cx()).unwrap();
        assert_eq!(s.state(), FsmStateKind::Active);
        assert_eq!(h.plumbing.route_count(PEER), 0);
    }

    #[test]
    fn unexpected_message_is_fsm_error() {
        let mut h = Harness::new();
        let mut s = session(peer_config());
        let wire = open_sent(&mut h, &mut s);
        s.handle(FsmEvent::Message(Message::KeepAlive), &mut h.cx())
            .unwrap();
        assert_eq!(s.state(), FsmStateKind::Stopped);
        assert_eq!(notification(last_sent(&wire)).codes(), (5, 0));
    }
}
