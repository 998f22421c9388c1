// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

macro_rules! session_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => UNIT_SESSION_RUNNER,
            "peer_name" => $self.config.name.as_str(),
            "peer_sockaddr" => $self.config.host,
            "state" => format!("{}", $self.state),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => UNIT_SESSION_RUNNER,
            "peer_name" => $self.config.name.as_str(),
            "peer_sockaddr" => $self.config.host,
            "state" => format!("{}", $self.state),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => UNIT_SESSION_RUNNER,
            "peer_name" => $self.config.name.as_str(),
            "peer_sockaddr" => $self.config.host,
            "state" => format!("{}", $self.state),
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => UNIT_SESSION_RUNNER,
            "peer_name" => $self.config.name.as_str(),
            "peer_sockaddr" => $self.config.host,
            "state" => format!("{}", $self.state),
        )
    };
}

macro_rules! router_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_ROUTER,
            "asn" => $self.config.asn,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_ROUTER,
            "asn" => $self.config.asn,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_ROUTER,
            "asn" => $self.config.asn,
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_ROUTER,
            "asn" => $self.config.asn,
        )
    };
}

macro_rules! connection_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => UNIT_CONNECTION,
            "connection" => $self.id().serial,
            "peer" => $self.peer(),
            "source" => $self.local(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => UNIT_CONNECTION,
            "connection" => $self.id().serial,
            "peer" => $self.peer(),
            "source" => $self.local(),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => UNIT_CONNECTION,
            "connection" => $self.id().serial,
            "peer" => $self.peer(),
            "source" => $self.local(),
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_NEIGHBOR,
            "unit" => UNIT_CONNECTION,
            "connection" => $self.id().serial,
            "peer" => $self.peer(),
            "source" => $self.local(),
        )
    };
}

pub(crate) use {connection_log, router_log, session_log};
