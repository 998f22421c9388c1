// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

macro_rules! pipeline_log {
    ($log:expr, $level:ident, $table:expr, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_RDB,
            "module" => crate::MOD_PIPELINE,
            "table" => $table,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $table:expr, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RDB,
            "module" => crate::MOD_PIPELINE,
            "table" => $table,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $table:expr, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_RDB,
            "module" => crate::MOD_PIPELINE,
            "table" => $table,
        )
    };
    ($log:expr, $level:ident, $table:expr, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RDB,
            "module" => crate::MOD_PIPELINE,
            "table" => $table,
        )
    };
}

macro_rules! resolver_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_RDB,
            "module" => crate::MOD_RESOLVER,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RDB,
            "module" => crate::MOD_RESOLVER,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_RDB,
            "module" => crate::MOD_RESOLVER,
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RDB,
            "module" => crate::MOD_RESOLVER,
        )
    };
}

pub(crate) use {pipeline_log, resolver_log};
