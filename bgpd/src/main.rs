// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, Context};
use bgp::config::RouterConfig;
use bgp::connection_tcp::{BgpConnectionTcp, BgpConnectorTcp, BgpListenerTcp};
use bgpd::admin::{Admin, RouterParts};
use bgpd::config::DaemonConfig;
use bgpd::{COMPONENT_BGPD, MOD_ADMIN};
use bgp_common::log::{init_file_logger, init_term_logger};
use clap::{Args, Parser, Subcommand};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a BGP router instance.
    Run(Run),
    /// Print the JSON schema of the configuration file.
    Schema,
}

#[derive(Args, Debug)]
struct Run {
    /// Autonomous system number for this router.
    #[arg(long)]
    asn: Option<u32>,

    /// BGP identifier for this router.
    #[arg(long)]
    id: Option<Ipv4Addr>,

    /// Listening address <addr>:<port>.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Peers, originated routes and IGP destinations, as JSON.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write bunyan formatted logs to this file instead of the terminal.
    #[arg(long)]
    log_file: Option<String>,

    /// Timer resolution.
    #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
    tick: Duration,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    match args.command {
        Commands::Run(r) => run(r),
        Commands::Schema => schema(),
    }
}

fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(DaemonConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn run(args: Run) -> anyhow::Result<()> {
    let log = match &args.log_file {
        Some(path) => init_file_logger(path)
            .with_context(|| format!("open log file {path}"))?,
        None => init_term_logger(),
    };

    let config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };

    let local = match (args.asn, args.id, config.router) {
        (Some(asn), Some(id), _) => RouterConfig { asn, id },
        (asn, id, Some(c)) => RouterConfig {
            asn: asn.unwrap_or(c.asn),
            id: id.unwrap_or(c.id),
        },
        _ => {
            return Err(anyhow!(
                "local asn and id are required, on the command line or in \
                 the config file"
            ))
        }
    };

    let (rib4, rib6) = config.ribs(&log);
    let mut admin: Admin<BgpConnectionTcp> = Admin::new(
        RouterParts {
            connector: Box::new(BgpConnectorTcp::new(log.clone())),
            rib4: Box::new(rib4),
            rib6: Box::new(rib6),
        },
        log.clone(),
    );

    let shutdown = admin.shutdown_flag();
    ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
        .context("install signal handler")?;

    admin.set_local_config(local)?;
    for peer in config.peers {
        admin.add_peer(peer)?;
    }
    for o in config.originate {
        admin.originate_route(o.prefix, o.nexthop)?;
    }

    let listen = args
        .listen
        .or(config.listen)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], bgp::BGP_PORT)));
    let listener = BgpListenerTcp::bind(listen, log.clone())
        .with_context(|| format!("listen on {listen}"))?;
    slog::info!(log, "bgpd listening on {listen}";
        "component" => COMPONENT_BGPD,
        "module" => MOD_ADMIN,
        "asn" => local.asn,
        "id" => local.id.to_string()
    );

    admin.run(Some(listener), args.tick)?;
    slog::info!(log, "bgpd exiting";
        "component" => COMPONENT_BGPD,
        "module" => MOD_ADMIN
    );
    Ok(())
}
