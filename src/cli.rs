//! Command-line interface definitions for vpnctl.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::intent::{
    NatType, NetShieldLevel, ServerConnectionIntent, ServerTarget, VpnFeatures, VpnTransport,
};

/// Connect to a VPN server through the local tunnel daemon.
///
/// vpnctl drives the tunnel, keeps the client certificate fresh and watches
/// the server's control channel until the connection is up. It stays in the
/// foreground and disconnects on Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "vpnctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Tunnel daemon socket (overrides `tunnel.daemon_socket`).
    #[arg(long = "socket", value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// On/off switch for features that are tri-state in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    /// Enable.
    On,
    /// Disable.
    Off,
}

impl From<Toggle> for bool {
    fn from(toggle: Toggle) -> bool {
        toggle == Toggle::On
    }
}

/// Subcommands for vpnctl.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect and stay connected until interrupted.
    Connect {
        /// Logical server id (for example `CH#1`).
        logical_id: String,

        /// Pin a specific physical server of the logical.
        #[arg(long = "server-id", value_name = "ID")]
        server_id: Option<String>,

        /// Tunnel transport: udp, tcp or tls.
        #[arg(long = "transport", default_value = "udp")]
        transport: VpnTransport,

        /// DNS blocking level: off, 1 or 2.
        #[arg(long = "net-shield", default_value = "off")]
        net_shield: NetShieldLevel,

        /// Enable the server-side connection accelerator.
        #[arg(long = "accelerator")]
        accelerator: bool,

        /// NAT type: strict or moderate.
        #[arg(long = "nat", default_value = "strict")]
        nat: NatType,

        /// Safe mode.
        #[arg(long = "safe-mode", value_enum)]
        safe_mode: Option<Toggle>,

        /// Exit bouncing identifier.
        #[arg(long = "bouncing", value_name = "ID")]
        bouncing: Option<String>,
    },

    /// List servers known to the server directory.
    Servers,

    /// Delete stored keys and certificate.
    Logout,
}

impl Commands {
    /// The connect intent described by a `connect` command.
    ///
    /// Returns None for other commands.
    pub fn intent(&self) -> Option<ServerConnectionIntent> {
        let Commands::Connect {
            logical_id,
            server_id,
            transport,
            net_shield,
            accelerator,
            nat,
            safe_mode,
            bouncing,
        } = self
        else {
            return None;
        };

        Some(ServerConnectionIntent {
            target: ServerTarget {
                logical_id: logical_id.clone(),
                server_id: server_id.clone(),
            },
            transport: *transport,
            features: VpnFeatures {
                net_shield: *net_shield,
                vpn_accelerator: *accelerator,
                nat_type: *nat,
                safe_mode: safe_mode.map(bool::from),
                bouncing: bouncing.clone(),
            },
        })
    }
}
