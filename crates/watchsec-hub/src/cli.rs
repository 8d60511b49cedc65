//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use watchsec_core::config::HubConfig;

#[derive(Parser)]
#[command(name = "watchsec", about = "endpoint telemetry hub with mail and ICAP interceptors")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, short = 'c', global = true, env = "WATCHSEC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Admin socket path (overrides [admin] socket)
    #[arg(long, global = true)]
    pub admin_socket: Option<PathBuf>,

    /// SQLite database path (overrides [storage] database)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the hub and the protocol listeners (default)
    Serve(ServeOpts),
    /// Send an operator command to an agent through the running hub
    Exec(ExecOpts),
    /// Show connected dashboards, agents and groups
    Status,
    /// Create or rename a tenant and its agent API key
    SeedTenant {
        name: String,
        api_key: String,
    },
    /// Register a dashboard session token
    SeedSession {
        token: String,
        username: String,
        #[arg(long)]
        tenant: Option<i64>,
    },
}

#[derive(clap::Args, Default)]
pub struct ServeOpts {
    #[arg(long)]
    pub hub_listen: Option<String>,

    #[arg(long)]
    pub mail_listen: Option<String>,

    #[arg(long)]
    pub icap_listen: Option<String>,

    #[arg(long)]
    pub screenshots_dir: Option<PathBuf>,

    /// Do not start the mail interceptor
    #[arg(long)]
    pub no_mail: bool,

    /// Do not start the ICAP responder
    #[arg(long)]
    pub no_icap: bool,
}

#[derive(clap::Args)]
pub struct ExecOpts {
    pub agent_id: String,
    pub command: String,

    #[arg(long)]
    pub target: Option<String>,

    /// Identity recorded in the audit log
    #[arg(long, env = "USER", default_value = "cli")]
    pub actor: String,

    #[arg(long, default_value_t = 1)]
    pub tenant: i64,
}

impl Cli {
    /// Apply flags shared by every subcommand.
    pub fn apply(&self, config: &mut HubConfig) {
        if let Some(path) = &self.admin_socket {
            config.admin.socket = path.clone();
        }
        if let Some(path) = &self.database {
            config.storage.database = path.clone();
        }
    }
}

impl ServeOpts {
    pub fn apply(&self, config: &mut HubConfig) {
        if let Some(addr) = &self.hub_listen {
            config.hub.listen = addr.clone();
        }
        if let Some(addr) = &self.mail_listen {
            config.mail.listen = addr.clone();
        }
        if let Some(addr) = &self.icap_listen {
            config.icap.listen = addr.clone();
        }
        if let Some(dir) = &self.screenshots_dir {
            config.capture.screenshots_dir = dir.clone();
        }
        if self.no_mail {
            config.mail.enabled = false;
        }
        if self.no_icap {
            config.icap.enabled = false;
        }
    }
}
