//! Command-line interface for lifeguard

use argh::FromArgs;
use std::net::SocketAddr;

/// Supervise long-running services defined in a services file
#[derive(FromArgs, Debug)]
pub struct SupervisorArgs {
    /// path to the services file (default: services.yaml)
    #[argh(positional, default = "String::from(\"services.yaml\")")]
    pub services_file: String,

    /// serve the HTTP control plane on this address (overrides the file)
    #[argh(option, from_str_fn(parse_addr))]
    pub http: Option<SocketAddr>,

    /// do not start autostart services on boot
    #[argh(switch)]
    pub no_autostart: bool,

    /// show the start plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// validate the services file and exit
    #[argh(switch)]
    pub validate: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse a listen address such as "127.0.0.1:8090"
fn parse_addr(s: &str) -> Result<SocketAddr, String> {
    s.parse()
        .map_err(|e| format!("Invalid address '{}': {}", s, e))
}

impl SupervisorArgs {
    /// Normalized log filter, falling back to "info"
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}
