//! Lifeguard service supervisor
//!
//! Starts, stops, restarts and monitors a fixed set of long-running services
//! (daemons, bots, pipelines) on one host.
//!
//! # Overview
//!
//! The supervisor allows you to:
//! - Define services, their environment and readiness checks in a YAML file
//! - Start services in dependency order and wait until each one is ready
//! - Restart crashed services with exponential backoff and crash-loop cutoff
//! - Stop services gracefully (SIGTERM, then SIGKILL after a timeout)
//! - Drive everything from an HTTP control plane with live status events
//!
//! # Example Services File
//!
//! ```yaml
//! version: "1.0"
//!
//! supervisor:
//!   stop_timeout_ms: 5000
//!   http_bind: "127.0.0.1:8090"
//!
//! env:
//!   RUST_LOG: info
//!
//! services:
//!   db:
//!     executable: "/usr/bin/redis-server"
//!     args: ["--port", "6379"]
//!     readiness:
//!       tcp: 6379
//!       timeout_ms: 10000
//!
//!   bot:
//!     executable: "python3"
//!     args: ["$(config_dir)/bot/main.py"]
//!     env:
//!       API_TOKEN: "$(env BOT_API_TOKEN)"
//!     readiness:
//!       http: "http://127.0.0.1:8081/health"
//!       expected_status: 200
//!     restart:
//!       auto: true
//!       max_attempts: 5
//!     depends_on:
//!       - db
//! ```

pub mod cli;
pub mod config;
pub mod control;
pub mod registry;
pub mod runtime;

pub use cli::SupervisorArgs;
pub use config::{ServicesFile, ServicesFileError, SubstitutionContext, SubstitutionError};
pub use control::ControlPlane;
pub use registry::{Registry, RegistryError, ServiceDescriptor};
pub use runtime::{
    DependencyError, DependencyGraph, ExitOutcome, OutputLine, ProcessConfig, ProcessError,
    ProcessHandle, ReadinessChecker, ReadinessTarget, RestartDecision, RestartPolicy,
    ServiceState, ServiceStatus, StatusEvent, Supervisor, SupervisorConfig, SupervisorError,
};
