//! Control plane: lifecycle commands and status queries for external callers
//!
//! [`ControlPlane`] maps supervisor results onto plain JSON-friendly
//! responses; [`http`] exposes it over REST and Server-Sent Events.

pub mod http;

use crate::runtime::{
    OutputLine, ServiceState, ServiceStatus, StatusEvent, Supervisor, SupervisorError,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One entry of the service list
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub name: String,
    pub status: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of a lifecycle command
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Detailed status of one service
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusResponse {
    pub name: String,
    pub status: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub restart_count: u32,
}

/// Captured output of one service
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsResponse {
    pub name: String,
    pub lines: Vec<OutputLine>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ServiceStatus> for ServiceSummary {
    fn from(status: ServiceStatus) -> Self {
        Self {
            name: status.name,
            status: status.state,
            pid: status.pid,
            port: status.port,
            last_error: status.last_error,
        }
    }
}

impl From<ServiceStatus> for ServiceStatusResponse {
    fn from(status: ServiceStatus) -> Self {
        Self {
            name: status.name,
            status: status.state,
            pid: status.pid,
            uptime_ms: status
                .uptime
                .map(|uptime| u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX)),
            last_exit_code: status.last_exit_code,
            last_error: status.last_error,
            restart_count: status.restart_count,
        }
    }
}

impl<E: std::fmt::Display> From<Result<ServiceState, E>> for CommandResponse {
    fn from(result: Result<ServiceState, E>) -> Self {
        match result {
            Ok(_) => Self {
                success: true,
                error: None,
            },
            Err(e) => Self {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Front door for external callers
#[derive(Debug, Clone)]
pub struct ControlPlane {
    supervisor: Arc<Supervisor>,
}

impl ControlPlane {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.supervisor.registry().get(name).is_some()
    }

    pub async fn list_services(&self) -> Vec<ServiceSummary> {
        self.supervisor
            .status_all()
            .await
            .into_iter()
            .map(ServiceSummary::from)
            .collect()
    }

    pub async fn start_service(&self, name: &str) -> CommandResponse {
        self.supervisor.start(name).await.into()
    }

    pub async fn stop_service(&self, name: &str) -> CommandResponse {
        self.supervisor.stop(name).await.into()
    }

    pub async fn restart_service(&self, name: &str) -> CommandResponse {
        self.supervisor.restart(name).await.into()
    }

    pub async fn get_service_status(
        &self,
        name: &str,
    ) -> Result<ServiceStatusResponse, SupervisorError> {
        self.supervisor.status(name).await.map(Into::into)
    }

    pub fn get_service_logs(&self, name: &str, lines: usize) -> LogsResponse {
        match self.supervisor.logs(name, lines) {
            Ok(lines) => LogsResponse {
                name: name.to_string(),
                lines,
                success: true,
                error: None,
            },
            Err(e) => LogsResponse {
                name: name.to_string(),
                lines: Vec::new(),
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Stream of status events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.supervisor.subscribe()
    }
}
