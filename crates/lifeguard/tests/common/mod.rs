//! Test helpers for supervisor integration tests

#![allow(dead_code)]

use lifeguard::{
    Registry, ServiceDescriptor, ServiceState, ServiceStatus, StatusEvent, Supervisor,
    SupervisorConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Timings short enough to keep tests fast
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        stop_timeout: Duration::from_secs(3),
        shutdown_timeout: Duration::from_secs(5),
        readiness_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// A service running a shell script
pub fn sh(name: &str, script: &str) -> ServiceDescriptor {
    ServiceDescriptor::new(name, "sh", ["-c", script])
}

pub fn supervisor(descriptors: Vec<ServiceDescriptor>) -> Arc<Supervisor> {
    supervisor_with(descriptors, fast_config())
}

pub fn supervisor_with(
    descriptors: Vec<ServiceDescriptor>,
    config: SupervisorConfig,
) -> Arc<Supervisor> {
    let registry = Registry::new(descriptors).expect("valid registry");
    Supervisor::new(Arc::new(registry), config).expect("supervisor")
}

/// Poll until the service reaches `state`
pub async fn wait_for_state(
    supervisor: &Supervisor,
    name: &str,
    state: ServiceState,
    timeout: Duration,
) -> ServiceStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = supervisor.status(name).await.expect("known service");
        if status.state == state {
            return status;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "'{}' did not reach {} within {:?}, still {}",
                name, state, timeout, status.state
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Receive events until one matches `pred`, returning everything seen
pub async fn events_until(
    rx: &mut broadcast::Receiver<StatusEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&StatusEvent) -> bool,
) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    let matched = tokio::time::timeout(timeout, async {
        loop {
            let event = rx.recv().await.expect("event channel open");
            let done = pred(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;

    if matched.is_err() {
        panic!(
            "no matching event within {:?}, saw {:?}",
            timeout,
            seen_names(&seen)
        );
    }
    seen
}

fn seen_names(events: &[StatusEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| format!("{}:{}->{}", e.name, e.old_state, e.new_state))
        .collect()
}

/// A port nothing is listening on right now
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("ephemeral port")
}
