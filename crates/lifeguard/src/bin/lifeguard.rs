//! Lifeguard CLI
//!
//! Usage:
//!   lifeguard services.yaml
//!   lifeguard services.yaml --http 127.0.0.1:8090
//!   lifeguard services.yaml --dry-run

use lifeguard::control::{self, ControlPlane};
use lifeguard::{Registry, ServicesFile, Supervisor, SupervisorArgs, SupervisorConfig};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: SupervisorArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    log::info!("Loading services file: {}", args.services_file);
    let services_file = match ServicesFile::from_file(&args.services_file) {
        Ok(file) => file,
        Err(e) => {
            log::error!("Failed to load services file: {}", e);
            std::process::exit(1);
        }
    };

    let registry = match Registry::from_services_file(&services_file) {
        Ok(registry) => registry,
        Err(e) => {
            log::error!("Invalid services file: {}", e);
            std::process::exit(1);
        }
    };

    if args.validate {
        println!("Services file '{}' is valid", args.services_file);
        println!("  Version: {}", services_file.version);
        println!("  Services: {}", registry.len());
        println!("  Start order: {}", registry.start_order().join(", "));
        return Ok(());
    }

    if args.dry_run {
        println!("{}", registry);
        return Ok(());
    }

    let config = SupervisorConfig::from_settings(&services_file.supervisor);
    let supervisor = Supervisor::new(Arc::new(registry), config)?;

    // Shutdown channel
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, initiating shutdown...");
        let _ = shutdown_tx.send(true);
    })?;

    let http_bind = args
        .http
        .map(|addr| addr.to_string())
        .or_else(|| services_file.supervisor.http_bind.clone());
    let http_task = match http_bind {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            let control = ControlPlane::new(supervisor.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = control::http::serve(listener, control).await {
                    log::error!("HTTP control plane error: {}", e);
                }
            }))
        }
        None => None,
    };

    if args.no_autostart {
        log::info!("Autostart disabled, waiting for commands");
    } else {
        tokio::select! {
            results = supervisor.start_all() => {
                let failed = results.iter().filter(|(_, result)| result.is_err()).count();
                if failed > 0 {
                    log::warn!("{} of {} service(s) failed to start", failed, results.len());
                }
            }
            _ = shutdown_rx.wait_for(|requested| *requested) => {}
        }
    }

    // Wait for Ctrl+C
    let _ = shutdown_rx.wait_for(|requested| *requested).await;

    supervisor.shutdown().await;
    if let Some(task) = http_task {
        task.abort();
    }

    log::info!("Lifeguard exiting");
    Ok(())
}
