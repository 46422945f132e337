//! Service descriptor registry
//!
//! Immutable table of known services, built once from the services file.

use crate::config::{
    ReadinessConfig, ServiceConfig, ServicesFile, SubstitutionContext, SubstitutionError,
};
use crate::runtime::dependency::{DependencyError, DependencyGraph};
use crate::runtime::process::ProcessConfig;
use crate::runtime::readiness::ReadinessTarget;
use crate::runtime::restart::RestartPolicy;
use indexmap::IndexMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default readiness timeout when a descriptor is built by hand
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to launch and supervise one service
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Overlay merged over the inherited environment (overlay wins)
    pub env: IndexMap<String, String>,
    pub readiness: Option<ReadinessTarget>,
    pub readiness_timeout: Duration,
    pub restart: RestartPolicy,
    pub depends_on: Vec<String>,
    pub autostart: bool,
    pub description: Option<String>,
}

impl ServiceDescriptor {
    /// Descriptor with defaults for everything but the command
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: IndexMap::new(),
            readiness: None,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            restart: RestartPolicy::default(),
            depends_on: Vec::new(),
            autostart: true,
            description: None,
        }
    }

    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            name: self.name.clone(),
            executable: self.executable.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
        }
    }

    /// Build a descriptor from the services file, resolving substitutions
    fn from_config(
        name: &str,
        config: &ServiceConfig,
        global_env: &IndexMap<String, String>,
        ctx: &SubstitutionContext,
        stability_window: Duration,
    ) -> Result<Self, RegistryError> {
        let subst = |field: String, value: &str| {
            ctx.substitute(value)
                .map_err(|source| RegistryError::SubstitutionFailed {
                    context: format!("service '{}' {}", name, field),
                    source,
                })
        };

        let executable = subst("executable".to_string(), &config.executable)?;

        let args = config
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| subst(format!("args[{}]", i), arg))
            .collect::<Result<Vec<_>, _>>()?;

        // Global env first, then the service's own overlay on top
        let mut env = IndexMap::new();
        for (key, value) in global_env {
            env.insert(key.clone(), subst(format!("global env '{}'", key), value)?);
        }
        for (key, value) in &config.env {
            env.insert(key.clone(), subst(format!("env '{}'", key), value)?);
        }

        let working_dir = config
            .working_dir
            .as_deref()
            .map(|dir| subst("working_dir".to_string(), dir).map(PathBuf::from))
            .transpose()?;

        let (readiness, readiness_timeout) = match &config.readiness {
            Some(readiness) => {
                let target = readiness_target(readiness, |field, value| {
                    subst(format!("readiness.{}", field), value)
                })?;
                (Some(target), Duration::from_millis(readiness.timeout_ms))
            }
            None => (None, DEFAULT_READINESS_TIMEOUT),
        };

        Ok(Self {
            name: name.to_string(),
            executable,
            args,
            working_dir,
            env,
            readiness,
            readiness_timeout,
            restart: RestartPolicy::from_config(&config.restart, stability_window),
            depends_on: config.depends_on.clone(),
            autostart: config.autostart,
            description: config.description.clone(),
        })
    }
}

fn readiness_target(
    config: &ReadinessConfig,
    subst: impl Fn(&str, &str) -> Result<String, RegistryError>,
) -> Result<ReadinessTarget, RegistryError> {
    match (&config.tcp, &config.http) {
        (Some(port), _) => Ok(ReadinessTarget::Tcp {
            host: subst("host", &config.host)?,
            port: *port,
        }),
        (None, Some(url)) => Ok(ReadinessTarget::Http {
            url: subst("http", url)?,
            expected_status: config.expected_status,
        }),
        (None, None) => Err(RegistryError::InvalidDescriptor(
            "readiness must specify either 'tcp' or 'http'".to_string(),
        )),
    }
}

/// Read-only lookup table of service descriptors
#[derive(Debug, Clone)]
pub struct Registry {
    services: IndexMap<String, Arc<ServiceDescriptor>>,
    graph: DependencyGraph,
}

impl Registry {
    /// Build a registry from descriptors, keeping their order
    pub fn new(
        descriptors: impl IntoIterator<Item = ServiceDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut services = IndexMap::new();
        for descriptor in descriptors {
            if services.contains_key(&descriptor.name) {
                return Err(RegistryError::DuplicateService(descriptor.name));
            }
            services.insert(descriptor.name.clone(), Arc::new(descriptor));
        }

        let edges: IndexMap<String, Vec<String>> = services
            .iter()
            .map(|(name, d)| (name.clone(), d.depends_on.clone()))
            .collect();
        let graph = DependencyGraph::build(&edges)?;

        Ok(Self { services, graph })
    }

    /// Build a registry from a parsed services file
    pub fn from_services_file(file: &ServicesFile) -> Result<Self, RegistryError> {
        let mut ctx = SubstitutionContext::new();
        if let Some(dir) = &file.source_dir {
            ctx = ctx.with_config_dir(dir);
        }

        let stability_window = Duration::from_millis(file.supervisor.stability_window_ms);
        let descriptors = file
            .services
            .iter()
            .map(|(name, config)| {
                ServiceDescriptor::from_config(name, config, &file.env, &ctx, stability_window)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(descriptors)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.services.get(name)
    }

    /// All descriptors in configuration order
    pub fn all(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.services.values()
    }

    /// All service names in configuration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Every service in dependency order
    pub fn start_order(&self) -> &[String] {
        self.graph.start_order()
    }

    /// Autostart services and their dependencies, in dependency order
    pub fn autostart_order(&self) -> Vec<String> {
        self.graph.closure(
            self.services
                .values()
                .filter(|d| d.autostart)
                .map(|d| d.name.as_str()),
        )
    }
}

/// Human-readable start plan (used by `--dry-run`)
impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Services (in start order):")?;
        for (i, name) in self.start_order().iter().enumerate() {
            let Some(service) = self.services.get(name) else {
                continue;
            };
            writeln!(f)?;
            writeln!(
                f,
                "  {}. {}{}",
                i + 1,
                service.name,
                if service.autostart { "" } else { " (manual)" }
            )?;
            writeln!(
                f,
                "     Command: {} {}",
                service.executable,
                service.args.join(" ")
            )?;

            if let Some(dir) = &service.working_dir {
                writeln!(f, "     Working dir: {}", dir.display())?;
            }
            if !service.depends_on.is_empty() {
                writeln!(f, "     Depends on: {}", service.depends_on.join(", "))?;
            }
            if let Some(target) = &service.readiness {
                writeln!(
                    f,
                    "     Readiness: {} (timeout {}ms)",
                    target,
                    service.readiness_timeout.as_millis()
                )?;
            }
            if service.restart.auto_restart {
                writeln!(
                    f,
                    "     Restart: up to {} attempts, backoff {}ms x{} (cap {}ms)",
                    service.restart.max_attempts,
                    service.restart.backoff.base.as_millis(),
                    service.restart.backoff.multiplier,
                    service.restart.backoff.cap.as_millis()
                )?;
            }
            if !service.env.is_empty() {
                // Values are left out: the overlay carries secrets
                let keys: Vec<&str> = service.env.keys().map(String::as_str).collect();
                writeln!(f, "     Environment: {}", keys.join(", "))?;
            }
        }
        Ok(())
    }
}

/// Errors that can occur when building the registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Substitution failed in {context}: {source}")]
    SubstitutionFailed {
        context: String,
        #[source]
        source: SubstitutionError,
    },

    #[error("Invalid service descriptor: {0}")]
    InvalidDescriptor(String),
}
