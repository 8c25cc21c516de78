use std::collections::HashMap;
use std::path::Path;

use bollard::container::{Config as ContainerConfig, CreateContainerOptions, ListContainersOptions};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::configuration::SandboxConfig;
use crate::error_handling::types::SandboxError;
use crate::sandbox::container::Sandbox;

const DIR_PERM: u32 = 0o750;

/// Container name for an operator account.
pub fn container_name(account: &str) -> String {
    format!("sandbox-{}", account)
}

/// Creates and hands out per-operator sandbox containers.
///
/// Find-or-create is serialised by a single mutex so two inbound
/// connections for the same account never race container creation.
pub struct SandboxManager {
    config: SandboxConfig,
    docker: Docker,
    lock: Mutex<()>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|_| SandboxError::RuntimeNotAvailable)?;
        Ok(Self {
            config,
            docker,
            lock: Mutex::new(()),
        })
    }

    /// Returns the operator's sandbox, creating, keying and starting
    /// it as needed.
    pub async fn find_or_create(&self, account: &str) -> Result<Sandbox, SandboxError> {
        let _guard = self.lock.lock().await;
        let name = container_name(account);

        let account_dir = self.config.data_dir.join(&name);
        let shared_dir = self.config.data_dir.join("shared");
        Self::ensure_dir(&account_dir)?;
        Self::ensure_dir(&shared_dir)?;

        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![format!("^/{}$", name)]);
        let list = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::CreationFailed(e.to_string()))?;

        let mut created = false;
        let mut running = false;
        match list.first() {
            None => {
                info!("creating sandbox container {}", name);
                self.docker
                    .create_container(
                        Some(CreateContainerOptions {
                            name: name.clone(),
                            platform: None,
                        }),
                        ContainerConfig {
                            hostname: Some(format!("{}.sandbox", account)),
                            image: Some(self.config.image.clone()),
                            host_config: Some(HostConfig {
                                binds: Some(vec![
                                    format!("{}:/root", account_dir.display()),
                                    format!("{}:/shared", shared_dir.display()),
                                ]),
                                restart_policy: Some(RestartPolicy {
                                    name: Some(RestartPolicyNameEnum::ALWAYS),
                                    maximum_retry_count: None,
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| SandboxError::CreationFailed(e.to_string()))?;
                created = true;
            }
            Some(existing) => {
                running = existing.state.as_deref() == Some("running");
                debug!(
                    "found sandbox container {} (running: {})",
                    name, running
                );
            }
        }

        let sandbox = Sandbox::new(self.docker.clone(), name);
        if !running {
            sandbox.start().await?;
        }
        if created {
            sandbox.generate_ssh_key().await?;
        }
        Ok(sandbox)
    }

    fn ensure_dir(path: &Path) -> Result<(), SandboxError> {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(DIR_PERM);
        }
        builder.create(path)?;
        Ok(())
    }
}
