//! Nginx gateway backend
//!
//! Projects registry state into an existing nginx configuration file:
//! one managed `upstream` block and one managed `location` block per
//! service, validated with `nginx -t` and activated with `nginx -s reload`.
//! Reloads are coalesced behind a quiet window so event bursts trigger a
//! single reload. Blocks written by hand are never touched; only contexts
//! carrying the managed marker comment are rewritten or removed.

pub mod conf;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::backend::GatewayBackend;
use crate::config::NginxConfig;
use crate::error::{LunaError, LunaResult};
use crate::registry::{RegistryEvent, ServiceRegistry};
use crate::types::{ServiceRecord, Status};

use self::conf::{ConfFile, Context, Directive, MANAGED_MARKER};

/// Edits arriving within this window collapse into one reload
const RELOAD_QUIET_WINDOW: Duration = Duration::from_millis(1000);

struct ConfState {
    file: ConfFile,
    last_rendered: String,
}

/// Gateway backend that rewrites an nginx configuration file in place
pub struct NginxBackend {
    settings: NginxConfig,
    registry: Arc<ServiceRegistry>,
    weighted: bool,
    state: RwLock<ConfState>,
    reload_pending: Arc<AtomicBool>,
}

impl NginxBackend {
    /// Create new nginx backend
    ///
    /// `weighted` controls whether instance weights are emitted as
    /// `weight=` parameters on upstream server directives.
    pub fn new(settings: NginxConfig, registry: Arc<ServiceRegistry>, weighted: bool) -> Self {
        Self {
            settings,
            registry,
            weighted,
            state: RwLock::new(ConfState {
                file: ConfFile::default(),
                last_rendered: String::new(),
            }),
            reload_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mutate the config tree, then write and activate it when it changed.
    ///
    /// The render is compared against the last written output, so replayed
    /// events and no-op edits never touch the file or trigger a reload.
    async fn apply_mutation(
        &self,
        mutate: impl FnOnce(&mut ConfFile) -> LunaResult<()> + Send,
    ) -> LunaResult<()> {
        let changed = {
            let mut state = self.state.write().await;
            mutate(&mut state.file)?;
            let rendered = state.file.render();
            if rendered == state.last_rendered {
                false
            } else {
                tokio::fs::write(&self.settings.config_path, &rendered)
                    .await
                    .map_err(|e| {
                        LunaError::Io(format!(
                            "failed to write nginx config {}: {}",
                            self.settings.config_path, e
                        ))
                    })?;
                info!(
                    path = %self.settings.config_path,
                    bytes = rendered.len(),
                    "nginx config written"
                );
                state.last_rendered = rendered;
                true
            }
        };

        if changed {
            validate_config(&self.settings.config_path).await?;
            self.schedule_reload();
        } else {
            debug!("nginx config unchanged, skipping write and reload");
        }
        Ok(())
    }

    /// Request a reload after the quiet window, coalescing pending requests
    fn schedule_reload(&self) {
        if self.reload_pending.swap(true, Ordering::SeqCst) {
            debug!("nginx reload already pending");
            return;
        }
        let pending = Arc::clone(&self.reload_pending);
        let config_path = self.settings.config_path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RELOAD_QUIET_WINDOW).await;
            pending.store(false, Ordering::SeqCst);
            // the file may have been rewritten since this reload was scheduled
            if let Err(e) = validate_config(&config_path).await {
                error!(error = %e, "nginx reload skipped, on-disk config is invalid");
                return;
            }
            match tokio::process::Command::new("nginx")
                .args(["-s", "reload"])
                .output()
                .await
            {
                Ok(output) if output.status.success() => {
                    info!("nginx reloaded");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    error!(stderr = %stderr.trim(), "nginx reload failed");
                }
                Err(e) => {
                    error!(error = %e, "failed to run nginx -s reload");
                }
            }
        });
    }
}

#[async_trait]
impl GatewayBackend for NginxBackend {
    fn name(&self) -> &'static str {
        "nginx"
    }

    /// Fail fast when the host cannot support config rewriting.
    ///
    /// The process must run on linux as root with an nginx binary on the
    /// path, and the config file must be writable and already contain a
    /// server block to attach locations to.
    async fn check_preconditions(&self) -> LunaResult<()> {
        if !cfg!(target_os = "linux") {
            return Err(LunaError::Configuration(
                "nginx backend is only supported on linux".to_string(),
            ));
        }

        let output = tokio::process::Command::new("nginx")
            .arg("-v")
            .output()
            .await
            .map_err(|e| LunaError::ExternalTool(format!("nginx binary not found: {}", e)))?;
        if !output.status.success() {
            return Err(LunaError::ExternalTool(
                "nginx -v exited with an error".to_string(),
            ));
        }

        let output = tokio::process::Command::new("whoami")
            .output()
            .await
            .map_err(|e| LunaError::ExternalTool(format!("failed to run whoami: {}", e)))?;
        let user = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if user != "root" {
            return Err(LunaError::Configuration(format!(
                "nginx backend must run as root to rewrite {}, running as '{}'",
                self.settings.config_path, user
            )));
        }

        tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.settings.config_path)
            .await
            .map_err(|e| {
                LunaError::Configuration(format!(
                    "nginx config {} is not readable and writable: {}",
                    self.settings.config_path, e
                ))
            })?;

        let file = ConfFile::load(&self.settings.config_path).await?;
        server_block_path(&file.root)?;

        let mut state = self.state.write().await;
        state.last_rendered = file.render();
        state.file = file;

        info!(
            path = %self.settings.config_path,
            "nginx backend preconditions satisfied"
        );
        Ok(())
    }

    async fn sync_full(&self) -> LunaResult<()> {
        let records = self.registry.get_all().await;
        let mut names: Vec<String> = Vec::new();
        for record in &records {
            let name = record.name.to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let weighted = self.weighted;
        self.apply_mutation(move |file| {
            for name in &names {
                let instances: Vec<ServiceRecord> = records
                    .iter()
                    .filter(|r| r.name.as_str() == name)
                    .cloned()
                    .collect();
                upsert_service(file, name, &instances, weighted)?;
            }
            Ok(())
        })
        .await
    }

    async fn apply_event(&self, event: RegistryEvent) -> LunaResult<()> {
        let weighted = self.weighted;
        match event {
            RegistryEvent::Add(record) | RegistryEvent::Update(record) => {
                let name = record.name.to_string();
                let instances = self.registry.find_all_by_name(&name).await;
                self.apply_mutation(move |file| upsert_service(file, &name, &instances, weighted))
                    .await
            }
            RegistryEvent::Remove(instance_id) => {
                let name = instance_id.service_name().to_string();
                let remaining = self.registry.find_all_by_name(&name).await;
                if remaining.is_empty() {
                    self.apply_mutation(move |file| remove_service(file, &name))
                        .await
                } else {
                    // remaining instances keep the blocks; the removed
                    // server line stays until the next full sync rewrite
                    debug!(service = %name, "instances remain, nginx blocks left in place");
                    Ok(())
                }
            }
        }
    }
}

/// Run `nginx -t` against a config file
async fn validate_config(config_path: &str) -> LunaResult<()> {
    let output = tokio::process::Command::new("nginx")
        .args(["-t", "-c", config_path])
        .output()
        .await
        .map_err(|e| LunaError::ExternalTool(format!("failed to run nginx -t: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LunaError::ExternalTool(format!(
            "nginx config validation failed: {}",
            stderr.trim()
        )));
    }
    debug!("nginx config validated");
    Ok(())
}

fn upstream_name(service_name: &str) -> String {
    format!("luna_service_{}", service_name)
}

/// Service names land in upstream names and location paths; nginx lexer
/// punctuation is not allowed in them.
fn check_service_name(service_name: &str) -> LunaResult<()> {
    if service_name
        .chars()
        .any(|c| matches!(c, '{' | '}' | ';' | '#' | '"' | '\''))
    {
        return Err(LunaError::Validation(format!(
            "service name '{}' cannot be carried in nginx configuration",
            service_name
        )));
    }
    Ok(())
}

/// Locate the server block to manage: a top-level `server` context first,
/// then `http > server`. Returns child indices from the root.
fn server_block_path(root: &Context) -> LunaResult<Vec<usize>> {
    if let Some(server) = root.children.iter().position(|c| c.name == "server") {
        return Ok(vec![server]);
    }
    for (http, child) in root.children.iter().enumerate() {
        if child.name != "http" {
            continue;
        }
        if let Some(server) = child.children.iter().position(|c| c.name == "server") {
            return Ok(vec![http, server]);
        }
    }
    Err(LunaError::ConfigStructure(
        "no server block found in nginx config".to_string(),
    ))
}

fn context_at_mut<'a>(root: &'a mut Context, path: &[usize]) -> &'a mut Context {
    let mut current = root;
    for &index in path {
        current = &mut current.children[index];
    }
    current
}

fn server_directive(record: &ServiceRecord, weighted: bool) -> Directive {
    let mut params = vec![record.instance_id.address()];
    if weighted {
        if let Some(weight) = record.balancer_options.weight() {
            params.push(format!("weight={}", weight));
        }
    }
    if record.status == Status::Down {
        params.push("down".to_string());
    }
    Directive::new("server", params)
}

/// Install or refresh the managed upstream and location blocks for a service
fn upsert_service(
    file: &mut ConfFile,
    service_name: &str,
    instances: &[ServiceRecord],
    weighted: bool,
) -> LunaResult<()> {
    check_service_name(service_name)?;
    let path = server_block_path(&file.root)?;
    let upstream = upstream_name(service_name);

    // upstream blocks live next to the server block, inside its parent
    let parent = context_at_mut(&mut file.root, &path[..path.len() - 1]);
    let upstream_block = parent.add_context("upstream", &upstream);
    upstream_block.add_comment(MANAGED_MARKER);
    for record in instances {
        upstream_block.add_directive(server_directive(record, weighted));
    }

    let server = context_at_mut(&mut file.root, &path);
    let location = server.add_context("location", &format!("/{}", service_name));
    location.add_comment(MANAGED_MARKER);
    location.add_directive(Directive::new(
        "proxy_pass",
        vec![format!("http://{}", upstream)],
    ));
    Ok(())
}

/// Remove the blocks for a service, touching only marker-bearing contexts
fn remove_service(file: &mut ConfFile, service_name: &str) -> LunaResult<()> {
    check_service_name(service_name)?;
    let path = server_block_path(&file.root)?;
    let upstream = upstream_name(service_name);
    let location_value = format!("/{}", service_name);

    let parent = context_at_mut(&mut file.root, &path[..path.len() - 1]);
    if parent
        .find_context("upstream", &upstream)
        .is_some_and(|c| c.has_comment(MANAGED_MARKER))
    {
        parent.remove_context("upstream", &upstream);
    }

    let server = context_at_mut(&mut file.root, &path);
    if server
        .find_context("location", &location_value)
        .is_some_and(|c| c.has_comment(MANAGED_MARKER))
    {
        server.remove_context("location", &location_value);
    }
    Ok(())
}
