//! Dispatch façade: one entry point for every sandbox operation.
//!
//! The request's [`SandboxConfig`] picks the backend. Local and container
//! modes run in-process on the blocking pool against a host workspace;
//! cluster mode forwards to the provisioner over HTTP. Every mode answers
//! with the same [`SandboxResponse`] shapes.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::client::ProvisionerClient;
use crate::config::{SandboxConfig, SandboxMode};
use crate::container::{ContainerPool, ContainerSpec};
use crate::error::{SandboxError, SandboxResult};
use crate::guard;
use crate::identity::{ResolvedIdentity, SandboxIdentity};
use crate::local::LocalBackend;
use crate::output::CommandResult;
use crate::paths::{self, VIRTUAL_ROOT};
use crate::protocol::{
    ExecuteRequest, ExecuteResponse, Lease, ListResponse, ReadFileResponse, ReleaseResponse,
    ReplaceResponse, SandboxRequest, SandboxResponse, WriteFileResponse,
};
use crate::workspace::HostWorkspace;

/// Process-wide handle to every backend.
///
/// Build one at startup and share it; configs are passed per call.
#[derive(Debug, Clone)]
pub struct SandboxService {
    containers: Arc<ContainerPool>,
    http: reqwest::Client,
}

impl Default for SandboxService {
    fn default() -> Self {
        Self::new(Arc::new(ContainerPool::default()), reqwest::Client::new())
    }
}

impl SandboxService {
    pub fn new(containers: Arc<ContainerPool>, http: reqwest::Client) -> Self {
        Self { containers, http }
    }

    /// Route `request` to the backend `config` selects.
    pub async fn dispatch(
        &self,
        config: &SandboxConfig,
        request: SandboxRequest,
    ) -> SandboxResult<SandboxResponse> {
        if !config.enabled {
            return Err(SandboxError::Disabled);
        }
        validate(&request)?;
        info!(op = request.name(), mode = %config.mode, "sandbox dispatch");

        match config.mode {
            SandboxMode::Cluster => self.remote(config, request).await,
            SandboxMode::Local | SandboxMode::Container => {
                let config = config.clone();
                let containers = Arc::clone(&self.containers);
                tokio::task::spawn_blocking(move || host_dispatch(&containers, &config, request)).await?
            }
        }
    }

    /// Run one command and flatten the answer into a [`CommandResult`].
    pub async fn execute(
        &self,
        config: &SandboxConfig,
        identity: &SandboxIdentity,
        command: &str,
    ) -> SandboxResult<CommandResult> {
        let request = SandboxRequest::Execute(ExecuteRequest {
            identity: identity.clone(),
            command: command.to_string(),
            timeout_seconds: None,
            max_output_bytes: None,
        });
        match self.dispatch(config, request).await? {
            SandboxResponse::Execute(resp) => Ok(CommandResult {
                mode: config.mode,
                workspace_path: resp.lease.workspace_path,
                output: resp.output,
                exit_code: resp.exit_code,
                truncated: resp.truncated,
                resource_name: Some(resp.lease.resource_name),
            }),
            other => Err(unexpected("execute", &other)),
        }
    }

    async fn remote(&self, config: &SandboxConfig, request: SandboxRequest) -> SandboxResult<SandboxResponse> {
        let client = ProvisionerClient::from_config(self.http.clone(), config)?;
        Ok(match request {
            SandboxRequest::Acquire(req) => SandboxResponse::Acquire(client.acquire(&req.identity).await?),
            SandboxRequest::Release(req) => SandboxResponse::Release(client.release(&req).await?),
            SandboxRequest::Execute(mut req) => {
                req.timeout_seconds = Some(req.timeout_seconds.unwrap_or(config.timeout_seconds));
                req.max_output_bytes = Some(output_budget(config, req.max_output_bytes));
                SandboxResponse::Execute(client.execute(&req).await?)
            }
            SandboxRequest::List(req) => SandboxResponse::List(client.list(&req).await?),
            SandboxRequest::ReadFile(req) => SandboxResponse::ReadFile(client.read_file(&req).await?),
            SandboxRequest::WriteFile(req) => SandboxResponse::WriteFile(client.write_file(&req).await?),
            SandboxRequest::Replace(req) => SandboxResponse::Replace(client.replace(&req).await?),
        })
    }
}

/// Checks that need no I/O: the command guard and path syntax.
fn validate(request: &SandboxRequest) -> SandboxResult<()> {
    let path = match request {
        SandboxRequest::Execute(req) => return guard::check_command(&req.command),
        SandboxRequest::Acquire(_) | SandboxRequest::Release(_) => return Ok(()),
        SandboxRequest::List(req) => &req.path,
        SandboxRequest::ReadFile(req) => &req.path,
        SandboxRequest::WriteFile(req) => &req.path,
        SandboxRequest::Replace(req) => &req.path,
    };
    paths::normalize(path)?;
    Ok(())
}

fn output_budget(config: &SandboxConfig, requested: Option<usize>) -> usize {
    requested
        .map(|v| v.min(config.max_output_bytes))
        .unwrap_or(config.max_output_bytes)
        .max(1)
}

fn unexpected(op: &str, response: &SandboxResponse) -> SandboxError {
    SandboxError::invalid_response(format!("{} answered with {:?}", op, response))
}

/// Local and container modes. Blocking.
fn host_dispatch(
    containers: &ContainerPool,
    config: &SandboxConfig,
    request: SandboxRequest,
) -> SandboxResult<SandboxResponse> {
    let identity = request.identity().resolve()?;
    let workspace = host_workspace(config, &identity.sandbox_id);

    Ok(match request {
        SandboxRequest::Acquire(_) => SandboxResponse::Acquire(host_lease(containers, config, &identity)?),
        SandboxRequest::Release(req) => {
            let reason = req.reason();
            let (resource_name, released) = match config.mode {
                SandboxMode::Container => {
                    containers.release(&ContainerSpec::from_config(config), &identity.sandbox_id)?
                }
                // host workspaces are never deleted implicitly
                _ => (workspace.root().display().to_string(), false),
            };
            info!(resource = %resource_name, reason = %reason, released, "release");
            SandboxResponse::Release(ReleaseResponse {
                released,
                resource_name,
                sandbox_id: identity.sandbox_id,
                reason,
            })
        }
        SandboxRequest::Execute(req) => {
            let lease = host_lease(containers, config, &identity)?;
            let timeout = req
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.timeout())
                .max(Duration::from_secs(1));
            let budget = output_budget(config, req.max_output_bytes);
            let outcome = match config.mode {
                SandboxMode::Container => containers.exec(&lease.resource_name, &req.command, timeout, budget)?,
                _ => LocalBackend::new(&config.workspace_root).execute(
                    &identity.sandbox_id,
                    &req.command,
                    timeout,
                    budget,
                )?,
            };
            SandboxResponse::Execute(ExecuteResponse {
                lease,
                output: outcome.output,
                exit_code: outcome.exit_code,
                truncated: outcome.truncated,
            })
        }
        SandboxRequest::List(req) => {
            let lease = host_lease(containers, config, &identity)?;
            let entries = workspace.list(&req.path, req.max_depth, req.max_entries)?;
            SandboxResponse::List(ListResponse {
                lease,
                path: paths::normalize(&req.path)?,
                entries,
            })
        }
        SandboxRequest::ReadFile(req) => {
            let lease = host_lease(containers, config, &identity)?;
            let content = workspace.read(&req.path, req.start_line, req.end_line, req.max_lines)?;
            SandboxResponse::ReadFile(ReadFileResponse {
                lease,
                path: paths::normalize(&req.path)?,
                content,
            })
        }
        SandboxRequest::WriteFile(req) => {
            let lease = host_lease(containers, config, &identity)?;
            let path = workspace.write(&req.path, &req.content, req.append)?;
            SandboxResponse::WriteFile(WriteFileResponse { lease, path })
        }
        SandboxRequest::Replace(req) => {
            let lease = host_lease(containers, config, &identity)?;
            let replaced = workspace.replace(&req.path, &req.old_text, &req.new_text, req.replace_all)?;
            SandboxResponse::Replace(ReplaceResponse {
                lease,
                path: paths::normalize(&req.path)?,
                replaced,
            })
        }
    })
}

fn host_workspace(config: &SandboxConfig, sandbox_id: &str) -> HostWorkspace {
    match config.mode {
        SandboxMode::Container => ContainerSpec::from_config(config).workspace(sandbox_id),
        _ => LocalBackend::new(&config.workspace_root).workspace(sandbox_id),
    }
}

/// Make sure the sandbox exists (directory or container) and describe it.
fn host_lease(containers: &ContainerPool, config: &SandboxConfig, identity: &ResolvedIdentity) -> SandboxResult<Lease> {
    let (resource_name, workspace_path, reused) = match config.mode {
        SandboxMode::Container => {
            let spec = ContainerSpec::from_config(config);
            let (name, reused) = containers.ensure(&spec, &identity.sandbox_id)?;
            (name, VIRTUAL_ROOT.to_string(), reused)
        }
        _ => {
            let workspace = host_workspace(config, &identity.sandbox_id);
            let reused = workspace.ensure()?;
            let dir = workspace.root().display().to_string();
            (dir.clone(), dir, reused)
        }
    };
    Ok(Lease {
        thread_id: identity.thread_id.clone(),
        thread_key: identity.thread_key.clone(),
        sandbox_id: identity.sandbox_id.clone(),
        resource_name,
        workspace_path,
        reused,
    })
}
