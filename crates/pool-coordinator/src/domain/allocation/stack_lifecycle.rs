//! Creation, inspection and teardown of (host pool, application group,
//! workspace) stacks.
//!
//! A stack's three resources share a [`Suffix`] appended to fixed prefixes.
//! Membership is always resolved fresh from the backend; nothing here is
//! cached between calls.

use std::collections::BTreeMap;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::backend::SharedBackend;
use super::error::CreateStep;
use super::error::ResourceKind;
use super::error::StackError;
use super::name_sequencer::Suffix;
use super::types::AppGroup;
use super::types::AppGroupKind;
use super::types::AppGroupProperties;
use super::types::HostPool;
use super::types::IncompleteStack;
use super::types::PoolProperties;
use super::types::SessionHost;
use super::types::Stack;
use super::types::StackCandidate;
use super::types::Tags;
use super::types::Workspace;
use super::types::WorkspaceProperties;
use super::types::DESKTOP_VIRTUALIZATION_USER_ROLE;

const SUFFIX_TAG: &str = "stack-suffix";

/// Resource name prefixes and the suffix segment limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackNaming {
    pub pool_prefix: String,
    pub app_group_prefix: String,
    pub workspace_prefix: String,
    pub max_segments: usize,
}

impl Default for StackNaming {
    fn default() -> Self {
        Self {
            pool_prefix: "HP-Personal-".to_string(),
            app_group_prefix: "AG-Personal-".to_string(),
            workspace_prefix: "WS-Personal-".to_string(),
            max_segments: 3,
        }
    }
}

impl StackNaming {
    pub fn pool_name(&self, suffix: &Suffix) -> String {
        format!("{}{suffix}", self.pool_prefix)
    }

    pub fn app_group_name(&self, suffix: &Suffix) -> String {
        format!("{}{suffix}", self.app_group_prefix)
    }

    pub fn workspace_name(&self, suffix: &Suffix) -> String {
        format!("{}{suffix}", self.workspace_prefix)
    }

    /// Derives the suffix of a host pool name.
    pub fn pool_suffix(&self, pool_name: &str) -> Result<Suffix, Report<StackError>> {
        suffix_after(pool_name, &self.pool_prefix)
    }
}

fn suffix_after(name: &str, prefix: &str) -> Result<Suffix, Report<StackError>> {
    let mismatch = || StackError::NameMismatch {
        name: name.to_string(),
        prefix: prefix.to_string(),
    };
    let raw = name
        .strip_prefix(prefix)
        .ok_or_else(|| Report::new(mismatch()))?;
    Suffix::parse(raw).change_context_lazy(mismatch)
}

/// Settings applied to every newly created stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSettings {
    pub location: String,
    pub desktop_friendly_name: String,
    pub max_session_limit: u32,
    pub start_vm_on_connect: bool,
    /// Group granted access to new desktops; role assignment is skipped when unset
    pub user_group_id: Option<String>,
    pub role_definition_id: String,
    pub tags: Tags,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            location: "westeurope".to_string(),
            desktop_friendly_name: "Personal Desktop".to_string(),
            max_session_limit: 999_999,
            start_vm_on_connect: true,
            user_group_id: None,
            role_definition_id: DESKTOP_VIRTUALIZATION_USER_ROLE.to_string(),
            tags: Tags::new(),
        }
    }
}

pub struct StackLifecycle {
    backend: SharedBackend,
    naming: StackNaming,
    settings: StackSettings,
}

impl StackLifecycle {
    pub fn new(backend: SharedBackend, naming: StackNaming, settings: StackSettings) -> Self {
        Self {
            backend,
            naming,
            settings,
        }
    }

    pub fn naming(&self) -> &StackNaming {
        &self.naming
    }

    /// Host pools carrying the configured pool prefix.
    pub async fn list_pools(&self) -> Result<Vec<HostPool>, Report<StackError>> {
        self.backend
            .list_pools(&self.naming.pool_prefix)
            .await
            .change_context_lazy(|| backend_error("list host pools", &self.naming.pool_prefix))
    }

    /// Host pools whose name starts with `prefix`, resolved into stack
    /// candidates and sorted by suffix.
    ///
    /// Pools whose name does not parse into a suffix are logged and left out.
    pub async fn list_stacks_by_suffix_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<StackCandidate>, Report<StackError>> {
        let pools = self
            .backend
            .list_pools(prefix)
            .await
            .change_context_lazy(|| backend_error("list host pools", prefix))?;
        let app_groups = self.list_app_groups().await?;
        let workspaces = self.list_workspaces().await?;

        let mut candidates: Vec<StackCandidate> = pools
            .into_iter()
            .filter_map(|pool| match self.naming.pool_suffix(&pool.name) {
                Ok(suffix) => Some((suffix, pool)),
                Err(err) => {
                    warn!(pool_name = %pool.name, error = ?err, "ignoring host pool with unrecognized name");
                    None
                }
            })
            .map(|(suffix, host_pool)| {
                let app_group = app_groups
                    .iter()
                    .find(|ag| ag.kind == AppGroupKind::Desktop && ag.host_pool_id == host_pool.id)
                    .cloned();
                let workspace = app_group.as_ref().and_then(|ag| {
                    workspaces
                        .iter()
                        .find(|ws| ws.app_group_ids.contains(&ag.id))
                        .cloned()
                });
                StackCandidate {
                    suffix,
                    host_pool,
                    app_group,
                    workspace,
                }
            })
            .collect();

        candidates.sort_by(|a, b| a.suffix.cmp(&b.suffix));
        Ok(candidates)
    }

    /// Resolves the stack that owns `pool_name`.
    pub async fn resolve(&self, pool_name: &str) -> Result<StackCandidate, Report<StackError>> {
        self.list_stacks_by_suffix_prefix(pool_name)
            .await?
            .into_iter()
            .find(|candidate| candidate.host_pool.name == pool_name)
            .ok_or_else(|| {
                Report::new(StackError::MissingMember {
                    kind: ResourceKind::HostPool,
                    suffix: pool_name.to_string(),
                })
            })
    }

    /// Highest suffix in use by any pool, application group or workspace.
    ///
    /// Members orphaned by a partial creation or deletion count too, so a new
    /// stack never collides with leftovers.
    pub async fn highest_suffix(&self) -> Result<Option<Suffix>, Report<StackError>> {
        let pools = self.list_pools().await?;
        let app_groups = self.list_app_groups().await?;
        let workspaces = self.list_workspaces().await?;

        let pool_suffixes = pools
            .iter()
            .filter_map(|p| suffix_after(&p.name, &self.naming.pool_prefix).ok());
        let app_group_suffixes = app_groups
            .iter()
            .filter_map(|ag| suffix_after(&ag.name, &self.naming.app_group_prefix).ok());
        let workspace_suffixes = workspaces
            .iter()
            .filter_map(|ws| suffix_after(&ws.name, &self.naming.workspace_prefix).ok());

        Ok(pool_suffixes
            .chain(app_group_suffixes)
            .chain(workspace_suffixes)
            .max())
    }

    /// All session hosts of `pool_name`, across every page.
    pub async fn session_hosts(&self, pool_name: &str) -> Result<Vec<SessionHost>, Report<StackError>> {
        let mut hosts = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .backend
                .list_session_hosts_page(pool_name, continuation.as_deref())
                .await
                .change_context_lazy(|| backend_error("list session hosts", pool_name))?;
            hosts.extend(page.hosts);
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(hosts),
            }
        }
    }

    /// Whether `pool_name` has no session hosts. Stops at the first
    /// non-empty page; any page error aborts the scan.
    pub async fn is_empty(&self, pool_name: &str) -> Result<bool, Report<StackError>> {
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .backend
                .list_session_hosts_page(pool_name, continuation.as_deref())
                .await
                .change_context_lazy(|| backend_error("list session hosts", pool_name))?;
            if !page.hosts.is_empty() {
                return Ok(false);
            }
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(true),
            }
        }
    }

    /// Creates host pool, application group, desktop name, workspace and role
    /// assignment, in that order.
    ///
    /// A failing step aborts the whole operation. Resources created by earlier
    /// steps are left in place and show up in [`StackLifecycle::audit`].
    #[tracing::instrument(skip(self, extra_tags), fields(suffix = %suffix))]
    pub async fn create_stack(
        &self,
        suffix: &Suffix,
        extra_tags: &Tags,
    ) -> Result<Stack, Report<StackError>> {
        let step_failed = |step| StackError::CreateStep {
            step,
            suffix: suffix.to_string(),
        };

        let mut tags = self.settings.tags.clone();
        tags.extend(extra_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        tags.insert(SUFFIX_TAG.to_string(), suffix.to_string());

        let pool_name = self.naming.pool_name(suffix);
        let host_pool = self
            .backend
            .create_pool(
                &pool_name,
                &PoolProperties {
                    friendly_name: pool_name.clone(),
                    description: format!("Personal desktops, stack {suffix}"),
                    location: self.settings.location.clone(),
                    max_session_limit: self.settings.max_session_limit,
                    start_vm_on_connect: self.settings.start_vm_on_connect,
                    tags: tags.clone(),
                },
            )
            .await
            .change_context_lazy(|| step_failed(CreateStep::HostPool))?;
        debug!(pool_name = %pool_name, "created host pool");

        let app_group_name = self.naming.app_group_name(suffix);
        let app_group = self
            .backend
            .create_app_group(
                &app_group_name,
                &host_pool.id,
                &AppGroupProperties {
                    friendly_name: self.settings.desktop_friendly_name.clone(),
                    location: self.settings.location.clone(),
                    kind: AppGroupKind::Desktop,
                    tags: tags.clone(),
                },
            )
            .await
            .change_context_lazy(|| step_failed(CreateStep::AppGroup))?;
        debug!(app_group = %app_group_name, "created application group");

        self.rename_default_desktop(&app_group)
            .await
            .change_context_lazy(|| step_failed(CreateStep::RenameDesktop))?;

        let workspace_name = self.naming.workspace_name(suffix);
        let workspace = self
            .backend
            .create_workspace(
                &workspace_name,
                &app_group.id,
                &WorkspaceProperties {
                    friendly_name: self.settings.desktop_friendly_name.clone(),
                    location: self.settings.location.clone(),
                    tags,
                },
            )
            .await
            .change_context_lazy(|| step_failed(CreateStep::Workspace))?;
        debug!(workspace = %workspace_name, "created workspace");

        match &self.settings.user_group_id {
            Some(group_id) => self
                .backend
                .assign_role(&app_group.id, group_id, &self.settings.role_definition_id)
                .await
                .change_context_lazy(|| step_failed(CreateStep::RoleAssignment))?,
            None => info!("no user group configured, skipping role assignment"),
        }

        info!(pool_name = %pool_name, "created stack");
        Ok(Stack {
            suffix: suffix.clone(),
            host_pool,
            app_group,
            workspace,
        })
    }

    async fn rename_default_desktop(&self, app_group: &AppGroup) -> Result<(), Report<StackError>> {
        let desktops = self
            .backend
            .list_desktops(&app_group.name)
            .await
            .change_context_lazy(|| backend_error("list desktops", &app_group.name))?;
        let desktop = desktops.first().ok_or_else(|| {
            Report::new(StackError::MissingMember {
                kind: ResourceKind::Desktop,
                suffix: app_group.name.clone(),
            })
        })?;
        self.backend
            .update_desktop(
                &app_group.name,
                &desktop.name,
                &self.settings.desktop_friendly_name,
            )
            .await
            .change_context_lazy(|| backend_error("update desktop", &desktop.name))?;
        Ok(())
    }

    /// Deletes the stack owning `pool_name`.
    ///
    /// The pool must be empty, checked here rather than trusted from the
    /// caller. Application group and workspace are located by suffix, and
    /// both must exist before anything is deleted. Deletion order is
    /// application group, workspace, host pool; a failure leaves the rest for
    /// a later retry.
    #[tracing::instrument(skip(self))]
    pub async fn delete_stack(&self, pool_name: &str) -> Result<(), Report<StackError>> {
        let suffix = self.naming.pool_suffix(pool_name)?;

        if !self.is_empty(pool_name).await? {
            return Err(Report::new(StackError::NotEmpty {
                pool_name: pool_name.to_string(),
            }));
        }

        let app_group = self
            .list_app_groups()
            .await?
            .into_iter()
            .find(|ag| self.has_suffix(&ag.name, &self.naming.app_group_prefix, &suffix))
            .ok_or_else(|| missing(ResourceKind::AppGroup, &suffix))?;
        let workspace = self
            .list_workspaces()
            .await?
            .into_iter()
            .find(|ws| self.has_suffix(&ws.name, &self.naming.workspace_prefix, &suffix))
            .ok_or_else(|| missing(ResourceKind::Workspace, &suffix))?;

        self.backend
            .delete_app_group(&app_group.name)
            .await
            .change_context_lazy(|| delete_failed(ResourceKind::AppGroup, &app_group.name))?;
        self.backend
            .delete_workspace(&workspace.name)
            .await
            .change_context_lazy(|| delete_failed(ResourceKind::Workspace, &workspace.name))?;
        self.backend
            .delete_pool(pool_name)
            .await
            .change_context_lazy(|| delete_failed(ResourceKind::HostPool, pool_name))?;

        info!(pool_name, "deleted stack");
        Ok(())
    }

    /// Lists stacks that are only partially present or whose members are not
    /// linked to each other.
    pub async fn audit(&self) -> Result<Vec<IncompleteStack>, Report<StackError>> {
        let pools = self.list_pools().await?;
        let app_groups = self.list_app_groups().await?;
        let workspaces = self.list_workspaces().await?;

        #[derive(Default)]
        struct Members<'a> {
            pool: Option<&'a HostPool>,
            app_group: Option<&'a AppGroup>,
            workspace: Option<&'a Workspace>,
        }

        let mut by_suffix: BTreeMap<Suffix, Members<'_>> = BTreeMap::new();
        for pool in &pools {
            if let Ok(suffix) = suffix_after(&pool.name, &self.naming.pool_prefix) {
                by_suffix.entry(suffix).or_default().pool = Some(pool);
            }
        }
        for app_group in &app_groups {
            if let Ok(suffix) = suffix_after(&app_group.name, &self.naming.app_group_prefix) {
                by_suffix.entry(suffix).or_default().app_group = Some(app_group);
            }
        }
        for workspace in &workspaces {
            if let Ok(suffix) = suffix_after(&workspace.name, &self.naming.workspace_prefix) {
                by_suffix.entry(suffix).or_default().workspace = Some(workspace);
            }
        }

        let mut incomplete = Vec::new();
        for (suffix, members) in by_suffix {
            let mut problems = Vec::new();
            match (members.pool, members.app_group) {
                (Some(pool), Some(ag)) if ag.host_pool_id != pool.id => {
                    problems.push(format!("{} is not linked to {}", ag.name, pool.name));
                }
                _ => {}
            }
            match (members.app_group, members.workspace) {
                (Some(ag), Some(ws)) if !ws.app_group_ids.contains(&ag.id) => {
                    problems.push(format!("{} does not publish {}", ws.name, ag.name));
                }
                _ => {}
            }
            if members.pool.is_none() {
                problems.push("host pool missing".to_string());
            }
            if members.app_group.is_none() {
                problems.push("application group missing".to_string());
            }
            if members.workspace.is_none() {
                problems.push("workspace missing".to_string());
            }

            if !problems.is_empty() {
                incomplete.push(IncompleteStack {
                    suffix: suffix.to_string(),
                    host_pool: members.pool.map(|p| p.name.clone()),
                    app_group: members.app_group.map(|ag| ag.name.clone()),
                    workspace: members.workspace.map(|ws| ws.name.clone()),
                    problems,
                });
            }
        }
        Ok(incomplete)
    }

    fn has_suffix(&self, name: &str, prefix: &str, suffix: &Suffix) -> bool {
        suffix_after(name, prefix).is_ok_and(|found| found == *suffix)
    }

    async fn list_app_groups(&self) -> Result<Vec<AppGroup>, Report<StackError>> {
        self.backend
            .list_app_groups(&self.naming.app_group_prefix)
            .await
            .change_context_lazy(|| {
                backend_error("list application groups", &self.naming.app_group_prefix)
            })
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, Report<StackError>> {
        self.backend
            .list_workspaces(&self.naming.workspace_prefix)
            .await
            .change_context_lazy(|| backend_error("list workspaces", &self.naming.workspace_prefix))
    }
}

/// Picks the empty pools to delete: everything but the last by suffix order.
///
/// The last pool is the most recently created and the most likely to be
/// reused next, so it stays as a warm spare.
pub fn retention_victims(mut empty_pools: Vec<(Suffix, String)>) -> Vec<String> {
    empty_pools.sort_by(|a, b| a.0.cmp(&b.0));
    empty_pools.pop();
    empty_pools.into_iter().map(|(_, name)| name).collect()
}

fn backend_error(operation: &'static str, resource: &str) -> StackError {
    StackError::Backend {
        operation,
        resource: resource.to_string(),
    }
}

fn missing(kind: ResourceKind, suffix: &Suffix) -> Report<StackError> {
    Report::new(StackError::MissingMember {
        kind,
        suffix: suffix.to_string(),
    })
}

fn delete_failed(kind: ResourceKind, name: &str) -> StackError {
    StackError::DeleteStep {
        kind,
        name: name.to_string(),
    }
}
