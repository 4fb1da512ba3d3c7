//! In-memory [`PoolBackend`] used for local runs and tests.
//!
//! Resources get resource-manager style paths under a configurable
//! subscription and resource group, session host listings are paged, and any
//! operation can be made to fail on demand. Helper methods outside the trait
//! simulate what the VM agent and the provider do on their own, such as a
//! session host joining a pool or changing status.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use error_stack::Report;
use tracing::debug;

use crate::domain::allocation::backend::BackendResult;
use crate::domain::allocation::backend::PoolBackend;
use crate::domain::allocation::error::BackendError;
use crate::domain::allocation::error::ResourceKind;
use crate::domain::allocation::types::AppGroup;
use crate::domain::allocation::types::AppGroupKind;
use crate::domain::allocation::types::AppGroupProperties;
use crate::domain::allocation::types::Desktop;
use crate::domain::allocation::types::HostPool;
use crate::domain::allocation::types::PoolProperties;
use crate::domain::allocation::types::RegistrationToken;
use crate::domain::allocation::types::SessionHost;
use crate::domain::allocation::types::SessionHostPage;
use crate::domain::allocation::types::SessionHostStatus;
use crate::domain::allocation::types::Workspace;
use crate::domain::allocation::types::WorkspaceProperties;

const DEFAULT_DESKTOP_NAME: &str = "SessionDesktop";
const DEFAULT_PAGE_SIZE: usize = 100;

/// Backend operations, used to count calls and inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListPools,
    CreatePool,
    DeletePool,
    ListAppGroups,
    CreateAppGroup,
    DeleteAppGroup,
    ListWorkspaces,
    CreateWorkspace,
    DeleteWorkspace,
    ListDesktops,
    UpdateDesktop,
    AssignRole,
    ListSessionHosts,
    DeleteSessionHost,
    AssignUser,
    GetToken,
    RenewToken,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::ListPools => "list host pools",
            Operation::CreatePool => "create host pool",
            Operation::DeletePool => "delete host pool",
            Operation::ListAppGroups => "list application groups",
            Operation::CreateAppGroup => "create application group",
            Operation::DeleteAppGroup => "delete application group",
            Operation::ListWorkspaces => "list workspaces",
            Operation::CreateWorkspace => "create workspace",
            Operation::DeleteWorkspace => "delete workspace",
            Operation::ListDesktops => "list desktops",
            Operation::UpdateDesktop => "update desktop",
            Operation::AssignRole => "assign role",
            Operation::ListSessionHosts => "list session hosts",
            Operation::DeleteSessionHost => "delete session host",
            Operation::AssignUser => "assign user to session host",
            Operation::GetToken => "get registration token",
            Operation::RenewToken => "renew registration token",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FailurePlan {
    Always,
    Times(usize),
}

/// A recorded role assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignment {
    pub scope: String,
    pub principal_id: String,
    pub role_definition_id: String,
}

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<String, HostPool>,
    app_groups: BTreeMap<String, AppGroup>,
    workspaces: BTreeMap<String, Workspace>,
    /// app group name -> desktops
    desktops: BTreeMap<String, Vec<Desktop>>,
    /// pool name -> host name -> session host
    session_hosts: BTreeMap<String, BTreeMap<String, SessionHost>>,
    tokens: BTreeMap<String, RegistrationToken>,
    role_assignments: Vec<RoleAssignment>,
}

pub struct InMemoryPoolBackend {
    subscription_id: String,
    resource_group: String,
    page_size: usize,
    latency: Duration,
    state: Mutex<State>,
    failures: DashMap<Operation, FailurePlan>,
    calls: DashMap<Operation, usize>,
}

impl Default for InMemoryPoolBackend {
    fn default() -> Self {
        Self::new("00000000-0000-0000-0000-000000000000", "rg-personal-desktops")
    }
}

impl InMemoryPoolBackend {
    pub fn new(subscription_id: impl Into<String>, resource_group: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            page_size: DEFAULT_PAGE_SIZE,
            latency: Duration::ZERO,
            state: Mutex::new(State::default()),
            failures: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    /// Number of session hosts returned per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay applied to every backend call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes the next `times` calls of `operation` fail.
    pub fn fail_next(&self, operation: Operation, times: usize) {
        self.failures.insert(operation, FailurePlan::Times(times));
    }

    /// Makes every call of `operation` fail until cleared.
    pub fn fail_always(&self, operation: Operation) {
        self.failures.insert(operation, FailurePlan::Always);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls.get(&operation).map_or(0, |count| *count)
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.state().pools.keys().cloned().collect()
    }

    pub fn app_group_names(&self) -> Vec<String> {
        self.state().app_groups.keys().cloned().collect()
    }

    pub fn workspace_names(&self) -> Vec<String> {
        self.state().workspaces.keys().cloned().collect()
    }

    pub fn role_assignments(&self) -> Vec<RoleAssignment> {
        self.state().role_assignments.clone()
    }

    pub fn desktops(&self, app_group: &str) -> Vec<Desktop> {
        self.state()
            .desktops
            .get(app_group)
            .cloned()
            .unwrap_or_default()
    }

    pub fn session_hosts(&self, pool: &str) -> Vec<SessionHost> {
        self.state()
            .session_hosts
            .get(pool)
            .map(|hosts| hosts.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Replaces the pool's registration token.
    pub fn set_registration_token(&self, pool: &str, token: RegistrationToken) {
        self.state().tokens.insert(pool.to_string(), token);
    }

    /// Simulates the VM agent joining `pool` as `fqdn`.
    ///
    /// The pool must hold a registration token that has not expired. Returns
    /// the full session host name.
    pub fn join_session_host(
        &self,
        pool: &str,
        fqdn: &str,
        status: SessionHostStatus,
    ) -> BackendResult<String> {
        let mut state = self.state();
        if !state.pools.contains_key(pool) {
            return Err(not_found(ResourceKind::HostPool, pool));
        }
        let token_valid = state
            .tokens
            .get(pool)
            .is_some_and(|token| token.expires_at > Utc::now());
        if !token_valid {
            return Err(Report::new(BackendError::RequestFailed {
                operation: "join session host",
                resource: format!("{pool}/{fqdn}"),
            })
            .attach_printable("host pool has no unexpired registration token"));
        }

        let name = format!("{pool}/{fqdn}");
        state.session_hosts.entry(pool.to_string()).or_default().insert(
            fqdn.to_string(),
            SessionHost {
                name: name.clone(),
                assigned_user: None,
                status,
            },
        );
        Ok(name)
    }

    pub fn set_session_host_status(
        &self,
        pool: &str,
        fqdn: &str,
        status: SessionHostStatus,
    ) -> BackendResult<()> {
        let mut state = self.state();
        let host = state
            .session_hosts
            .get_mut(pool)
            .and_then(|hosts| hosts.get_mut(fqdn))
            .ok_or_else(|| not_found(ResourceKind::SessionHost, &format!("{pool}/{fqdn}")))?;
        host.status = status;
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool_id(&self, name: &str) -> String {
        self.resource_id("hostPools", name)
    }

    fn resource_id(&self, collection: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.DesktopVirtualization/{collection}/{name}",
            self.subscription_id, self.resource_group
        )
    }

    /// Records the call, applies latency and any injected failure.
    async fn enter(&self, operation: Operation, resource: &str) -> BackendResult<()> {
        *self.calls.entry(operation).or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let fail = match self.failures.get_mut(&operation) {
            Some(mut plan) => match *plan {
                FailurePlan::Always => true,
                FailurePlan::Times(0) => false,
                FailurePlan::Times(remaining) => {
                    *plan = FailurePlan::Times(remaining - 1);
                    true
                }
            },
            None => false,
        };

        if fail {
            debug!(operation = operation.name(), resource, "injected backend failure");
            return Err(Report::new(BackendError::RequestFailed {
                operation: operation.name(),
                resource: resource.to_string(),
            })
            .attach_printable("injected failure"));
        }
        Ok(())
    }
}

fn not_found(kind: ResourceKind, name: &str) -> Report<BackendError> {
    Report::new(BackendError::NotFound {
        kind,
        name: name.to_string(),
    })
}

fn conflict(kind: ResourceKind, name: &str) -> Report<BackendError> {
    Report::new(BackendError::Conflict {
        kind,
        name: name.to_string(),
    })
}

fn with_prefix<T: Clone>(items: &BTreeMap<String, T>, prefix: &str) -> Vec<T> {
    items
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .map(|(_, item)| item.clone())
        .collect()
}

#[async_trait::async_trait]
impl PoolBackend for InMemoryPoolBackend {
    async fn list_pools(&self, prefix: &str) -> BackendResult<Vec<HostPool>> {
        self.enter(Operation::ListPools, prefix).await?;
        Ok(with_prefix(&self.state().pools, prefix))
    }

    async fn create_pool(&self, name: &str, props: &PoolProperties) -> BackendResult<HostPool> {
        self.enter(Operation::CreatePool, name).await?;
        let mut state = self.state();
        if state.pools.contains_key(name) {
            return Err(conflict(ResourceKind::HostPool, name));
        }

        let pool = HostPool {
            name: name.to_string(),
            id: self.pool_id(name),
            tags: props.tags.clone(),
        };
        state.pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    async fn delete_pool(&self, name: &str) -> BackendResult<()> {
        self.enter(Operation::DeletePool, name).await?;
        let mut state = self.state();
        if state.pools.remove(name).is_none() {
            return Err(not_found(ResourceKind::HostPool, name));
        }
        state.session_hosts.remove(name);
        state.tokens.remove(name);
        Ok(())
    }

    async fn list_app_groups(&self, prefix: &str) -> BackendResult<Vec<AppGroup>> {
        self.enter(Operation::ListAppGroups, prefix).await?;
        Ok(with_prefix(&self.state().app_groups, prefix))
    }

    async fn create_app_group(
        &self,
        name: &str,
        host_pool_id: &str,
        props: &AppGroupProperties,
    ) -> BackendResult<AppGroup> {
        self.enter(Operation::CreateAppGroup, name).await?;
        let mut state = self.state();
        if state.app_groups.contains_key(name) {
            return Err(conflict(ResourceKind::AppGroup, name));
        }
        if !state.pools.values().any(|pool| pool.id == host_pool_id) {
            return Err(not_found(ResourceKind::HostPool, host_pool_id));
        }

        let app_group = AppGroup {
            name: name.to_string(),
            id: self.resource_id("applicationGroups", name),
            host_pool_id: host_pool_id.to_string(),
            kind: props.kind,
            tags: props.tags.clone(),
        };
        if props.kind == AppGroupKind::Desktop {
            let desktop = Desktop {
                name: DEFAULT_DESKTOP_NAME.to_string(),
                id: format!("{}/desktops/{DEFAULT_DESKTOP_NAME}", app_group.id),
                object_id: uuid::Uuid::new_v4().to_string(),
                friendly_name: None,
            };
            state.desktops.insert(name.to_string(), vec![desktop]);
        }
        state.app_groups.insert(name.to_string(), app_group.clone());
        Ok(app_group)
    }

    async fn delete_app_group(&self, name: &str) -> BackendResult<()> {
        self.enter(Operation::DeleteAppGroup, name).await?;
        let mut state = self.state();
        let Some(app_group) = state.app_groups.remove(name) else {
            return Err(not_found(ResourceKind::AppGroup, name));
        };
        state.desktops.remove(name);
        for workspace in state.workspaces.values_mut() {
            workspace.app_group_ids.retain(|id| *id != app_group.id);
        }
        Ok(())
    }

    async fn list_workspaces(&self, prefix: &str) -> BackendResult<Vec<Workspace>> {
        self.enter(Operation::ListWorkspaces, prefix).await?;
        Ok(with_prefix(&self.state().workspaces, prefix))
    }

    async fn create_workspace(
        &self,
        name: &str,
        app_group_id: &str,
        props: &WorkspaceProperties,
    ) -> BackendResult<Workspace> {
        self.enter(Operation::CreateWorkspace, name).await?;
        let mut state = self.state();
        if state.workspaces.contains_key(name) {
            return Err(conflict(ResourceKind::Workspace, name));
        }
        if !state
            .app_groups
            .values()
            .any(|app_group| app_group.id == app_group_id)
        {
            return Err(not_found(ResourceKind::AppGroup, app_group_id));
        }

        let workspace = Workspace {
            name: name.to_string(),
            id: self.resource_id("workspaces", name),
            object_id: uuid::Uuid::new_v4().to_string(),
            app_group_ids: vec![app_group_id.to_string()],
            tags: props.tags.clone(),
        };
        state.workspaces.insert(name.to_string(), workspace.clone());
        Ok(workspace)
    }

    async fn delete_workspace(&self, name: &str) -> BackendResult<()> {
        self.enter(Operation::DeleteWorkspace, name).await?;
        if self.state().workspaces.remove(name).is_none() {
            return Err(not_found(ResourceKind::Workspace, name));
        }
        Ok(())
    }

    async fn list_desktops(&self, app_group: &str) -> BackendResult<Vec<Desktop>> {
        self.enter(Operation::ListDesktops, app_group).await?;
        let state = self.state();
        if !state.app_groups.contains_key(app_group) {
            return Err(not_found(ResourceKind::AppGroup, app_group));
        }
        Ok(state.desktops.get(app_group).cloned().unwrap_or_default())
    }

    async fn update_desktop(
        &self,
        app_group: &str,
        desktop: &str,
        friendly_name: &str,
    ) -> BackendResult<Desktop> {
        self.enter(Operation::UpdateDesktop, desktop).await?;
        let mut state = self.state();
        let entry = state
            .desktops
            .get_mut(app_group)
            .and_then(|desktops| desktops.iter_mut().find(|d| d.name == desktop))
            .ok_or_else(|| not_found(ResourceKind::Desktop, &format!("{app_group}/{desktop}")))?;
        entry.friendly_name = Some(friendly_name.to_string());
        Ok(entry.clone())
    }

    async fn assign_role(
        &self,
        scope: &str,
        principal_id: &str,
        role_definition_id: &str,
    ) -> BackendResult<()> {
        self.enter(Operation::AssignRole, scope).await?;
        let mut state = self.state();
        let assignment = RoleAssignment {
            scope: scope.to_string(),
            principal_id: principal_id.to_string(),
            role_definition_id: role_definition_id.to_string(),
        };
        if state.role_assignments.contains(&assignment) {
            return Err(conflict(ResourceKind::RoleAssignment, scope));
        }
        state.role_assignments.push(assignment);
        Ok(())
    }

    async fn list_session_hosts_page(
        &self,
        pool: &str,
        continuation: Option<&str>,
    ) -> BackendResult<SessionHostPage> {
        self.enter(Operation::ListSessionHosts, pool).await?;
        let offset = match continuation {
            Some(marker) => marker.parse::<usize>().map_err(|_| {
                Report::new(BackendError::RequestFailed {
                    operation: Operation::ListSessionHosts.name(),
                    resource: pool.to_string(),
                })
                .attach_printable(format!("malformed continuation marker `{marker}`"))
            })?,
            None => 0,
        };

        let state = self.state();
        if !state.pools.contains_key(pool) {
            return Err(not_found(ResourceKind::HostPool, pool));
        }
        let all: Vec<SessionHost> = state
            .session_hosts
            .get(pool)
            .map(|hosts| hosts.values().cloned().collect())
            .unwrap_or_default();

        let end = (offset + self.page_size).min(all.len());
        let hosts = all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let continuation = (end < all.len()).then(|| end.to_string());
        Ok(SessionHostPage {
            hosts,
            continuation,
        })
    }

    async fn delete_session_host(&self, pool: &str, host_name: &str) -> BackendResult<()> {
        self.enter(Operation::DeleteSessionHost, host_name).await?;
        let removed = self
            .state()
            .session_hosts
            .get_mut(pool)
            .and_then(|hosts| hosts.remove(host_name));
        match removed {
            Some(_) => Ok(()),
            None => Err(not_found(
                ResourceKind::SessionHost,
                &format!("{pool}/{host_name}"),
            )),
        }
    }

    async fn assign_user_to_session_host(
        &self,
        pool: &str,
        host_name: &str,
        user_id: &str,
    ) -> BackendResult<()> {
        self.enter(Operation::AssignUser, host_name).await?;
        let mut state = self.state();
        let host = state
            .session_hosts
            .get_mut(pool)
            .and_then(|hosts| hosts.get_mut(host_name))
            .ok_or_else(|| {
                not_found(ResourceKind::SessionHost, &format!("{pool}/{host_name}"))
            })?;
        host.assigned_user = Some(user_id.to_string());
        Ok(())
    }

    async fn get_registration_token(&self, pool: &str) -> BackendResult<Option<RegistrationToken>> {
        self.enter(Operation::GetToken, pool).await?;
        let state = self.state();
        if !state.pools.contains_key(pool) {
            return Err(not_found(ResourceKind::HostPool, pool));
        }
        Ok(state.tokens.get(pool).cloned())
    }

    async fn renew_registration_token(
        &self,
        pool: &str,
        expires_at: DateTime<Utc>,
    ) -> BackendResult<()> {
        self.enter(Operation::RenewToken, pool).await?;
        let mut state = self.state();
        if !state.pools.contains_key(pool) {
            return Err(not_found(ResourceKind::HostPool, pool));
        }
        state.tokens.insert(
            pool.to_string(),
            RegistrationToken {
                token: uuid::Uuid::new_v4().to_string(),
                expires_at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use similar_asserts::assert_eq;

    use super::*;

    fn pool_props() -> PoolProperties {
        PoolProperties {
            location: "westeurope".to_string(),
            ..PoolProperties::default()
        }
    }

    #[tokio::test]
    async fn session_hosts_are_paged() {
        let backend = InMemoryPoolBackend::default().with_page_size(2);
        backend
            .create_pool("HP-Personal-ALPHA", &pool_props())
            .await
            .unwrap();
        backend
            .renew_registration_token("HP-Personal-ALPHA", Utc::now() + TimeDelta::hours(48))
            .await
            .unwrap();
        for i in 0..5 {
            backend
                .join_session_host(
                    "HP-Personal-ALPHA",
                    &format!("desk-{i}.corp.example"),
                    SessionHostStatus::Available,
                )
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = backend
                .list_session_hosts_page("HP-Personal-ALPHA", continuation.as_deref())
                .await
                .unwrap();
            assert!(page.hosts.len() <= 2);
            seen.extend(page.hosts.into_iter().map(|h| h.host_name().to_string()));
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 5);
        assert_eq!(backend.call_count(Operation::ListSessionHosts), 3);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = InMemoryPoolBackend::default();
        backend.fail_next(Operation::ListPools, 2);

        assert!(backend.list_pools("HP-").await.is_err());
        assert!(backend.list_pools("HP-").await.is_err());
        assert!(backend.list_pools("HP-").await.is_ok());
        assert_eq!(backend.call_count(Operation::ListPools), 3);
    }

    #[tokio::test]
    async fn app_group_requires_existing_pool() {
        let backend = InMemoryPoolBackend::default();
        let err = backend
            .create_app_group(
                "AG-Personal-ALPHA",
                "/subscriptions/x/hostPools/missing",
                &AppGroupProperties {
                    friendly_name: "Desktop".to_string(),
                    location: "westeurope".to_string(),
                    kind: AppGroupKind::Desktop,
                    tags: Default::default(),
                },
            )
            .await
            .expect_err("pool does not exist");
        assert!(matches!(
            err.current_context(),
            BackendError::NotFound {
                kind: ResourceKind::HostPool,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn join_requires_unexpired_token() {
        let backend = InMemoryPoolBackend::default();
        backend
            .create_pool("HP-Personal-ALPHA", &pool_props())
            .await
            .unwrap();

        assert!(backend
            .join_session_host("HP-Personal-ALPHA", "desk", SessionHostStatus::Available)
            .is_err());

        backend.set_registration_token(
            "HP-Personal-ALPHA",
            RegistrationToken {
                token: "expired".to_string(),
                expires_at: Utc::now() - TimeDelta::minutes(1),
            },
        );
        assert!(backend
            .join_session_host("HP-Personal-ALPHA", "desk", SessionHostStatus::Available)
            .is_err());
    }
}
