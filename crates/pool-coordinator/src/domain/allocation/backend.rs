//! Narrow interface to the virtual desktop service.
//!
//! Implementations wrap the provider SDK; the allocation core never talks to
//! the provider directly. Every call is assumed slow and fallible.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;

use super::error::BackendError;
use super::types::AppGroup;
use super::types::AppGroupProperties;
use super::types::Desktop;
use super::types::HostPool;
use super::types::PoolProperties;
use super::types::RegistrationToken;
use super::types::SessionHostPage;
use super::types::Workspace;
use super::types::WorkspaceProperties;

pub type BackendResult<T> = Result<T, Report<BackendError>>;

#[async_trait::async_trait]
pub trait PoolBackend: Send + Sync {
    /// Host pools whose name starts with `prefix`.
    async fn list_pools(&self, prefix: &str) -> BackendResult<Vec<HostPool>>;

    async fn create_pool(&self, name: &str, props: &PoolProperties) -> BackendResult<HostPool>;

    async fn delete_pool(&self, name: &str) -> BackendResult<()>;

    /// Application groups whose name starts with `prefix`.
    async fn list_app_groups(&self, prefix: &str) -> BackendResult<Vec<AppGroup>>;

    /// Creates an application group bound to the host pool at `host_pool_id`.
    async fn create_app_group(
        &self,
        name: &str,
        host_pool_id: &str,
        props: &AppGroupProperties,
    ) -> BackendResult<AppGroup>;

    async fn delete_app_group(&self, name: &str) -> BackendResult<()>;

    /// Workspaces whose name starts with `prefix`.
    async fn list_workspaces(&self, prefix: &str) -> BackendResult<Vec<Workspace>>;

    /// Creates a workspace publishing the application group at `app_group_id`.
    async fn create_workspace(
        &self,
        name: &str,
        app_group_id: &str,
        props: &WorkspaceProperties,
    ) -> BackendResult<Workspace>;

    async fn delete_workspace(&self, name: &str) -> BackendResult<()>;

    async fn list_desktops(&self, app_group: &str) -> BackendResult<Vec<Desktop>>;

    async fn update_desktop(
        &self,
        app_group: &str,
        desktop: &str,
        friendly_name: &str,
    ) -> BackendResult<Desktop>;

    /// Grants `role_definition_id` to `principal_id` on the resource at `scope`.
    async fn assign_role(
        &self,
        scope: &str,
        principal_id: &str,
        role_definition_id: &str,
    ) -> BackendResult<()>;

    /// One page of the session hosts in `pool`. Pass the previous page's
    /// continuation marker to fetch the next one.
    async fn list_session_hosts_page(
        &self,
        pool: &str,
        continuation: Option<&str>,
    ) -> BackendResult<SessionHostPage>;

    /// Removes a session host; `host_name` is the name without the pool prefix.
    async fn delete_session_host(&self, pool: &str, host_name: &str) -> BackendResult<()>;

    async fn assign_user_to_session_host(
        &self,
        pool: &str,
        host_name: &str,
        user_id: &str,
    ) -> BackendResult<()>;

    /// The current registration token, if the pool has one.
    async fn get_registration_token(&self, pool: &str) -> BackendResult<Option<RegistrationToken>>;

    /// Issues a new registration token valid until `expires_at`.
    async fn renew_registration_token(
        &self,
        pool: &str,
        expires_at: DateTime<Utc>,
    ) -> BackendResult<()>;
}

pub type SharedBackend = Arc<dyn PoolBackend>;
