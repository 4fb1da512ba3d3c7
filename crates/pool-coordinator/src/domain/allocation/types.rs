//! Resource records exchanged with the [`PoolBackend`](super::backend::PoolBackend).

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::name_sequencer::Suffix;

pub type Tags = BTreeMap<String, String>;

/// Built-in "Desktop Virtualization User" role definition.
pub const DESKTOP_VIRTUALIZATION_USER_ROLE: &str = "1d18fff3-a72a-46b5-b4a9-0b38a3cd7e63";

/// A host pool. `id` is its full resource path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPool {
    pub name: String,
    pub id: String,
    pub tags: Tags,
}

/// Properties used when creating a host pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolProperties {
    pub friendly_name: String,
    pub description: String,
    pub location: String,
    pub max_session_limit: u32,
    pub start_vm_on_connect: bool,
    pub tags: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppGroupKind {
    Desktop,
    RemoteApp,
}

/// An application group, linked to exactly one host pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppGroup {
    pub name: String,
    pub id: String,
    pub host_pool_id: String,
    pub kind: AppGroupKind,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppGroupProperties {
    pub friendly_name: String,
    pub location: String,
    pub kind: AppGroupKind,
    pub tags: Tags,
}

/// A workspace publishing one or more application groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub id: String,
    /// Object id clients use to address the workspace
    pub object_id: String,
    pub app_group_ids: Vec<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceProperties {
    pub friendly_name: String,
    pub location: String,
    pub tags: Tags,
}

/// The desktop resource published by a desktop application group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Desktop {
    pub name: String,
    pub id: String,
    pub object_id: String,
    pub friendly_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionHostStatus {
    Available,
    Unavailable,
    Shutdown,
    Upgrading,
    NeedsAssistance,
}

/// A VM joined to a host pool, named `<hostPoolName>/<sessionHostFQDN>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHost {
    pub name: String,
    pub assigned_user: Option<String>,
    pub status: SessionHostStatus,
}

impl SessionHost {
    /// Host name without the leading `<hostPoolName>/`.
    pub fn host_name(&self) -> &str {
        self.name
            .split_once('/')
            .map_or(self.name.as_str(), |(_, host)| host)
    }
}

/// One page of a session host listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHostPage {
    pub hosts: Vec<SessionHost>,
    /// Continuation marker for the next page, `None` on the last page
    pub continuation: Option<String>,
}

/// Join token for a host pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl RegistrationToken {
    /// Whether the token expires before `now + window`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        self.expires_at <= now + window
    }
}

/// A fully present (host pool, application group, workspace) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub suffix: Suffix,
    pub host_pool: HostPool,
    pub app_group: AppGroup,
    pub workspace: Workspace,
}

/// A host pool together with whatever linked members could be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackCandidate {
    pub suffix: Suffix,
    pub host_pool: HostPool,
    /// Desktop application group referencing the host pool
    pub app_group: Option<AppGroup>,
    /// Workspace publishing `app_group`
    pub workspace: Option<Workspace>,
}

impl StackCandidate {
    pub fn is_complete(&self) -> bool {
        self.app_group.is_some() && self.workspace.is_some()
    }
}

/// A stack that exists only in part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteStack {
    pub suffix: String,
    pub host_pool: Option<String>,
    pub app_group: Option<String>,
    pub workspace: Option<String>,
    pub problems: Vec<String>,
}

impl From<IncompleteStack> for api_types::IncompleteStackInfo {
    fn from(stack: IncompleteStack) -> Self {
        Self {
            suffix: stack.suffix,
            host_pool: stack.host_pool,
            app_group: stack.app_group,
            workspace: stack.workspace,
            problems: stack.problems,
        }
    }
}

/// Pool name and token returned by pre-registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub pool_name: String,
    pub token: RegistrationToken,
}

impl From<Registration> for api_types::RegistrationInfo {
    fn from(registration: Registration) -> Self {
        Self {
            pool_name: registration.pool_name,
            token: registration.token.token,
            expires_at: registration.token.expires_at,
        }
    }
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_session_hosts: Vec<String>,
    pub deleted_stacks: Vec<String>,
}

impl From<CleanupReport> for api_types::CleanupInfo {
    fn from(report: CleanupReport) -> Self {
        Self {
            removed_session_hosts: report.removed_session_hosts,
            deleted_stacks: report.deleted_stacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_name_strips_pool_prefix() {
        let host = SessionHost {
            name: "HP-Personal-ALPHA/desk-1.corp.example".to_string(),
            assigned_user: None,
            status: SessionHostStatus::Available,
        };
        assert_eq!(host.host_name(), "desk-1.corp.example");

        let bare = SessionHost {
            name: "desk-2".to_string(),
            ..host
        };
        assert_eq!(bare.host_name(), "desk-2");
    }

    #[test]
    fn token_window_is_inclusive() {
        let now = Utc::now();
        let window = TimeDelta::hours(24);
        let token = |expires_at| RegistrationToken {
            token: "t".to_string(),
            expires_at,
        };

        assert!(token(now + TimeDelta::hours(1)).expires_within(now, window));
        assert!(token(now + window).expires_within(now, window));
        assert!(!token(now + TimeDelta::hours(25)).expires_within(now, window));
    }
}
