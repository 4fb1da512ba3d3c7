//! Shared API type definitions
//!
//! This crate contains the wire types exchanged between the pool coordinator
//! and its callers: the virtual machine record handed in by the provisioning
//! pipeline, registration results, and the response envelope used by every
//! HTTP endpoint.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Operating system declared for a virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
pub enum OsType {
    Windows,
    Linux,
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::str::FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Ok(OsType::Windows),
            "linux" => Ok(OsType::Linux),
            other => Err(format!("unknown OS type `{other}`")),
        }
    }
}

/// A virtual machine that is about to join, or has joined, a host pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    /// Stable VM identifier; session host names contain it
    pub id: String,
    /// Display name of the VM
    pub name: String,
    /// Fully qualified host name the VM agent registers with
    pub fqdn: String,
    /// Declared operating system
    pub os: OsType,
    /// User the desktop is provisioned for
    pub user_id: String,
    /// Client connection URL, filled in once the VM is assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_url: Option<String>,
    /// Free-form tags carried through from the provisioning request
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Result of a successful pre-registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Host pool the VM must join
    pub pool_name: String,
    /// Registration token for the VM agent
    pub token: String,
    /// Token expiry
    pub expires_at: DateTime<Utc>,
}

/// Outcome of cleaning up after a VM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupInfo {
    /// Session hosts removed, as `<pool>/<fqdn>`
    pub removed_session_hosts: Vec<String>,
    /// Host pools whose stacks were deleted
    pub deleted_stacks: Vec<String>,
}

/// A stack that is only partially present in the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteStackInfo {
    /// Shared name suffix
    pub suffix: String,
    /// Host pool name if the pool exists
    pub host_pool: Option<String>,
    /// Application group name if it exists
    pub app_group: Option<String>,
    /// Workspace name if it exists
    pub workspace: Option<String>,
    /// Human readable reasons the stack is incomplete
    pub problems: Vec<String>,
}

/// Response envelope for every coordinator endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Payload (present when successful)
    pub data: Option<T>,
    /// Response message
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}
