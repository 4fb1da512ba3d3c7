//! Error types for the allocation core.
//!
//! Every fallible operation returns an [`error_stack::Report`] over one of the
//! enums below; lower layers are re-contextualized with `change_context` as
//! the error moves up toward the coordinator.

use core::error::Error;

use api_types::OsType;

/// Kind of remote resource a backend call touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ResourceKind {
    #[display("host pool")]
    HostPool,
    #[display("application group")]
    AppGroup,
    #[display("workspace")]
    Workspace,
    #[display("desktop")]
    Desktop,
    #[display("session host")]
    SessionHost,
    #[display("role assignment")]
    RoleAssignment,
    #[display("registration token")]
    RegistrationToken,
}

/// Errors reported by a [`PoolBackend`](super::backend::PoolBackend).
#[derive(Debug, derive_more::Display)]
pub enum BackendError {
    #[display("{kind} `{name}` not found")]
    NotFound { kind: ResourceKind, name: String },
    #[display("{kind} `{name}` already exists")]
    Conflict { kind: ResourceKind, name: String },
    #[display("backend request `{operation}` failed for `{resource}`")]
    RequestFailed {
        operation: &'static str,
        resource: String,
    },
}

impl Error for BackendError {}

/// Errors produced while computing stack name suffixes.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum NamingError {
    #[display("`{word}` in suffix `{suffix}` is not a phonetic alphabet word")]
    UnknownWord { word: String, suffix: String },
    #[display("suffix after `{suffix}` would exceed {max_segments} segment(s)")]
    SegmentLimit { suffix: String, max_segments: usize },
    #[display("maximum segment count must be at least 1")]
    InvalidLimit,
}

impl Error for NamingError {}

/// Errors fetching or renewing registration tokens.
#[derive(Debug, derive_more::Display)]
pub enum TokenError {
    #[display("no valid registration token for host pool `{pool_name}` after {attempts} attempt(s)")]
    Exhausted { pool_name: String, attempts: u32 },
    #[display("registration token for host pool `{pool_name}` is missing or expires within the safety window")]
    NotUsable { pool_name: String },
    #[display("backend `{operation}` failed for host pool `{pool_name}`")]
    Backend {
        operation: &'static str,
        pool_name: String,
    },
}

impl Error for TokenError {}

/// Step of stack creation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CreateStep {
    #[display("create host pool")]
    HostPool,
    #[display("create application group")]
    AppGroup,
    #[display("rename default desktop")]
    RenameDesktop,
    #[display("create workspace")]
    Workspace,
    #[display("assign user group role")]
    RoleAssignment,
}

/// Errors creating, inspecting or deleting a stack.
#[derive(Debug, derive_more::Display)]
pub enum StackError {
    #[display("stack `{suffix}` creation failed at step `{step}`; earlier steps were not rolled back")]
    CreateStep { step: CreateStep, suffix: String },
    #[display("host pool `{pool_name}` still has session hosts")]
    NotEmpty { pool_name: String },
    #[display("`{name}` does not start with the expected prefix `{prefix}`")]
    NameMismatch { name: String, prefix: String },
    #[display("no {kind} found for stack suffix `{suffix}`")]
    MissingMember { kind: ResourceKind, suffix: String },
    #[display("failed to delete {kind} `{name}`")]
    DeleteStep { kind: ResourceKind, name: String },
    #[display("backend `{operation}` failed for `{resource}`")]
    Backend {
        operation: &'static str,
        resource: String,
    },
}

impl Error for StackError {}

/// Errors surfaced by the [`AllocationCoordinator`](super::coordinator::AllocationCoordinator).
#[derive(Debug, derive_more::Display)]
pub enum AllocationError {
    #[display("VM `{vm_id}` declares unsupported OS `{os}`")]
    UnsupportedOs { vm_id: String, os: OsType },
    #[display("failed to select or create a host pool for VM `{vm_id}`")]
    PoolSelection { vm_id: String },
    #[display("failed to obtain a registration token for VM `{vm_id}` in host pool `{pool_name}`")]
    Token { vm_id: String, pool_name: String },
    #[display("VM `{vm_id}` did not become available in host pool `{pool_name}` within {waited_secs}s")]
    Timeout {
        vm_id: String,
        pool_name: String,
        waited_secs: u64,
    },
    #[display("waiting for VM `{vm_id}` in host pool `{pool_name}` was cancelled")]
    Cancelled { vm_id: String, pool_name: String },
    #[display("failed to assign VM `{vm_id}` in host pool `{pool_name}` to its user")]
    Assignment { vm_id: String, pool_name: String },
    #[display("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[display("cleanup for VM `{vm_id}` failed")]
    Cleanup { vm_id: String },
    #[display("stack audit failed")]
    Audit,
}

impl Error for AllocationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let not_found = BackendError::NotFound {
            kind: ResourceKind::AppGroup,
            name: "AG-Personal-ALPHA".to_string(),
        };
        assert_eq!(
            not_found.to_string(),
            "application group `AG-Personal-ALPHA` not found"
        );

        let create = StackError::CreateStep {
            step: CreateStep::Workspace,
            suffix: "BRAVO".to_string(),
        };
        assert_eq!(
            create.to_string(),
            "stack `BRAVO` creation failed at step `create workspace`; earlier steps were not rolled back"
        );

        let exhausted = TokenError::Exhausted {
            pool_name: "HP-Personal-ALPHA".to_string(),
            attempts: 3,
        };
        assert_eq!(
            exhausted.to_string(),
            "no valid registration token for host pool `HP-Personal-ALPHA` after 3 attempt(s)"
        );

        let timeout = AllocationError::Timeout {
            vm_id: "vm-1".to_string(),
            pool_name: "HP-Personal-ALPHA".to_string(),
            waited_secs: 1200,
        };
        assert_eq!(
            timeout.to_string(),
            "VM `vm-1` did not become available in host pool `HP-Personal-ALPHA` within 1200s"
        );
    }
}
