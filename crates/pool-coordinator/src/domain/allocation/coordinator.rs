//! Assignment of personal desktops to host pools.
//!
//! A registration runs in two phases. [`AllocationCoordinator::pre_register`]
//! picks (or creates) a host pool for the VM's user, reserves it and hands out
//! a registration token. Once the VM agent has used that token,
//! [`AllocationCoordinator::post_register`] waits for the session host to come
//! up, assigns it to the user and returns the connection link.
//! [`AllocationCoordinator::cleanup`] removes a VM's session hosts and tears
//! down surplus empty stacks.
//!
//! Pool selection, stack creation and cleanup are serialized by one
//! process-wide mutex. Token retrieval and the registration wait run outside
//! it.

use std::time::Duration;

use api_types::OsType;
use api_types::VirtualMachine;
use error_stack::Report;
use error_stack::ResultExt;
use futures::future::try_join_all;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::backend::SharedBackend;
use super::connection::connection_url;
use super::error::AllocationError;
use super::error::ResourceKind;
use super::error::StackError;
use super::lock_registry::PoolLockRegistry;
use super::name_sequencer::Suffix;
use super::stack_lifecycle::retention_victims;
use super::stack_lifecycle::StackLifecycle;
use super::token_manager::RegistrationTokenManager;
use super::types::CleanupReport;
use super::types::IncompleteStack;
use super::types::Registration;
use super::types::SessionHost;
use super::types::SessionHostStatus;
use crate::config::CoordinatorConfig;

/// Admission and wait settings for registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationPolicy {
    pub supported_os: OsType,
    /// Interval between session host listings while waiting for a VM
    pub poll_interval: Duration,
    /// How long a VM may take to show up as available
    pub registration_timeout: Duration,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self {
            supported_os: OsType::Windows,
            poll_interval: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(20 * 60),
        }
    }
}

pub struct AllocationCoordinator {
    backend: SharedBackend,
    stacks: StackLifecycle,
    tokens: RegistrationTokenManager,
    locks: PoolLockRegistry,
    stack_mutex: Mutex<()>,
    policy: RegistrationPolicy,
}

impl AllocationCoordinator {
    pub fn new(backend: SharedBackend, config: CoordinatorConfig) -> Self {
        Self {
            stacks: StackLifecycle::new(backend.clone(), config.naming, config.stack),
            tokens: RegistrationTokenManager::new(backend.clone(), config.token),
            locks: PoolLockRegistry::new(),
            stack_mutex: Mutex::new(()),
            policy: config.registration,
            backend,
        }
    }

    pub fn locks(&self) -> &PoolLockRegistry {
        &self.locks
    }

    pub fn stacks(&self) -> &StackLifecycle {
        &self.stacks
    }

    /// Chooses a host pool for `vm` and returns a token the VM can join it
    /// with.
    ///
    /// On success the (user, pool) reservation stays held until
    /// [`post_register`](Self::post_register) finishes.
    #[tracing::instrument(skip(self, vm), fields(vm_id = %vm.id, user_id = %vm.user_id))]
    pub async fn pre_register(
        &self,
        vm: &VirtualMachine,
    ) -> Result<Registration, Report<AllocationError>> {
        validate(vm)?;
        if vm.os != self.policy.supported_os {
            return Err(Report::new(AllocationError::UnsupportedOs {
                vm_id: vm.id.clone(),
                os: vm.os,
            }));
        }

        let pool_name = {
            let _stack_guard = self.stack_mutex.lock().await;
            self.reserve_pool(vm).await?
        };

        // Released if the token fetch fails or this future is dropped.
        let reservation = self.locks.release_on_drop(&vm.user_id, &pool_name);
        let token = self
            .tokens
            .get_valid_token(&pool_name)
            .await
            .change_context_lazy(|| AllocationError::Token {
                vm_id: vm.id.clone(),
                pool_name: pool_name.clone(),
            })?;
        reservation.disarm();

        info!(pool_name = %pool_name, "host pool ready for registration");
        Ok(Registration { pool_name, token })
    }

    /// Picks the first complete stack the user has no desktop in and can
    /// reserve, or creates the next stack. Caller holds the stack mutex.
    async fn reserve_pool(&self, vm: &VirtualMachine) -> Result<String, Report<AllocationError>> {
        let selection_failed = || AllocationError::PoolSelection { vm_id: vm.id.clone() };
        let user_id = vm.user_id.as_str();

        let candidates = self
            .stacks
            .list_stacks_by_suffix_prefix(&self.stacks.naming().pool_prefix)
            .await
            .change_context_lazy(selection_failed)?;

        for candidate in candidates {
            let pool_name = candidate.host_pool.name.as_str();
            if !candidate.is_complete() {
                warn!(pool_name, "skipping host pool without linked application group and workspace");
                continue;
            }
            let has_desktop = self
                .stacks
                .session_hosts(pool_name)
                .await
                .change_context_lazy(selection_failed)?
                .iter()
                .any(|host| host.assigned_user.as_deref() == Some(user_id));
            if has_desktop {
                debug!(pool_name, "user already has a desktop in host pool");
                continue;
            }
            if self.locks.try_acquire(user_id, pool_name) {
                info!(pool_name, "reserved existing host pool");
                return Ok(pool_name.to_string());
            }
        }

        let suffix = match self
            .stacks
            .highest_suffix()
            .await
            .change_context_lazy(selection_failed)?
        {
            Some(highest) => highest
                .successor(self.stacks.naming().max_segments)
                .change_context_lazy(selection_failed)?,
            None => Suffix::first(),
        };

        let stack = self
            .stacks
            .create_stack(&suffix, &vm.tags)
            .await
            .change_context_lazy(selection_failed)?;
        let pool_name = stack.host_pool.name;
        self.locks.force_acquire(user_id, &pool_name);
        info!(pool_name = %pool_name, "reserved newly created host pool");
        Ok(pool_name)
    }

    /// Waits for `vm` to join `pool_name`, assigns it to its user and returns
    /// the VM with its connection link.
    ///
    /// The (user, pool) reservation is released however this returns.
    #[tracing::instrument(skip(self, vm, cancel), fields(vm_id = %vm.id, user_id = %vm.user_id))]
    pub async fn post_register(
        &self,
        vm: &VirtualMachine,
        pool_name: &str,
        cancel: &CancellationToken,
    ) -> Result<VirtualMachine, Report<AllocationError>> {
        let _reservation = self.locks.release_on_drop(&vm.user_id, pool_name);
        validate(vm)?;

        let host = self.wait_until_available(vm, pool_name, cancel).await?;

        let assignment_failed = || AllocationError::Assignment {
            vm_id: vm.id.clone(),
            pool_name: pool_name.to_string(),
        };

        self.backend
            .assign_user_to_session_host(pool_name, host.host_name(), &vm.user_id)
            .await
            .change_context_lazy(assignment_failed)?;
        info!(pool_name, session_host = %host.name, "assigned session host to user");

        let stack = self
            .stacks
            .resolve(pool_name)
            .await
            .change_context_lazy(assignment_failed)?;
        let kind = if stack.app_group.is_none() {
            ResourceKind::AppGroup
        } else {
            ResourceKind::Workspace
        };
        let (Some(app_group), Some(workspace)) = (stack.app_group, stack.workspace) else {
            return Err(Report::new(StackError::MissingMember {
                kind,
                suffix: stack.suffix.to_string(),
            })
            .change_context(assignment_failed()));
        };
        let desktops = self
            .backend
            .list_desktops(&app_group.name)
            .await
            .change_context_lazy(assignment_failed)?;
        let Some(desktop) = desktops.first() else {
            return Err(Report::new(StackError::MissingMember {
                kind: ResourceKind::Desktop,
                suffix: stack.suffix.to_string(),
            })
            .change_context(assignment_failed()));
        };

        let url = connection_url(&workspace.object_id, &desktop.object_id, &vm.user_id)?;
        Ok(VirtualMachine {
            connection_url: Some(url.to_string()),
            ..vm.clone()
        })
    }

    async fn wait_until_available(
        &self,
        vm: &VirtualMachine,
        pool_name: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionHost, Report<AllocationError>> {
        let expected = format!("{pool_name}/{}", vm.fqdn);
        let timeout = self.policy.registration_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(Report::new(AllocationError::Cancelled {
                        vm_id: vm.id.clone(),
                        pool_name: pool_name.to_string(),
                    }));
                }
                () = &mut deadline => {
                    return Err(Report::new(AllocationError::Timeout {
                        vm_id: vm.id.clone(),
                        pool_name: pool_name.to_string(),
                        waited_secs: timeout.as_secs(),
                    }));
                }
                _ = ticker.tick() => {}
            }

            match self.stacks.session_hosts(pool_name).await {
                Ok(hosts) => {
                    let found = hosts
                        .into_iter()
                        .find(|host| host.name.eq_ignore_ascii_case(&expected));
                    match found {
                        Some(host) if host.status == SessionHostStatus::Available => return Ok(host),
                        Some(host) => debug!(session_host = %host.name, status = ?host.status, "session host not available yet"),
                        None => debug!(session_host = %expected, "session host not registered yet"),
                    }
                }
                Err(err) => warn!(pool_name, error = ?err, "failed to list session hosts, retrying"),
            }
        }
    }

    /// Removes the session hosts belonging to `vm_id`, then deletes
    /// all empty stacks except the last one by suffix order.
    ///
    /// Host pools with a registration in flight count as occupied.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self, vm_id: &str) -> Result<CleanupReport, Report<AllocationError>> {
        if vm_id.trim().is_empty() {
            return Err(Report::new(AllocationError::InvalidRequest {
                reason: "VM id must not be empty".to_string(),
            }));
        }
        let cleanup_failed = || AllocationError::Cleanup {
            vm_id: vm_id.to_string(),
        };

        let _stack_guard = self.stack_mutex.lock().await;
        let mut report = CleanupReport::default();

        let pools = self.stacks.list_pools().await.change_context_lazy(cleanup_failed)?;
        for pool in &pools {
            let hosts = self
                .stacks
                .session_hosts(&pool.name)
                .await
                .change_context_lazy(cleanup_failed)?;
            for host in hosts.iter().filter(|host| is_host_of(host, vm_id)) {
                self.backend
                    .delete_session_host(&pool.name, host.host_name())
                    .await
                    .change_context_lazy(cleanup_failed)?;
                info!(pool_name = %pool.name, session_host = %host.name, "removed session host");
                report.removed_session_hosts.push(host.name.clone());
            }
        }

        let emptiness = try_join_all(pools.iter().map(|pool| self.stacks.is_empty(&pool.name)))
            .await
            .change_context_lazy(cleanup_failed)?;

        let empty_pools = pools
            .iter()
            .zip(emptiness)
            .filter(|(_, empty)| *empty)
            .filter(|(pool, _)| {
                let reserved = self.locks.is_pool_reserved(&pool.name);
                if reserved {
                    debug!(pool_name = %pool.name, "keeping empty host pool with a registration in flight");
                }
                !reserved
            })
            .filter_map(|(pool, _)| {
                self.stacks
                    .naming()
                    .pool_suffix(&pool.name)
                    .ok()
                    .map(|suffix| (suffix, pool.name.clone()))
            })
            .collect();

        for pool_name in retention_victims(empty_pools) {
            self.stacks
                .delete_stack(&pool_name)
                .await
                .change_context_lazy(cleanup_failed)?;
            report.deleted_stacks.push(pool_name);
        }

        info!(
            removed_session_hosts = report.removed_session_hosts.len(),
            deleted_stacks = report.deleted_stacks.len(),
            "cleanup finished"
        );
        Ok(report)
    }

    /// Stacks that exist only in part.
    pub async fn audit(&self) -> Result<Vec<IncompleteStack>, Report<AllocationError>> {
        self.stacks
            .audit()
            .await
            .change_context(AllocationError::Audit)
    }
}

/// Whether `host` is the VM `vm_id`: its host name is the id itself or an
/// FQDN whose first label is the id.
fn is_host_of(host: &SessionHost, vm_id: &str) -> bool {
    let host_name = host.host_name();
    let first_label = host_name.split_once('.').map_or(host_name, |(label, _)| label);
    first_label.eq_ignore_ascii_case(vm_id)
}

fn validate(vm: &VirtualMachine) -> Result<(), Report<AllocationError>> {
    let missing = [
        ("id", vm.id.as_str()),
        ("user_id", vm.user_id.as_str()),
        ("fqdn", vm.fqdn.as_str()),
    ]
    .into_iter()
    .find(|(_, value)| value.trim().is_empty());

    match missing {
        Some((field, _)) => Err(Report::new(AllocationError::InvalidRequest {
            reason: format!("VM field `{field}` must not be empty"),
        })),
        None => Ok(()),
    }
}
