use std::sync::Arc;

use api_types::ApiResponse;
use api_types::CleanupInfo;
use api_types::IncompleteStackInfo;
use api_types::RegistrationInfo;
use api_types::VirtualMachine;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::error_response;
use crate::domain::allocation::AllocationCoordinator;

/// Pick a host pool for a VM and hand out its registration token
#[handler]
pub async fn pre_register(
    Data(coordinator): Data<&Arc<AllocationCoordinator>>,
    Json(vm): Json<VirtualMachine>,
) -> poem::Result<Json<ApiResponse<RegistrationInfo>>> {
    info!(vm_id = %vm.id, user_id = %vm.user_id, "pre-registration requested");

    let registration = coordinator.pre_register(&vm).await.map_err(error_response)?;
    let message = format!("VM {} may join host pool {}", vm.id, registration.pool_name);
    Ok(Json(ApiResponse::ok(registration.into(), message)))
}

/// Wait for a pre-registered VM to join its host pool, then assign it
#[handler]
pub async fn post_register(
    Path(pool_name): Path<String>,
    Data(coordinator): Data<&Arc<AllocationCoordinator>>,
    Data(shutdown): Data<&CancellationToken>,
    Json(vm): Json<VirtualMachine>,
) -> poem::Result<Json<ApiResponse<VirtualMachine>>> {
    info!(vm_id = %vm.id, pool_name = %pool_name, "post-registration requested");

    let registered = coordinator
        .post_register(&vm, &pool_name, shutdown)
        .await
        .map_err(error_response)?;
    let message = format!("VM {} assigned to user {}", registered.id, registered.user_id);
    Ok(Json(ApiResponse::ok(registered, message)))
}

/// Remove a VM's session hosts and surplus empty stacks
#[handler]
pub async fn cleanup(
    Path(vm_id): Path<String>,
    Data(coordinator): Data<&Arc<AllocationCoordinator>>,
) -> poem::Result<Json<ApiResponse<CleanupInfo>>> {
    info!(vm_id = %vm_id, "cleanup requested");

    let report = coordinator.cleanup(&vm_id).await.map_err(error_response)?;
    let message = format!(
        "removed {} session host(s), deleted {} stack(s)",
        report.removed_session_hosts.len(),
        report.deleted_stacks.len()
    );
    Ok(Json(ApiResponse::ok(report.into(), message)))
}

/// List stacks that exist only in part
#[handler]
pub async fn audit(
    Data(coordinator): Data<&Arc<AllocationCoordinator>>,
) -> poem::Result<Json<ApiResponse<Vec<IncompleteStackInfo>>>> {
    let incomplete: Vec<IncompleteStackInfo> = coordinator
        .audit()
        .await
        .map_err(error_response)?
        .into_iter()
        .map(Into::into)
        .collect();
    let message = format!("{} incomplete stack(s)", incomplete.len());
    Ok(Json(ApiResponse::ok(incomplete, message)))
}

#[handler]
pub fn healthz() -> &'static str {
    "ok"
}
