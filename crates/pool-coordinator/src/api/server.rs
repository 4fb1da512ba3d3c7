use std::sync::Arc;

use error_stack::Report;
use poem::delete;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::handlers;
use super::ApiError;
use crate::domain::allocation::AllocationCoordinator;

/// Builds the coordinator routes.
///
/// `shutdown` is handed to waiting post-registrations so they end with
/// "service unavailable" when the server stops.
pub fn routes(
    coordinator: Arc<AllocationCoordinator>,
    shutdown: CancellationToken,
) -> impl Endpoint {
    Route::new()
        .at("/api/v1/registrations", post(handlers::pre_register))
        .at(
            "/api/v1/registrations/:pool_name/complete",
            post(handlers::post_register),
        )
        .at("/api/v1/vms/:vm_id", delete(handlers::cleanup))
        .at("/api/v1/stacks/audit", get(handlers::audit))
        .at("/healthz", get(handlers::healthz))
        .data(coordinator)
        .data(shutdown)
        .with(Tracing)
}

/// HTTP API server for the allocation coordinator
pub struct ApiServer {
    coordinator: Arc<AllocationCoordinator>,
    listen_addr: String,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(
        coordinator: Arc<AllocationCoordinator>,
        listen_addr: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            listen_addr,
            shutdown,
        }
    }

    /// Start the API server
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.coordinator, self.shutdown.clone());
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = &mut shutdown_rx => {
                info!("API server shutdown requested");
                self.shutdown.cancel();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_types::ApiResponse;
    use api_types::CleanupInfo;
    use api_types::IncompleteStackInfo;
    use api_types::OsType;
    use api_types::RegistrationInfo;
    use api_types::VirtualMachine;
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::domain::allocation::types::SessionHostStatus;
    use crate::domain::allocation::RegistrationPolicy;
    use crate::domain::allocation::TokenPolicy;
    use crate::infrastructure::memory_backend::InMemoryPoolBackend;
    use crate::infrastructure::memory_backend::Operation;

    struct Harness<E: Endpoint> {
        backend: Arc<InMemoryPoolBackend>,
        shutdown: CancellationToken,
        client: TestClient<E>,
    }

    fn harness() -> Harness<impl Endpoint> {
        let backend = Arc::new(InMemoryPoolBackend::default());
        let config = CoordinatorConfig {
            token: TokenPolicy {
                settle_delay: Duration::from_millis(1),
                retry_delay: Duration::from_millis(1),
                ..TokenPolicy::default()
            },
            registration: RegistrationPolicy {
                poll_interval: Duration::from_millis(10),
                registration_timeout: Duration::from_millis(100),
                ..RegistrationPolicy::default()
            },
            ..CoordinatorConfig::default()
        };
        let coordinator = Arc::new(AllocationCoordinator::new(backend.clone(), config));
        let shutdown = CancellationToken::new();
        Harness {
            backend,
            client: TestClient::new(routes(coordinator, shutdown.clone())),
            shutdown,
        }
    }

    fn vm(id: &str, os: OsType) -> VirtualMachine {
        VirtualMachine {
            id: id.to_string(),
            name: id.to_string(),
            fqdn: format!("{id}.corp.example"),
            os,
            user_id: "alice".to_string(),
            connection_url: None,
            tags: Default::default(),
        }
    }

    #[test(tokio::test)]
    async fn healthz_answers_ok() {
        let harness = harness();
        let resp = harness.client.get("/healthz").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("ok").await;
    }

    #[test(tokio::test)]
    async fn registration_round_trip() {
        let harness = harness();
        let machine = vm("vm-1", OsType::Windows);

        let resp = harness
            .client
            .post("/api/v1/registrations")
            .body_json(&machine)
            .send()
            .await;
        resp.assert_status_is_ok();
        let body: ApiResponse<RegistrationInfo> = resp.json().await.value().deserialize();
        assert!(body.success);
        let registration = body.data.expect("registration");
        assert_eq!(registration.pool_name, "HP-Personal-ALPHA");
        assert!(!registration.token.is_empty());

        harness
            .backend
            .join_session_host(&registration.pool_name, &machine.fqdn, SessionHostStatus::Available)
            .expect("join");

        let resp = harness
            .client
            .post("/api/v1/registrations/HP-Personal-ALPHA/complete")
            .body_json(&machine)
            .send()
            .await;
        resp.assert_status_is_ok();
        let body: ApiResponse<VirtualMachine> = resp.json().await.value().deserialize();
        let registered = body.data.expect("vm");
        assert!(registered
            .connection_url
            .as_deref()
            .is_some_and(|url| url.starts_with("ms-avd:connect?")));
    }

    #[test(tokio::test)]
    async fn unsupported_os_is_bad_request() {
        let harness = harness();
        let resp = harness
            .client
            .post("/api/v1/registrations")
            .body_json(&vm("vm-1", OsType::Linux))
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        let body: ApiResponse<()> = resp.json().await.value().deserialize();
        assert!(!body.success);
        assert!(body.message.contains("unsupported OS"));
    }

    #[test(tokio::test)]
    async fn backend_failure_is_bad_gateway() {
        let harness = harness();
        harness.backend.fail_always(Operation::ListPools);
        let resp = harness
            .client
            .post("/api/v1/registrations")
            .body_json(&vm("vm-1", OsType::Windows))
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_GATEWAY);
    }

    #[test(tokio::test)]
    async fn missing_vm_is_gateway_timeout() {
        let harness = harness();
        let resp = harness
            .client
            .post("/api/v1/registrations/HP-Personal-ALPHA/complete")
            .body_json(&vm("vm-1", OsType::Windows))
            .send()
            .await;
        resp.assert_status(StatusCode::GATEWAY_TIMEOUT);
    }

    #[test(tokio::test)]
    async fn shutdown_cancels_waiting_registrations() {
        let harness = harness();
        harness.shutdown.cancel();
        let resp = harness
            .client
            .post("/api/v1/registrations/HP-Personal-ALPHA/complete")
            .body_json(&vm("vm-1", OsType::Windows))
            .send()
            .await;
        resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test(tokio::test)]
    async fn cleanup_and_audit() {
        let harness = harness();
        harness
            .client
            .post("/api/v1/registrations")
            .body_json(&vm("vm-1", OsType::Windows))
            .send()
            .await
            .assert_status_is_ok();

        let resp = harness.client.delete("/api/v1/vms/vm-1").send().await;
        resp.assert_status_is_ok();
        let body: ApiResponse<CleanupInfo> = resp.json().await.value().deserialize();
        assert_eq!(body.data, Some(CleanupInfo::default()));

        let resp = harness.client.get("/api/v1/stacks/audit").send().await;
        resp.assert_status_is_ok();
        let body: ApiResponse<Vec<IncompleteStackInfo>> = resp.json().await.value().deserialize();
        assert_eq!(body.data, Some(Vec::new()));
    }

    #[tokio::test]
    async fn api_server_graceful_shutdown() {
        let backend = Arc::new(InMemoryPoolBackend::default());
        let coordinator = Arc::new(AllocationCoordinator::new(backend, CoordinatorConfig::default()));
        let shutdown = CancellationToken::new();
        let server = ApiServer::new(coordinator, "127.0.0.1:0".to_string(), shutdown.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        shutdown_tx.send(()).expect("should send shutdown signal");

        server.run(shutdown_rx).await.expect("clean shutdown");
        assert!(shutdown.is_cancelled());
    }
}
