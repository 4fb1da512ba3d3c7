use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::ServeArgs;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    serve_args: ServeArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, serve_args: ServeArgs) -> Self {
        Self {
            services,
            serve_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn serve_args(&self) -> &ServeArgs {
        &self.serve_args
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();
        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn application tasks: {}", e);
            return Err(e);
        }

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Gracefully shutdown application
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");

        let in_flight = self.services.coordinator.locks().len();
        if in_flight > 0 {
            tracing::warn!(
                in_flight,
                "dropping in-flight pool reservations; they are kept in memory only"
            );
        }

        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
