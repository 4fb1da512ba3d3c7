use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use crate::app::core::Application;
use crate::app::services::ApplicationServices;
use crate::config::load_stack_tags;
use crate::config::CoordinatorConfig;
use crate::config::ServeArgs;
use crate::domain::allocation::AllocationCoordinator;
use crate::infrastructure::memory_backend::InMemoryPoolBackend;

/// Builds an [`Application`] from `serve` arguments
pub struct ApplicationBuilder {
    serve_args: ServeArgs,
}

impl ApplicationBuilder {
    pub fn new(serve_args: ServeArgs) -> Self {
        Self { serve_args }
    }

    pub async fn build(self) -> Result<Application> {
        let mut config = CoordinatorConfig::try_from(&self.serve_args)
            .context("invalid coordinator configuration")?;
        if let Some(path) = self.serve_args.stack_tags_file.clone() {
            config.stack.tags = load_stack_tags(path.clone())
                .await
                .with_context(|| format!("failed to load stack tags from {}", path.display()))?;
        }

        tracing::info!(
            subscription_id = %self.serve_args.subscription_id,
            resource_group = %self.serve_args.resource_group,
            pool_prefix = %config.naming.pool_prefix,
            "using in-memory pool backend"
        );
        let backend = Arc::new(InMemoryPoolBackend::new(
            self.serve_args.subscription_id.clone(),
            self.serve_args.resource_group.clone(),
        ));
        let coordinator = Arc::new(AllocationCoordinator::new(backend, config));

        Ok(Application::new(
            ApplicationServices { coordinator },
            self.serve_args,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;
    use tempfile::NamedTempFile;

    use super::*;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let args = std::iter::once("serve").chain(extra.iter().copied());
        ServeArgs::try_parse_from(args).expect("arguments parse")
    }

    #[tokio::test]
    async fn builds_with_stack_tags() {
        let mut tags_file = NamedTempFile::new().unwrap();
        tags_file.write_all(b"owner: desktop-team\n").unwrap();
        let path = tags_file.path().to_string_lossy().into_owned();

        let app = ApplicationBuilder::new(serve_args(&["--stack-tags-file", &path]))
            .build()
            .await
            .expect("application builds");

        assert!(app.services().coordinator.locks().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_configuration() {
        let result = ApplicationBuilder::new(serve_args(&[
            "--token-safety-window-hours",
            "72",
            "--token-lifetime-hours",
            "48",
        ]))
        .build()
        .await;
        assert!(result.is_err());

        let result = ApplicationBuilder::new(serve_args(&[
            "--stack-tags-file",
            "/nonexistent/stack-tags.yaml",
        ]))
        .build()
        .await;
        assert!(result.is_err());
    }
}
