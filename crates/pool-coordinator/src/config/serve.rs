use std::path::PathBuf;

use api_types::OsType;
use clap::Args;
use clap::Parser;

use crate::domain::allocation::types::Tags;
use crate::domain::allocation::types::DESKTOP_VIRTUALIZATION_USER_ROLE;

/// Upper bound for token durations: 30 days.
pub const MAX_TOKEN_HOURS: i64 = 30 * 24;

#[derive(Parser, Clone, Debug)]
pub struct ServeArgs {
    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "LOG_PATH",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for daily rolling log files; stderr only when unset"
    )]
    pub log_path: Option<PathBuf>,

    #[arg(long, env = "AZURE_SUBSCRIPTION_ID", default_value = "00000000-0000-0000-0000-000000000000")]
    pub subscription_id: String,

    #[arg(long, env = "AZURE_RESOURCE_GROUP", default_value = "rg-personal-desktops")]
    pub resource_group: String,

    #[arg(long, env = "AVD_LOCATION", default_value = "westeurope")]
    pub location: String,

    #[arg(long, default_value = "HP-Personal-")]
    pub pool_prefix: String,

    #[arg(long, default_value = "AG-Personal-")]
    pub app_group_prefix: String,

    #[arg(long, default_value = "WS-Personal-")]
    pub workspace_prefix: String,

    #[arg(
        long,
        default_value = "3",
        help = "Maximum number of words in a stack suffix, e.g. 3 allows ALPHA-BRAVO-CHARLIE"
    )]
    pub max_suffix_segments: usize,

    #[arg(long, env = "AVD_DESKTOP_FRIENDLY_NAME", default_value = "Personal Desktop")]
    pub desktop_friendly_name: String,

    #[arg(long, default_value = "999999")]
    pub max_session_limit: u32,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_vm_on_connect: bool,

    #[arg(
        long,
        env = "AVD_USER_GROUP_ID",
        help = "Object id of the group granted access to new desktops; no role assignment when unset"
    )]
    pub user_group_id: Option<String>,

    #[arg(long, default_value = DESKTOP_VIRTUALIZATION_USER_ROLE)]
    pub role_definition_id: String,

    #[arg(long, env = "AVD_SUPPORTED_OS", default_value = "windows")]
    pub supported_os: OsType,

    #[arg(
        long,
        default_value = "24",
        value_parser = clap::value_parser!(u32).range(1..=MAX_TOKEN_HOURS),
        help = "Tokens expiring within this many hours are renewed before use"
    )]
    pub token_safety_window_hours: u32,

    #[arg(
        long,
        default_value = "48",
        value_parser = clap::value_parser!(u32).range(1..=MAX_TOKEN_HOURS),
        help = "Lifetime of renewed tokens; must exceed the safety window"
    )]
    pub token_lifetime_hours: u32,

    #[arg(long, default_value = "3")]
    pub token_max_attempts: u32,

    #[arg(long, default_value = "5")]
    pub token_settle_delay_secs: u64,

    #[arg(long, default_value = "5")]
    pub token_retry_delay_secs: u64,

    #[arg(long, default_value = "10")]
    pub poll_interval_secs: u64,

    #[arg(long, default_value = "1200")]
    pub registration_timeout_secs: u64,

    #[arg(
        long,
        env = "AVD_STACK_TAGS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML map of tags applied to every created stack"
    )]
    pub stack_tags_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct NextSuffixArgs {
    /// Current suffix, e.g. ZULU or ALPHA-BRAVO; empty for the first one
    #[arg(default_value = "")]
    pub current: String,

    #[arg(long, default_value = "3")]
    pub max_segments: usize,
}

/// load stack tags from a YAML map
pub async fn load_stack_tags(path: PathBuf) -> anyhow::Result<Tags> {
    tracing::info!("Loading stack tags from {:?}", path);

    let yaml_content = tokio::fs::read_to_string(&path).await?;
    if yaml_content.trim().is_empty() {
        return Ok(Tags::new());
    }
    let tags: Tags = serde_yaml::from_str(&yaml_content)?;

    tracing::info!("Loaded {} stack tags", tags.len());
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_stack_tags() {
        let yaml_content = r#"
costCenter: "4711"
owner: desktop-team
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let tags = load_stack_tags(temp_file.path().to_path_buf())
            .await
            .unwrap();

        assert_eq!(
            tags,
            Tags::from([
                ("costCenter".to_string(), "4711".to_string()),
                ("owner".to_string(), "desktop-team".to_string()),
            ])
        );
    }

    #[tokio::test]
    async fn empty_file_yields_no_tags() {
        let temp_file = NamedTempFile::new().unwrap();
        let tags = load_stack_tags(temp_file.path().to_path_buf())
            .await
            .unwrap();
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn rejects_non_map_yaml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"- just\n- a list\n").unwrap();
        assert!(load_stack_tags(temp_file.path().to_path_buf())
            .await
            .is_err());
    }
}
