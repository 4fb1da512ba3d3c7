pub mod cli;
pub mod serve;

use std::time::Duration;

use anyhow::ensure;
use chrono::TimeDelta;

use crate::domain::allocation::RegistrationPolicy;
use crate::domain::allocation::StackNaming;
use crate::domain::allocation::StackSettings;
use crate::domain::allocation::TokenPolicy;

/// Everything the allocation coordinator needs, derived from `serve` arguments.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub naming: StackNaming,
    pub stack: StackSettings,
    pub token: TokenPolicy,
    pub registration: RegistrationPolicy,
}

impl TryFrom<&serve::ServeArgs> for CoordinatorConfig {
    type Error = anyhow::Error;

    fn try_from(args: &serve::ServeArgs) -> anyhow::Result<Self> {
        ensure!(
            args.token_lifetime_hours > args.token_safety_window_hours,
            "token lifetime ({}h) must exceed the token safety window ({}h)",
            args.token_lifetime_hours,
            args.token_safety_window_hours
        );

        Ok(Self {
            naming: StackNaming {
                pool_prefix: args.pool_prefix.clone(),
                app_group_prefix: args.app_group_prefix.clone(),
                workspace_prefix: args.workspace_prefix.clone(),
                max_segments: args.max_suffix_segments.max(1),
            },
            stack: StackSettings {
                location: args.location.clone(),
                desktop_friendly_name: args.desktop_friendly_name.clone(),
                max_session_limit: args.max_session_limit,
                start_vm_on_connect: args.start_vm_on_connect,
                user_group_id: args.user_group_id.clone().filter(|id| !id.is_empty()),
                role_definition_id: args.role_definition_id.clone(),
                tags: Default::default(),
            },
            token: TokenPolicy {
                safety_window: TimeDelta::hours(i64::from(args.token_safety_window_hours)),
                token_lifetime: TimeDelta::hours(i64::from(args.token_lifetime_hours)),
                max_attempts: args.token_max_attempts.max(1),
                settle_delay: Duration::from_secs(args.token_settle_delay_secs),
                retry_delay: Duration::from_secs(args.token_retry_delay_secs),
            },
            registration: RegistrationPolicy {
                supported_os: args.supported_os,
                poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
                registration_timeout: Duration::from_secs(args.registration_timeout_secs),
            },
        })
    }
}

pub use cli::*;
pub use serve::*;

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn defaults_match_coordinator_defaults() {
        let harness = Harness::try_parse_from(["serve"]).expect("defaults parse");
        let config = CoordinatorConfig::try_from(&harness.serve).expect("valid defaults");
        let defaults = CoordinatorConfig::default();

        assert_eq!(config.naming, defaults.naming);
        assert_eq!(config.registration, defaults.registration);
        assert_eq!(config.token.safety_window, defaults.token.safety_window);
        assert_eq!(config.token.max_attempts, 3);
        assert_eq!(config.stack.role_definition_id, defaults.stack.role_definition_id);
        assert_eq!(config.stack.user_group_id, None);
    }

    #[test]
    fn limits_are_clamped() {
        let harness = Harness::try_parse_from([
            "serve",
            "--max-suffix-segments",
            "0",
            "--token-max-attempts",
            "0",
            "--user-group-id",
            "",
        ])
        .expect("arguments parse");
        let config = CoordinatorConfig::try_from(&harness.serve).expect("valid config");

        assert_eq!(config.naming.max_segments, 1);
        assert_eq!(config.token.max_attempts, 1);
        assert_eq!(config.stack.user_group_id, None);
    }

    #[test]
    fn token_hours_out_of_range_are_rejected() {
        for (flag, value) in [
            ("--token-lifetime-hours", "-1"),
            ("--token-lifetime-hours", "0"),
            ("--token-safety-window-hours", "0"),
            ("--token-lifetime-hours", "9223372036854775807"),
            ("--token-safety-window-hours", "721"),
        ] {
            assert!(
                Harness::try_parse_from(["serve", flag, value]).is_err(),
                "{flag} {value} should be rejected"
            );
        }

        let harness = Harness::try_parse_from(["serve", "--token-lifetime-hours", "720"])
            .expect("upper bound parses");
        let config = CoordinatorConfig::try_from(&harness.serve).expect("valid config");
        assert_eq!(config.token.token_lifetime, TimeDelta::hours(720));
    }

    #[test]
    fn lifetime_must_exceed_safety_window() {
        let harness = Harness::try_parse_from([
            "serve",
            "--token-safety-window-hours",
            "48",
            "--token-lifetime-hours",
            "48",
        ])
        .expect("arguments parse");

        let err = CoordinatorConfig::try_from(&harness.serve).expect_err("window too wide");
        assert!(err.to_string().contains("must exceed"));
    }
}
