//! Operator settings from flags and environment

use std::time::Duration;

use clap::Args;

use crate::retry::RetryConfig;
use crate::status::Component;

/// Tuning of the reconcile loops
#[derive(Args, Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Seconds between two passes of a healthy FlowCollector
    #[arg(long, env = "FLOWMESH_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Deadline of one reconcile pass, in seconds
    #[arg(
        long,
        env = "FLOWMESH_PASS_TIMEOUT_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub pass_timeout_secs: u64,

    /// Attempts of the fetch-merge-write cycle on conflicts and transient errors
    #[arg(
        long,
        env = "FLOWMESH_CONFLICT_RETRIES",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub conflict_retries: u32,

    /// Component not reconciled by this instance (repeatable)
    #[arg(long = "disable-component", value_name = "COMPONENT")]
    pub disabled_components: Vec<Component>,

    /// Do not install the FlowCollector CRD on startup
    #[arg(long)]
    pub skip_crd_install: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            resync_secs: 300,
            pass_timeout_secs: 60,
            conflict_retries: 5,
            disabled_components: Vec::new(),
            skip_crd_install: false,
        }
    }
}

impl OperatorConfig {
    /// Requeue delay after a successful pass
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    /// Deadline of one pass
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }

    /// Retry policy of the resource reconciler
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::conflict_with_attempts(self.conflict_retries)
    }

    /// Components to run, in registration order
    pub fn enabled_components(&self) -> Vec<Component> {
        Component::ALL
            .into_iter()
            .filter(|c| !self.disabled_components.contains(c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    fn parse(args: &[&str]) -> OperatorConfig {
        let mut argv = vec!["flowmesh"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().config
    }

    #[test]
    fn test_defaults_match_default_impl() {
        assert_eq!(parse(&[]), OperatorConfig::default());
        assert_eq!(OperatorConfig::default().retry(), RetryConfig::conflict());
    }

    #[test]
    fn test_disabled_components_keep_order() {
        let config = parse(&[
            "--disable-component",
            "consoleplugin",
            "--disable-component",
            "Agent",
        ]);
        assert_eq!(
            config.enabled_components(),
            vec![
                Component::Monitoring,
                Component::Processor,
                Component::NetworkPolicy
            ]
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let argv = ["flowmesh", "--pass-timeout-secs", "0"];
        assert!(TestCli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_durations() {
        let config = parse(&["--resync-secs", "30", "--pass-timeout-secs", "5"]);
        assert_eq!(config.resync(), Duration::from_secs(30));
        assert_eq!(config.pass_timeout(), Duration::from_secs(5));
    }
}
