//! Command line configuration
//!
//! Every flag can also be set through the environment variable named
//! next to it.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use machine_api_common::{Platform, MACHINE_API_NAMESPACE};

/// Machine API controllers and admission webhooks
#[derive(Parser, Debug)]
#[command(name = "machine-api-operator", version, about, long_about = None)]
pub struct Cli {
    /// What to run
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the drain and node link controllers together
    Controller(ManagerArgs),
    /// Run only the node link controller
    #[command(name = "nodelink")]
    NodeLink(ManagerArgs),
    /// Run only the drain controller
    Drain(ManagerArgs),
    /// Serve the Machine and MachineSet admission webhooks
    Webhook(WebhookArgs),
    /// Print the Machine and MachineSet CRDs as YAML and exit
    Crd,
}

/// Flags shared by every controller process
#[derive(Args, Debug, Clone)]
pub struct ManagerArgs {
    /// Namespace to watch; empty watches all namespaces
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Run only while holding the leader lease
    #[arg(long, env = "LEADER_ELECT", default_value_t = false)]
    pub leader_elect: bool,

    /// Namespace of the leader lease
    #[arg(
        long,
        env = "LEADER_ELECT_RESOURCE_NAMESPACE",
        default_value = MACHINE_API_NAMESPACE
    )]
    pub leader_elect_resource_namespace: String,

    /// How long a lease is valid without renewal (e.g. 137s, 2m)
    #[arg(
        long,
        env = "LEADER_ELECT_LEASE_DURATION",
        default_value = "137s",
        value_parser = parse_duration
    )]
    pub leader_elect_lease_duration: Duration,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl ManagerArgs {
    /// Namespace to watch, `None` meaning all of them
    pub fn watch_namespace(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }
}

/// Flags for the admission webhook server
#[derive(Args, Debug, Clone)]
pub struct WebhookArgs {
    /// HTTPS port
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 9443)]
    pub webhook_port: u16,

    /// Directory holding tls.crt and tls.key
    #[arg(
        long,
        env = "WEBHOOK_CERT_DIR",
        default_value = "/etc/machine-api-operator/tls"
    )]
    pub cert_dir: PathBuf,

    /// Infrastructure platform; discovered from the cluster when unset
    #[arg(long, env = "PLATFORM")]
    pub platform: Option<Platform>,

    /// Infrastructure name; discovered from the cluster when unset
    #[arg(long, env = "CLUSTER_ID")]
    pub cluster_id: Option<String>,

    /// Cloud region used for defaults
    #[arg(long, env = "REGION")]
    pub region: Option<String>,

    /// GCP project hosting the cluster
    #[arg(long, env = "GCP_PROJECT_ID")]
    pub gcp_project_id: Option<String>,

    /// vSphere datacenter used when a workspace names none
    #[arg(long, env = "VSPHERE_DATACENTER")]
    pub vsphere_datacenter: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Parse `90`, `90s`, `2m` or `1h` into a duration
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => value.split_at(split),
        None => (value, "s"),
    };
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;
    let seconds = match unit {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        other => return Err(format!("invalid duration unit '{other}' in '{value}'")),
    };
    if seconds == 0 {
        return Err(format!("duration '{value}' must be positive"));
    }
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use machine_api_common::leader_election::DEFAULT_LEASE_DURATION;

    #[test]
    fn durations_accept_units_and_raw_seconds() {
        assert_eq!(parse_duration("137s"), Ok(Duration::from_secs(137)));
        assert_eq!(parse_duration("90"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn controller_defaults() {
        let cli = Cli::try_parse_from(["machine-api-operator", "controller"]).unwrap();
        let Command::Controller(args) = cli.command else {
            panic!("expected controller subcommand");
        };
        assert_eq!(args.watch_namespace(), None);
        assert!(!args.leader_elect);
        assert_eq!(args.leader_elect_resource_namespace, MACHINE_API_NAMESPACE);
        assert_eq!(args.leader_elect_lease_duration, DEFAULT_LEASE_DURATION);
    }

    #[test]
    fn leader_election_flags_parse() {
        let cli = Cli::try_parse_from([
            "machine-api-operator",
            "nodelink",
            "--namespace",
            "openshift-machine-api",
            "--leader-elect",
            "--leader-elect-lease-duration",
            "2m",
        ])
        .unwrap();
        let Command::NodeLink(args) = cli.command else {
            panic!("expected nodelink subcommand");
        };
        assert_eq!(args.watch_namespace(), Some("openshift-machine-api"));
        assert!(args.leader_elect);
        assert_eq!(args.leader_elect_lease_duration, Duration::from_secs(120));
    }

    #[test]
    fn webhook_platform_is_case_insensitive() {
        let cli = Cli::try_parse_from([
            "machine-api-operator",
            "webhook",
            "--platform",
            "aws",
            "--cluster-id",
            "demo",
        ])
        .unwrap();
        let Command::Webhook(args) = cli.command else {
            panic!("expected webhook subcommand");
        };
        assert_eq!(args.platform, Some(Platform::Aws));
        assert_eq!(args.webhook_port, 9443);
        assert_eq!(args.cluster_id.as_deref(), Some("demo"));
    }

    #[test]
    fn unknown_platform_is_rejected() {
        assert!(Cli::try_parse_from([
            "machine-api-operator",
            "webhook",
            "--platform",
            "mainframe",
        ])
        .is_err());
    }
}
