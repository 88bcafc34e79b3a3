//! Command line of `rced`

use clap::{Parser, Subcommand, ValueEnum};
use rce_instance::InstallationPolicy;
use std::path::PathBuf;

/// RCE node daemon
#[derive(Debug, Parser)]
#[command(name = "rced")]
#[command(about = "RCE node daemon and instance management", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "RCE_CONFIG", global = true)]
    pub config: Option<String>,

    /// Log level
    #[arg(long, env = "RCE_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "RCE_LOG_JSON", global = true)]
    pub json: bool,

    /// Profile directory to run on; taken exclusively for the lifetime of the node
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Run headless, as done for managed instances
    #[arg(long)]
    pub batch: bool,

    /// Workflow file to start once the node is up
    #[arg(long)]
    pub workflow: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage local installations and instances
    Im {
        #[command(subcommand)]
        command: ImCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ImCommand {
    /// Install or update an installation
    Install {
        installation: String,
        url_qualifier: String,
        #[arg(long, value_enum, default_value = "if-version-differs")]
        policy: PolicyArg,
    },
    /// Stop the instances of an installation, update it and start them again
    Reinstall {
        installation: String,
        url_qualifier: String,
        #[arg(long, value_enum, default_value = "if-version-differs")]
        policy: PolicyArg,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Start instances from an installation
    Start {
        installation: String,
        #[arg(required = true)]
        instances: Vec<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stop instances
    Stop {
        instances: Vec<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Start every instance from an installation
    StartAll {
        installation: String,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stop every instance, or those of one installation
    StopAll {
        installation: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Apply a JSON configuration sequence to an instance
    Configure { instance: String, file: PathBuf },
    /// List instances, installations and templates
    List {
        #[arg(default_value = "all")]
        scope: String,
    },
    /// Delete a stopped instance
    Dispose { instance: String },
    /// Show the configured directories and cached downloads
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    IfMissing,
    IfVersionDiffers,
    ForceDownload,
    ForceReinstall,
}

impl From<PolicyArg> for InstallationPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::IfMissing => InstallationPolicy::OnlyIfMissing,
            PolicyArg::IfVersionDiffers => InstallationPolicy::IfVersionDiffers,
            PolicyArg::ForceDownload => InstallationPolicy::ForceDownload,
            PolicyArg::ForceReinstall => InstallationPolicy::ForceReinstall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_launch_arguments() {
        let cli = Cli::try_parse_from(["rced", "--profile", "/data/profiles/p1", "--batch"]).unwrap();
        assert_eq!(cli.profile, Some(PathBuf::from("/data/profiles/p1")));
        assert!(cli.batch);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_im_commands() {
        let cli = Cli::try_parse_from([
            "rced", "im", "install", "main", "10.x", "--policy", "force-download",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Im {
                command: ImCommand::Install { policy, .. },
            }) => assert_eq!(InstallationPolicy::from(policy), InstallationPolicy::ForceDownload),
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["rced", "im", "start", "main", "p1", "p2", "--timeout", "30"])
            .unwrap();
        match cli.command {
            Some(Command::Im {
                command: ImCommand::Start { instances, timeout, .. },
            }) => {
                assert_eq!(instances, vec!["p1", "p2"]);
                assert_eq!(timeout, Some(30));
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Cli::try_parse_from(["rced", "im", "start", "main"]).is_err());
    }
}
