/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use platform_backup_agent::utils::DEFAULT_CONFIG_PATH;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "platform-backup-agent")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Agent configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Back up the platform and upload the archive
    Backup {
        /// Session tag, the current UTC time when omitted
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Download a backup and restore the platform from it
    Restore {
        /// Tag of the backup session to restore
        #[arg(short, long)]
        tag: String,
    },

    /// Upgrade host packages
    Update,

    /// Upgrade the host distribution release
    UpdateDistro,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration, secrets masked
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backup_with_tag() {
        let cli = Cli::try_parse_from(["platform-backup-agent", "-v", "backup", "--tag", "nightly"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(matches!(cli.command, Commands::Backup { tag: Some(ref t) } if t == "nightly"));
    }

    #[test]
    fn test_restore_requires_tag() {
        assert!(Cli::try_parse_from(["platform-backup-agent", "restore"]).is_err());
        let cli = Cli::try_parse_from([
            "platform-backup-agent",
            "restore",
            "-t",
            "2024-01-01T00:00:00Z",
            "--config",
            "/tmp/agent.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/agent.toml"));
        assert!(matches!(cli.command, Commands::Restore { .. }));
    }

    #[test]
    fn test_update_distro_subcommand() {
        let cli = Cli::try_parse_from(["platform-backup-agent", "update-distro"]).unwrap();
        assert!(matches!(cli.command, Commands::UpdateDistro));
    }
}
