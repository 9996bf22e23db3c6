use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "wades",
    version,
    about = r#"
wades watches the processes running on this host, accumulates a behavioral
profile per application, and flags applications whose newest sample batch
deviates from their own history.

EXAMPLES:
    # Start the daemon in the background:
    wades start

    # See which applications have been modelled:
    wades modelled apps

    # See current anomalies, or every anomaly ever recorded:
    wades abnormal apps
    wades abnormal apps --history

    # Pause and resume anomaly detection (sampling continues):
    wades modeller pause
    wades modeller continue
"#
)]
pub struct Opt {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Start the daemon in the background.
    Start,

    /// Stop a running daemon.
    Stop,

    #[clap(hide = true)]
    /// Run the sampling and detection pipeline in the foreground.
    Run,

    /// Pause, resume or inspect the detector.
    Modeller(ModellerArgs),

    /// Inspect the applications the daemon has modelled.
    Modelled(ModelledArgs),

    /// Inspect applications with anomalies.
    Abnormal(AbnormalArgs),
}

#[derive(Debug, Args)]
pub struct ModellerArgs {
    #[command(subcommand)]
    pub command: ModellerCommand,
}

#[derive(Debug, Subcommand)]
pub enum ModellerCommand {
    /// Stop scheduling detection runs; sampling continues.
    Pause,
    /// Resume detection on the next tick.
    Continue,
    /// Report whether detection is paused.
    Status,
}

#[derive(Debug, Args)]
pub struct ModelledArgs {
    #[command(subcommand)]
    pub command: ModelledCommand,
}

#[derive(Debug, Subcommand)]
pub enum ModelledCommand {
    /// List the current summary of every modelled application.
    Apps,
}

#[derive(Debug, Args)]
pub struct AbnormalArgs {
    #[command(subcommand)]
    pub command: AbnormalCommand,
}

#[derive(Debug, Subcommand)]
pub enum AbnormalCommand {
    /// List applications whose latest batch scored above `none`.
    Apps {
        /// Include every recorded anomaly, not just the current ones.
        #[arg(long)]
        history: bool,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Opt::command().debug_assert();
    }

    #[test]
    fn verify_cli_queries() {
        let opt = Opt::parse_from(["wades", "abnormal", "apps", "--history"]);
        assert!(matches!(
            opt.action,
            Action::Abnormal(AbnormalArgs {
                command: AbnormalCommand::Apps { history: true }
            })
        ));

        let opt = Opt::parse_from(["wades", "modeller", "pause"]);
        assert!(matches!(
            opt.action,
            Action::Modeller(ModellerArgs {
                command: ModellerCommand::Pause
            })
        ));

        let opt = Opt::parse_from(["wades", "modelled", "apps", "--config", "/etc/wades.json"]);
        assert_eq!(opt.config.as_deref(), Some(std::path::Path::new("/etc/wades.json")));

        // A bare group name without its subcommand is an error.
        assert!(Opt::try_parse_from(["wades", "modeller"]).is_err());
    }
}
