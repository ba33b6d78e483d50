//! Command-line interface definitions for the `caravel` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `caravel` binary.
#[derive(Debug, Parser)]
#[command(
    name = "caravel",
    about = "Run one-off commands on ephemeral cloud containers over SSH",
    arg_required_else_help = true
)]
pub enum Cli {
    /// Provision a container, run a command, fetch results, and tear down.
    #[command(
        name = "run",
        about = "Provision a container, run a command, and tear it down"
    )]
    Run(RunCommand),
}

/// Arguments for the `caravel run` subcommand.
#[derive(Debug, Parser)]
pub struct RunCommand {
    /// Public key for SSH auth; a temporary pair is generated when empty.
    #[arg(
        long,
        value_name = "KEY",
        env = "CARAVEL_PUBLIC_KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub public_key: String,
    /// Private key for SSH auth; a temporary pair is generated when empty.
    #[arg(
        long,
        value_name = "KEY",
        env = "CARAVEL_PRIVATE_KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub private_key: String,
    /// Name of the application to create.
    #[arg(
        long,
        value_name = "NAME",
        env = "CARAVEL_NAME",
        default_value = "caravel-server"
    )]
    pub name: String,
    /// Plan to provision the application under.
    #[arg(long, value_name = "PLAN", env = "CARAVEL_PLAN", default_value = "free")]
    pub plan: String,
    /// OS type of the server base image.
    #[arg(
        long = "image-type",
        visible_alias = "type",
        value_name = "TYPE",
        env = "CARAVEL_IMAGE_TYPE",
        default_value = "alpine"
    )]
    pub image_type: String,
    /// Explicit image reference; ignores --image-type when set.
    #[arg(
        long = "image-name",
        value_name = "IMAGE",
        env = "CARAVEL_IMAGE_NAME",
        default_value = ""
    )]
    pub image_name: String,
    /// Script file to upload and run remotely instead of a command.
    #[arg(
        long,
        short = 'c',
        value_name = "PATH",
        env = "CARAVEL_COMMAND_FILE"
    )]
    pub command_file: Option<String>,
    /// Local directory synchronised with the remote working directory.
    #[arg(long, value_name = "PATH", env = "CARAVEL_SYNC_DIR")]
    pub sync_dir: Option<String>,
    /// Only upload the sync dir; skip the download phase.
    #[arg(long, env = "CARAVEL_UPLOAD_ONLY")]
    pub upload_only: bool,
    /// Only download results; skip the upload phase.
    #[arg(long, env = "CARAVEL_DOWNLOAD_ONLY")]
    pub download_only: bool,
    /// Seconds to wait for the container to become running.
    #[arg(
        long,
        value_name = "SECONDS",
        env = "CARAVEL_BOOT_TIMEOUT",
        default_value_t = 600
    )]
    pub boot_timeout: u64,
    /// Seconds to allow each transfer and the command execution.
    #[arg(
        long,
        value_name = "SECONDS",
        env = "CARAVEL_EXEC_TIMEOUT",
        default_value_t = 3600
    )]
    pub exec_timeout: u64,
    /// Command to execute remotely (use -- to separate it from flags).
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}
