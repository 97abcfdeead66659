//! Command-line interface definitions for the `podfleet` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `podfleet` binary.
#[derive(Debug, Parser)]
#[command(
    name = "podfleet",
    about = "Create GPU pods, sync a workspace to them and run commands across the fleet",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Group of pods to operate on; overrides `PODFLEET_GROUP`.
    #[arg(long, short = 'g', global = true, value_name = "GROUP")]
    pub(crate) group: Option<String>,
    /// Operate on every pod of the account, ignoring any configured group.
    #[arg(long, global = true, conflicts_with_all = ["group", "select"])]
    pub(crate) all: bool,
    /// Restrict the command to a subset: an index (`3`), a half-open range
    /// (`1-4`, `-2`, `3-`) or a pod name.
    #[arg(long, short = 'i', global = true, value_name = "SELECTOR")]
    pub(crate) select: Option<String>,
    /// Log debug output.
    #[arg(long, short = 'v', global = true)]
    pub(crate) verbose: bool,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `podfleet` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// List the pods of the group.
    #[command(name = "list")]
    List,
    /// Create pods named after the next free indices of the group.
    #[command(name = "make")]
    Make(MakeCommand),
    /// Run a shell command on every running pod.
    #[command(name = "exec")]
    Exec(ExecCommand),
    /// Run the configured interpreter on every running pod.
    #[command(name = "py")]
    Py(PyCommand),
    /// Synchronise the local workspace to every running pod.
    #[command(name = "sync")]
    Sync,
    /// Synchronise the workspace and install its dependencies.
    #[command(name = "setup")]
    Setup(SetupCommand),
    /// Race a probe across the pods and keep only the fastest.
    #[command(name = "prune")]
    Prune(PruneCommand),
    /// Terminate every pod of the group, including ones still starting.
    #[command(name = "purge")]
    Purge,
    /// Print the ssh command reaching one pod.
    #[command(name = "ssh")]
    Ssh(SshCommand),
}

/// Arguments for `podfleet make`.
#[derive(Debug, Args)]
pub(crate) struct MakeCommand {
    /// Number of pods to create.
    #[arg(value_name = "COUNT")]
    pub(crate) count: u32,
    /// Memory per pod in gigabytes.
    #[arg(long, value_name = "GB")]
    pub(crate) mem: Option<u32>,
    /// Virtual CPUs per pod.
    #[arg(long, value_name = "COUNT")]
    pub(crate) vcpu: Option<u32>,
    /// GPUs per pod.
    #[arg(long, value_name = "COUNT")]
    pub(crate) gpus: Option<u32>,
    /// Disk or volume size in gigabytes.
    #[arg(long, value_name = "GB")]
    pub(crate) disk: Option<u32>,
    /// Container image (RunPod) or boot image label.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// EC2 instance type.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// EC2 region.
    #[arg(long, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// EC2 AMI id.
    #[arg(long, value_name = "AMI")]
    pub(crate) ami: Option<String>,
}

/// Arguments for `podfleet exec`.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    /// Run from the home directory instead of the synchronised workspace.
    #[arg(long)]
    pub(crate) no_cd: bool,
    /// Terminate each pod once its command finishes.
    #[arg(long)]
    pub(crate) purge_after: bool,
    /// Shell command to run (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `podfleet py`.
#[derive(Debug, Args)]
pub(crate) struct PyCommand {
    /// Arguments passed to the interpreter.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) args: Vec<String>,
}

/// Arguments for `podfleet setup`.
#[derive(Debug, Args)]
pub(crate) struct SetupCommand {
    /// Stop waiting once this many pods have finished installing.
    #[arg(long, value_name = "COUNT")]
    pub(crate) min_done: Option<usize>,
}

/// Arguments for `podfleet prune`.
#[derive(Debug, Args)]
pub(crate) struct PruneCommand {
    /// Number of pods to keep.
    #[arg(value_name = "KEEP")]
    pub(crate) keep: usize,
    /// Probe command timed on every pod.
    #[arg(long, value_name = "COMMAND", default_value = "nvidia-smi")]
    pub(crate) probe: String,
}

/// Arguments for `podfleet ssh`.
#[derive(Debug, Args)]
pub(crate) struct SshCommand {
    /// Pod index or name among the running pods.
    #[arg(value_name = "POD")]
    pub(crate) pod: String,
    /// Log in as this user instead of the provider default.
    #[arg(long, value_name = "USER")]
    pub(crate) user: Option<String>,
    /// Append this command, wrapped in the remote environment preamble.
    #[arg(long, value_name = "COMMAND")]
    pub(crate) command: Option<String>,
}
