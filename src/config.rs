//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `podfleet.toml` and `PODFLEET_*` environment
//! variables. Each provider has its own section and prefix.

use std::ffi::OsString;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::fleet::{FleetSettings, Project};
use crate::remote::SshOptions;

const APP_NAME: &str = "podfleet";

/// Fleet-wide settings shared by every provider.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PODFLEET",
    discovery(
        app_name = "podfleet",
        env_var = "PODFLEET_CONFIG_PATH",
        config_file_name = "podfleet.toml",
        dotfile_name = ".podfleet.toml",
        project_file_name = "podfleet.toml"
    )
)]
pub struct FleetConfig {
    /// Provider backend: `runpod` or `aws`.
    #[ortho_config(default = "runpod".to_owned())]
    pub provider: String,
    /// Group namespace to operate on. Unset means every pod of the account.
    pub group: Option<String>,
    /// Local directory synchronised to every pod. Defaults to the current
    /// directory.
    pub source_dir: Option<String>,
    /// Remote workspace directory name under the login user's home.
    /// Defaults to the base name of `source_dir`.
    pub remote_dir: Option<String>,
    /// Interpreter used by `py` and the setup commands.
    #[ortho_config(default = "/bin/python3".to_owned())]
    pub interpreter: String,
    /// Whether remote commands run inside `~/.venv`.
    #[ortho_config(default = false)]
    pub use_venv: bool,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Whether to enforce host key checking. Pods are ephemeral, so this is
    /// off unless requested.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Lines retained per output stream and pod.
    #[ortho_config(default = 1000)]
    pub max_output_lines: usize,
    /// Poll interval while waiting for pending pods, in milliseconds.
    #[ortho_config(default = 100)]
    pub pending_poll_interval_ms: u64,
    /// Give up waiting for pending pods after this many seconds.
    #[ortho_config(default = 1800)]
    pub pending_timeout_secs: u64,
    /// Monitor tick used by `setup` and `prune`, in seconds.
    #[ortho_config(default = 5)]
    pub monitor_tick_secs: u64,
    /// Delay between failed listing attempts, in milliseconds.
    #[ortho_config(default = 1000)]
    pub list_retry_interval_ms: u64,
    /// Listing attempts before giving up.
    #[ortho_config(default = 100)]
    pub list_max_attempts: u32,
    /// Attempts after which pods without a usable endpoint are terminated.
    #[ortho_config(default = 30)]
    pub purge_failing_after: u32,
}

/// RunPod backend settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "PODFLEET_RUNPOD")]
pub struct RunPodConfig {
    /// Path to the `runpodctl` executable.
    #[ortho_config(default = "runpodctl".to_owned())]
    pub runpodctl_bin: String,
    /// API key; when set, `runpodctl config --apiKey` runs once per process.
    pub api_key: Option<String>,
    /// Container image for new pods.
    #[ortho_config(default = "runpod/pytorch:2.1.0-py3.10-cuda11.8.0-devel-ubuntu22.04".to_owned())]
    pub image: String,
    /// Template identifier.
    pub template_id: Option<String>,
    /// Network volume attached to new pods.
    pub network_volume_id: Option<String>,
    /// Mount path of the volume inside the pod.
    #[ortho_config(default = "/root/workspace".to_owned())]
    pub volume_mount_path: String,
    /// GPU model requested for new pods.
    #[ortho_config(default = "NVIDIA GeForce RTX 4090".to_owned())]
    pub gpu_type: String,
    /// GPUs per pod.
    #[ortho_config(default = 1)]
    pub gpu_count: u32,
    /// Virtual CPUs per pod.
    #[ortho_config(default = 16)]
    pub vcpu: u32,
    /// Memory per pod in gigabytes.
    #[ortho_config(default = 60)]
    pub memory_gb: u32,
    /// Volume size in gigabytes.
    #[ortho_config(default = 100)]
    pub volume_gb: u32,
    /// Container disk size in gigabytes.
    #[ortho_config(default = 20)]
    pub container_disk_gb: u32,
    /// Whether to request secure cloud capacity.
    #[ortho_config(default = true)]
    pub secure_cloud: bool,
    /// Comma separated environment variables exported into
    /// `/etc/rp_environment` at boot.
    #[ortho_config(default = "WANDB_API_KEY,HUGGINGFACE_API_KEY,NEPTUNE_API_TOKEN".to_owned())]
    pub forward_env: String,
    /// Private key used to reach pods.
    pub ssh_key_path: Option<String>,
}

/// AWS EC2 backend settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "PODFLEET_AWS")]
pub struct AwsConfig {
    /// Path to the `aws` executable.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Region override; unset uses the CLI profile's region.
    pub region: Option<String>,
    /// AMI for new instances.
    #[ortho_config(default = String::new())]
    pub ami_id: String,
    /// Instance type for new instances.
    #[ortho_config(default = "g5.xlarge".to_owned())]
    pub instance_type: String,
    /// EC2 key pair name.
    #[ortho_config(default = String::new())]
    pub key_name: String,
    /// Comma separated security group ids.
    #[ortho_config(default = String::new())]
    pub security_group_ids: String,
    /// Subnet for new instances.
    pub subnet_id: Option<String>,
    /// Root volume size in gigabytes.
    #[ortho_config(default = 100)]
    pub volume_gb: u32,
    /// IAM instance profile name.
    pub iam_instance_profile: Option<String>,
    /// Login user of the AMI.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub ssh_user: String,
    /// Private key matching `key_name`.
    pub ssh_key_path: Option<String>,
    /// Tag key marking instances owned by this tool.
    #[ortho_config(default = "PodFleet".to_owned())]
    pub owner_tag: String,
}

/// Supported provider backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderKind {
    /// RunPod GPU rental.
    RunPod,
    /// AWS EC2.
    Aws,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "runpod" => Ok(Self::RunPod),
            "aws" | "ec2" => Ok(Self::Aws),
            other => Err(ConfigError::UnknownProvider(other.to_owned())),
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn require(&self, value: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [{}] in podfleet.toml",
                self.description, self.env_var, self.toml_key, self.section
            )));
        }
        Ok(())
    }
}

fn load_error(err: impl std::fmt::Display) -> ConfigError {
    ConfigError::Parse(err.to_string())
}

impl FleetConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)]).map_err(load_error)
    }

    /// Parses the configured provider.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProvider`] for unsupported names.
    pub fn provider_kind(&self) -> Result<ProviderKind, ConfigError> {
        self.provider.parse()
    }

    /// Checks required fields and value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.provider_kind()?;
        FieldMetadata::new(
            "remote interpreter",
            "PODFLEET_INTERPRETER",
            "interpreter",
            "fleet",
        )
        .require(&self.interpreter)?;
        FieldMetadata::new("ssh executable", "PODFLEET_SSH_BIN", "ssh_bin", "fleet")
            .require(&self.ssh_bin)?;
        FieldMetadata::new("rsync executable", "PODFLEET_RSYNC_BIN", "rsync_bin", "fleet")
            .require(&self.rsync_bin)?;
        if self.list_max_attempts == 0 {
            return Err(ConfigError::Invalid(String::from(
                "list_max_attempts must be at least 1",
            )));
        }
        if self.monitor_tick_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "monitor_tick_secs must be at least 1",
            )));
        }
        Ok(())
    }

    /// Timing and capacity limits for the fleet.
    #[must_use]
    pub const fn settings(&self) -> FleetSettings {
        FleetSettings {
            max_output_lines: self.max_output_lines,
            pending_poll_interval: Duration::from_millis(self.pending_poll_interval_ms),
            pending_timeout: Duration::from_secs(self.pending_timeout_secs),
            monitor_tick: Duration::from_secs(self.monitor_tick_secs),
            list_retry_interval: Duration::from_millis(self.list_retry_interval_ms),
            list_max_attempts: self.list_max_attempts,
            purge_failing_after: self.purge_failing_after,
        }
    }

    /// SSH and rsync client settings.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            rsync_bin: self.rsync_bin.clone(),
            batch_mode: true,
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
        }
    }

    /// Resolves the local workspace and its remote counterpart.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the source directory is not
    /// valid UTF-8 or has no base name to derive the remote directory from.
    pub fn project(&self) -> Result<Project, ConfigError> {
        let source_dir = match self.source_dir.as_deref() {
            Some(path) => Utf8PathBuf::from(path),
            None => {
                let cwd = std::env::current_dir().map_err(load_error)?;
                Utf8PathBuf::from_path_buf(cwd).map_err(|path| {
                    ConfigError::Invalid(format!("{} is not valid UTF-8", path.display()))
                })?
            }
        };
        let remote_dir = match self.remote_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => dir.to_owned(),
            _ => source_dir
                .file_name()
                .map(str::to_owned)
                .ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "cannot derive a remote directory from {source_dir}; set PODFLEET_REMOTE_DIR"
                    ))
                })?,
        };
        Ok(Project {
            source_dir,
            remote_dir,
            interpreter: self.interpreter.clone(),
            use_venv: self.use_venv,
        })
    }
}

impl RunPodConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)]).map_err(load_error)
    }

    /// Checks required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new(
            "runpodctl executable",
            "PODFLEET_RUNPOD_RUNPODCTL_BIN",
            "runpodctl_bin",
            "runpod",
        )
        .require(&self.runpodctl_bin)?;
        FieldMetadata::new("pod image", "PODFLEET_RUNPOD_IMAGE", "image", "runpod")
            .require(&self.image)?;
        FieldMetadata::new("GPU type", "PODFLEET_RUNPOD_GPU_TYPE", "gpu_type", "runpod")
            .require(&self.gpu_type)?;
        Ok(())
    }
}

impl AwsConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)]).map_err(load_error)
    }

    /// Checks the fields every listing needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new("aws executable", "PODFLEET_AWS_AWS_BIN", "aws_bin", "aws")
            .require(&self.aws_bin)?;
        FieldMetadata::new("owner tag", "PODFLEET_AWS_OWNER_TAG", "owner_tag", "aws")
            .require(&self.owner_tag)?;
        FieldMetadata::new("ssh user", "PODFLEET_AWS_SSH_USER", "ssh_user", "aws")
            .require(&self.ssh_user)?;
        Ok(())
    }

    /// Checks the additional fields needed to launch instances.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a launch field is empty.
    pub fn validate_for_launch(&self) -> Result<(), ConfigError> {
        self.validate()?;
        FieldMetadata::new("AMI id", "PODFLEET_AWS_AMI_ID", "ami_id", "aws")
            .require(&self.ami_id)?;
        FieldMetadata::new("key pair name", "PODFLEET_AWS_KEY_NAME", "key_name", "aws")
            .require(&self.key_name)?;
        FieldMetadata::new(
            "instance type",
            "PODFLEET_AWS_INSTANCE_TYPE",
            "instance_type",
            "aws",
        )
        .require(&self.instance_type)?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value outside its accepted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Indicates an unsupported provider name.
    #[error("unknown provider `{0}`: expected `runpod` or `aws`")]
    UnknownProvider(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
