//! AWS EC2 backend driven through the `aws` command-line client.
//!
//! Only instances carrying the configured owner tag set to `true` are
//! surfaced; every other instance of the account is reported as foreign.

use std::ffi::OsString;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::AwsConfig;
use crate::instance::{InstanceRecord, PodName, Resources, SshEndpoint};
use crate::provider::{
    CommandRunner, CreateRequest, DegradedInstance, ProcessCommandRunner, ProcessOutput,
    ProviderError, ProviderFuture, ProviderGateway, Snapshot,
};

const SSH_PORT: u16 = 22;
const ENV_FILE: &str = "~/.bashrc";
const ROOT_DEVICE: &str = "/dev/sda1";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    state: InstanceState,
    public_ip_address: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
    instance_type: Option<String>,
    image_id: Option<String>,
    cpu_options: Option<CpuOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CpuOptions {
    core_count: Option<u32>,
    threads_per_core: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstances {
    #[serde(default)]
    instances: Vec<LaunchedInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchedInstance {
    instance_id: String,
}

impl Ec2Instance {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }

    fn is_gone(&self) -> bool {
        matches!(self.state.name.as_str(), "terminated" | "shutting-down")
    }

    fn vcpu(&self) -> Option<u32> {
        let cpu = self.cpu_options.as_ref()?;
        cpu.core_count?.checked_mul(cpu.threads_per_core.unwrap_or(1))
    }
}

/// [`ProviderGateway`] over `aws ec2`.
#[derive(Debug)]
pub struct AwsGateway<R: CommandRunner = ProcessCommandRunner> {
    config: AwsConfig,
    runner: R,
}

impl AwsGateway<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(config: AwsConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AwsGateway<R> {
    /// Creates a gateway using the provided runner.
    #[must_use]
    pub const fn new(config: AwsConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Returns the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &AwsConfig {
        &self.config
    }

    async fn invoke(
        &self,
        action: &str,
        mut args: Vec<OsString>,
        region: Option<&str>,
    ) -> Result<ProcessOutput, ProviderError> {
        args.push(OsString::from("--output"));
        args.push(OsString::from("json"));
        if let Some(name) = region.or(self.config.region.as_deref()) {
            args.push(OsString::from("--region"));
            args.push(OsString::from(name));
        }
        let program = self.config.aws_bin.as_str();
        let output = self.runner.run(program, &args).await?;
        if !output.is_success() {
            return Err(ProviderError::failure(
                program,
                action,
                output.code,
                &output.stderr,
            ));
        }
        Ok(output)
    }

    fn home_dir(&self) -> String {
        if self.config.ssh_user == "root" {
            String::from("/root")
        } else {
            format!("/home/{}", self.config.ssh_user)
        }
    }

    /// Converts a `describe-instances` response into a snapshot.
    fn parse_listing(&self, stdout: &str) -> Result<Snapshot, ProviderError> {
        let listing: DescribeInstances = serde_json::from_str(stdout)
            .map_err(|err| ProviderError::parse(&self.config.aws_bin, err.to_string()))?;

        let mut snapshot = Snapshot::default();
        let instances = listing
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .filter(|instance| !instance.is_gone());
        for instance in instances {
            if instance.tag(&self.config.owner_tag) != Some("true") {
                snapshot.foreign.push(instance.instance_id);
                continue;
            }
            let name = instance
                .tag("Name")
                .unwrap_or(&instance.instance_id)
                .to_owned();
            let Some(host) = instance.public_ip_address.clone() else {
                snapshot.degraded.push(DegradedInstance {
                    id: instance.instance_id,
                    name,
                    reason: String::from("no public ip address yet"),
                });
                continue;
            };
            let vcpu = instance.vcpu();
            snapshot.instances.push(InstanceRecord {
                name: PodName::parse(&name),
                status: instance.state.name,
                endpoint: SshEndpoint {
                    host,
                    port: SSH_PORT,
                    user: self.config.ssh_user.clone(),
                    key_path: self.config.ssh_key_path.clone(),
                    home_dir: self.home_dir(),
                    env_file: ENV_FILE.to_owned(),
                },
                resources: Resources {
                    vcpu,
                    instance_type: instance.instance_type,
                    image: instance.image_id,
                    ..Resources::default()
                },
                id: instance.instance_id,
            });
        }

        if !snapshot.foreign.is_empty() {
            warn!(
                count = snapshot.foreign.len(),
                tag = %self.config.owner_tag,
                "ignoring instances without the owner tag"
            );
        }
        Ok(snapshot)
    }

    fn run_instances_args(&self, request: &CreateRequest) -> Vec<OsString> {
        let config = &self.config;
        let overrides = &request.overrides;
        if overrides.memory_gb.is_some() || overrides.vcpu.is_some() || overrides.gpu_count.is_some()
        {
            warn!("memory, vcpu and gpu overrides are ignored on EC2; pick an instance type instead");
        }
        let image = overrides.image.as_deref().unwrap_or(&config.ami_id);
        let volume_gb = overrides.disk_gb.unwrap_or(config.volume_gb);

        let mut args: Vec<OsString> = vec![
            "ec2".into(),
            "run-instances".into(),
            "--image-id".into(),
            image.into(),
            "--instance-type".into(),
            config.instance_type.as_str().into(),
            "--key-name".into(),
            config.key_name.as_str().into(),
            "--count".into(),
            "1".into(),
        ];
        let groups: Vec<&str> = config
            .security_group_ids
            .split(',')
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .collect();
        if !groups.is_empty() {
            args.push("--security-group-ids".into());
            args.extend(groups.into_iter().map(OsString::from));
        }
        if let Some(subnet) = config.subnet_id.as_deref() {
            args.push("--subnet-id".into());
            args.push(subnet.into());
        }
        if let Some(profile) = config.iam_instance_profile.as_deref() {
            args.push("--iam-instance-profile".into());
            args.push(format!("Name={profile}").into());
        }
        args.push("--block-device-mappings".into());
        args.push(
            format!(
                "DeviceName={ROOT_DEVICE},Ebs={{VolumeSize={volume_gb},VolumeType=gp3,DeleteOnTermination=true}}"
            )
            .into(),
        );
        args.push("--tag-specifications".into());
        args.push(
            format!(
                "ResourceType=instance,Tags=[{{Key=Name,Value={}}},{{Key={},Value=true}}]",
                request.name, config.owner_tag
            )
            .into(),
        );
        args
    }
}

impl<R: CommandRunner> ProviderGateway for AwsGateway<R> {
    type Error = ProviderError;

    fn list_instances<'a>(
        &'a self,
        region: Option<&'a str>,
    ) -> ProviderFuture<'a, Snapshot, Self::Error> {
        Box::pin(async move {
            let args = vec![OsString::from("ec2"), OsString::from("describe-instances")];
            let output = self.invoke("describe-instances", args, region).await?;
            self.parse_listing(&output.stdout)
        })
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a CreateRequest,
    ) -> ProviderFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let args = self.run_instances_args(request);
            let output = self.invoke("run-instances", args, None).await?;
            let launched: RunInstances = serde_json::from_str(&output.stdout)
                .map_err(|err| ProviderError::parse(&self.config.aws_bin, err.to_string()))?;
            let id = launched
                .instances
                .into_iter()
                .next()
                .map(|instance| instance.instance_id)
                .ok_or_else(|| ProviderError::MissingCreatedId {
                    output: output.stdout.trim().to_owned(),
                })?;
            info!(instance_id = %id, name = %request.name, "requested ec2 instance");
            Ok(id)
        })
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let args = vec![
                OsString::from("ec2"),
                OsString::from("terminate-instances"),
                OsString::from("--instance-ids"),
                OsString::from(id),
            ];
            self.invoke("terminate-instances", args, None).await.map(|_| ())
        })
    }

    fn region(&self) -> Option<&str> {
        self.config.region.as_deref()
    }
}

#[cfg(test)]
mod tests;
