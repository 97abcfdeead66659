//! GPU rental backend driven through `runpodctl`.
//!
//! RunPod accounts carry no ownership tags, so every pod of the configured
//! account is surfaced; fleets scope themselves by group name.

use std::ffi::OsString;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::RunPodConfig;
use crate::provider::{
    CommandRunner, CreateRequest, ProcessCommandRunner, ProcessOutput, ProviderError,
    ProviderFuture, ProviderGateway, Snapshot,
};

mod table;

/// [`ProviderGateway`] over the `runpodctl` command-line client.
#[derive(Debug)]
pub struct RunPodGateway<R: CommandRunner = ProcessCommandRunner> {
    config: RunPodConfig,
    runner: R,
    login: OnceCell<()>,
}

impl RunPodGateway<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(config: RunPodConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> RunPodGateway<R> {
    /// Creates a gateway using the provided runner.
    #[must_use]
    pub fn new(config: RunPodConfig, runner: R) -> Self {
        Self {
            config,
            runner,
            login: OnceCell::new(),
        }
    }

    /// Returns the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &RunPodConfig {
        &self.config
    }

    async fn ensure_login(&self) -> Result<(), ProviderError> {
        self.login
            .get_or_try_init(|| async {
                let Some(key) = self.config.api_key.as_deref() else {
                    warn!("no RunPod API key configured; using the existing runpodctl login");
                    return Ok(());
                };
                let args = [
                    OsString::from("config"),
                    OsString::from("--apiKey"),
                    OsString::from(key),
                ];
                self.invoke("config", &args).await.map(|_| ())
            })
            .await?;
        Ok(())
    }

    async fn invoke(&self, action: &str, args: &[OsString]) -> Result<ProcessOutput, ProviderError> {
        let program = self.config.runpodctl_bin.as_str();
        let output = self.runner.run(program, args).await?;
        if !output.is_success() || !output.stderr.trim().is_empty() {
            return Err(ProviderError::failure(
                program,
                action,
                output.code,
                &output.stderr,
            ));
        }
        Ok(output)
    }

    fn create_args(&self, request: &CreateRequest) -> Vec<OsString> {
        let config = &self.config;
        let overrides = &request.overrides;
        let mut args: Vec<OsString> = vec!["create".into(), "pod".into()];
        let mut flag = |name: &str, value: String| {
            args.push(OsString::from(name));
            args.push(OsString::from(value));
        };
        flag("--name", request.name.clone());
        flag("--gpuType", config.gpu_type.clone());
        flag(
            "--gpuCount",
            overrides.gpu_count.unwrap_or(config.gpu_count).to_string(),
        );
        flag(
            "--mem",
            overrides.memory_gb.unwrap_or(config.memory_gb).to_string(),
        );
        flag("--vcpu", overrides.vcpu.unwrap_or(config.vcpu).to_string());
        flag(
            "--imageName",
            overrides
                .image
                .clone()
                .unwrap_or_else(|| config.image.clone()),
        );
        if let Some(template) = config.template_id.as_deref() {
            flag("--templateId", template.to_owned());
        }
        if let Some(volume) = config.network_volume_id.as_deref() {
            flag("--networkVolumeId", volume.to_owned());
        }
        flag("--volumePath", config.volume_mount_path.clone());
        flag(
            "--volumeSize",
            overrides.disk_gb.unwrap_or(config.volume_gb).to_string(),
        );
        flag("--containerDiskSize", config.container_disk_gb.to_string());
        flag("--args", bootstrap_script(&config.forward_env));
        if config.secure_cloud {
            args.push(OsString::from("--secureCloud"));
        }
        args
    }
}

/// Container start command installing SSH access before handing over to
/// the image's own entrypoint.
pub(crate) fn bootstrap_script(forward_env: &str) -> String {
    let exports: String = forward_env
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| format!(" echo export {name}=${name} >> /etc/rp_environment;"))
        .collect();
    format!(
        "bash -c \" apt update; apt install -y git rsync; \
         DEBIAN_FRONTEND=noninteractive apt-get install openssh-server -y; \
         mkdir -p ~/.ssh; cd $_; chmod 700 ~/.ssh; \
         echo \\\"$PUBLIC_KEY\\\" >> authorized_keys; chmod 700 authorized_keys; \
         service ssh start;{exports} /start.sh\""
    )
}

impl<R: CommandRunner> ProviderGateway for RunPodGateway<R> {
    type Error = ProviderError;

    fn list_instances<'a>(
        &'a self,
        _region: Option<&'a str>,
    ) -> ProviderFuture<'a, Snapshot, Self::Error> {
        Box::pin(async move {
            self.ensure_login().await?;
            let args = [OsString::from("get"), OsString::from("pod"), OsString::from("-a")];
            let output = self.invoke("get pod", &args).await?;
            table::parse_pod_table(
                &self.config.runpodctl_bin,
                &output.stdout,
                self.config.ssh_key_path.as_deref(),
            )
        })
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a CreateRequest,
    ) -> ProviderFuture<'a, String, Self::Error> {
        Box::pin(async move {
            self.ensure_login().await?;
            let args = self.create_args(request);
            let output = self.invoke("create pod", &args).await?;
            let id = table::parse_created_id(&output.stdout).ok_or_else(|| {
                ProviderError::MissingCreatedId {
                    output: output.stdout.trim().to_owned(),
                }
            })?;
            info!(instance_id = %id, name = %request.name, "requested pod");
            Ok(id)
        })
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.ensure_login().await?;
            let args = [
                OsString::from("remove"),
                OsString::from("pod"),
                OsString::from(id),
            ];
            self.invoke("remove pod", &args).await.map(|_| ())
        })
    }
}
