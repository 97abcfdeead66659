//! Binary entry point for the podfleet CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use podfleet::{
    AwsConfig, AwsGateway, Commands, ConfigError, FanOutReport, Fleet, FleetConfig, FleetContext,
    FleetError, NodeOutcome, OutputStream, ProviderGateway, ProviderKind, PruneReport,
    RemoteError, ResourceOverrides, RunPodConfig, RunPodGateway, Selector, SshTransport,
    SyncReport,
};

mod cli;

use cli::{Cli, Command, MakeCommand, SshCommand};

#[cfg(test)]
mod main_tests;

type CliFleet<G> = Fleet<G, SshTransport>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("fleet error: {0}")]
    Fleet(String),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = FleetConfig::load_without_cli_args()?;
    config.validate()?;
    match config.provider_kind()? {
        ProviderKind::RunPod => {
            let runpod = RunPodConfig::load_without_cli_args()?;
            runpod.validate()?;
            execute(cli, &config, RunPodGateway::with_process_runner(runpod)).await
        }
        ProviderKind::Aws => {
            let mut aws = AwsConfig::load_without_cli_args()?;
            if let Command::Make(ref make) = cli.command {
                apply_launch_overrides(&mut aws, make);
                aws.validate_for_launch()?;
            } else {
                aws.validate()?;
            }
            execute(cli, &config, AwsGateway::with_process_runner(aws)).await
        }
    }
}

fn apply_launch_overrides(aws: &mut AwsConfig, make: &MakeCommand) {
    if let Some(instance_type) = &make.instance_type {
        aws.instance_type.clone_from(instance_type);
    }
    if let Some(ami) = &make.ami {
        aws.ami_id.clone_from(ami);
    }
    if make.region.is_some() {
        aws.region.clone_from(&make.region);
    }
}

fn creation_overrides(command: &Command) -> ResourceOverrides {
    let Command::Make(make) = command else {
        return ResourceOverrides::default();
    };
    ResourceOverrides {
        memory_gb: make.mem,
        vcpu: make.vcpu,
        gpu_count: make.gpus,
        disk_gb: make.disk,
        image: make.image.clone(),
    }
}

async fn execute<G: ProviderGateway>(
    cli: Cli,
    config: &FleetConfig,
    gateway: G,
) -> Result<i32, CliError> {
    let Cli {
        group,
        all,
        select,
        command,
        ..
    } = cli;
    let context = Arc::new(FleetContext::new(
        gateway,
        SshTransport::new(config.ssh_options()),
        config.project()?,
        config.settings(),
    ));
    let scope = if all {
        None
    } else {
        group.or_else(|| config.group.clone())
    };

    let mut fleet = Fleet::discover(context, scope, creation_overrides(&command))
        .await
        .map_err(|err| fleet_error(&err))?;
    if let Some(text) = select.as_deref() {
        let Ok(selector) = text.parse::<Selector>();
        fleet = fleet.select(&selector).map_err(|err| fleet_error(&err))?;
    }

    let mut out = io::stdout();
    match command {
        Command::List => {
            write_listing(&mut out, &fleet)?;
            Ok(0)
        }
        Command::Make(make) => make_pods(&mut out, &mut fleet, make.count).await,
        Command::Exec(exec) => {
            validate_command_args(&exec.command)?;
            let report = fleet
                .running()
                .run(
                    Commands::broadcast(exec.command.join(" ")),
                    !exec.no_cd,
                    exec.purge_after,
                )
                .await
                .map_err(|err| fleet_error(&err))?;
            write_fan_out(&mut out, &report)
        }
        Command::Py(py) => {
            validate_command_args(&py.args)?;
            let report = fleet
                .running()
                .run_py(&py.args.join(" "))
                .await
                .map_err(|err| fleet_error(&err))?;
            write_fan_out(&mut out, &report)
        }
        Command::Sync => {
            let report = fleet
                .running()
                .sync()
                .await
                .map_err(|err| fleet_error(&err))?;
            write_sync(&mut out, &report)
        }
        Command::Setup(setup) => {
            let report = fleet
                .running()
                .setup(setup.min_done)
                .await
                .map_err(|err| fleet_error(&err))?;
            let synced = write_sync(&mut out, &report.sync)?;
            let installed = write_fan_out(&mut out, &report.install)?;
            Ok(synced.max(installed))
        }
        Command::Prune(prune) => {
            let report = fleet
                .running()
                .prune(prune.keep, &prune.probe)
                .await
                .map_err(|err| fleet_error(&err))?;
            write_prune(&mut out, &report)?;
            Ok(0)
        }
        Command::Purge => {
            fleet.purge().await.map_err(|err| fleet_error(&err))?;
            writeln!(out, "Purged.")?;
            Ok(0)
        }
        Command::Ssh(ssh) => {
            writeln!(out, "{}", ssh_invocation(&fleet.running(), &ssh)?)?;
            Ok(0)
        }
    }
}

async fn make_pods<G: ProviderGateway>(
    mut out: impl Write,
    fleet: &mut CliFleet<G>,
    count: u32,
) -> Result<i32, CliError> {
    let ids = fleet
        .make_new_pods(count)
        .await
        .map_err(|err| fleet_error(&err))?;
    fleet.wait_pending().await.map_err(|err| fleet_error(&err))?;
    for id in ids {
        if let Some(node) = fleet.get(&id) {
            writeln!(out, "{}\t{id}", node.name())?;
        }
    }
    Ok(0)
}

fn ssh_invocation<G: ProviderGateway>(
    fleet: &CliFleet<G>,
    args: &SshCommand,
) -> Result<String, CliError> {
    let Ok(selector) = args.pod.parse::<Selector>();
    let chosen = fleet.select(&selector).map_err(|err| fleet_error(&err))?;
    let Some(node) = chosen.nodes().first() else {
        return Err(CliError::Fleet(format!(
            "no running pod matches `{}`",
            args.pod
        )));
    };
    let mut endpoint = node.record().endpoint.clone();
    if let Some(user) = &args.user {
        endpoint.user.clone_from(user);
    }
    let base = fleet.context().transport.interactive_command(&endpoint);
    let remote_line = args
        .command
        .as_deref()
        .map(|cmd| node.remote_command(cmd, true))
        .transpose()?;
    Ok(render_ssh_invocation(&base, remote_line.as_deref()))
}

fn render_ssh_invocation(base: &str, remote_line: Option<&str>) -> String {
    remote_line.map_or_else(
        || base.to_owned(),
        |line| format!("{base} {}", escape(line.into())),
    )
}

fn write_listing<G, T>(mut out: impl Write, fleet: &Fleet<G, T>) -> io::Result<()> {
    if fleet.is_empty() {
        return writeln!(out, "No pods.");
    }
    for node in fleet.nodes() {
        let record = node.record();
        writeln!(
            out,
            "{}\t{}\t{}\t{}:{}",
            record.name, record.id, record.status, record.endpoint.host, record.endpoint.port
        )?;
    }
    Ok(())
}

/// Prints every node's outcome and returns the process exit code: zero only
/// when every dispatched command exited successfully. Cancelled nodes do not
/// count as failures.
fn write_fan_out(mut out: impl Write, report: &FanOutReport) -> Result<i32, CliError> {
    let mut code = 0;
    for entry in &report.entries {
        match &entry.outcome {
            NodeOutcome::Completed(output) => {
                let status = output
                    .exit_code()
                    .map_or_else(|| String::from("signal"), |exit| exit.to_string());
                writeln!(out, "== {} ({status}) ==", entry.name)?;
                write!(out, "{}", output.render(OutputStream::Both))?;
                if !output.succeeded() {
                    code = 1;
                }
            }
            NodeOutcome::Removed => {
                writeln!(out, "== {} removed: host key not verified ==", entry.name)?;
                code = 1;
            }
            NodeOutcome::Failed(message) => {
                writeln!(out, "== {} failed: {message} ==", entry.name)?;
                code = 1;
            }
            NodeOutcome::Cancelled => writeln!(out, "== {} cancelled ==", entry.name)?,
        }
    }
    Ok(code)
}

fn write_sync(mut out: impl Write, report: &SyncReport) -> Result<i32, CliError> {
    for name in &report.synced {
        writeln!(out, "synced {name}")?;
    }
    for name in &report.removed {
        writeln!(out, "removed {name}: host key not verified")?;
    }
    for (name, message) in &report.failed {
        writeln!(out, "failed {name}: {message}")?;
    }
    let clean = report.removed.is_empty() && report.failed.is_empty();
    Ok(i32::from(!clean))
}

fn write_prune(mut out: impl Write, report: &PruneReport) -> io::Result<()> {
    writeln!(out, "kept: {}", report.kept.join(", "))?;
    writeln!(out, "removed: {}", report.removed.join(", "))
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

/// Flattens a fleet error and its sources into one message.
fn fleet_error<E>(err: &FleetError<E>) -> CliError
where
    E: std::error::Error + 'static,
{
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    CliError::Fleet(message)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
