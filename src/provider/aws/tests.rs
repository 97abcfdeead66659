//! Unit tests for the EC2 backend.

use rstest::{fixture, rstest};
use serde_json::json;

use super::*;
use crate::provider::ResourceOverrides;
use crate::test_support::{ScriptedRunner, aws_config};

fn instance(id: &str, name: &str, state: &str, ip: Option<&str>, owned: bool) -> serde_json::Value {
    let mut tags = vec![json!({"Key": "Name", "Value": name})];
    if owned {
        tags.push(json!({"Key": "PodFleet", "Value": "true"}));
    }
    json!({
        "InstanceId": id,
        "State": {"Code": 16, "Name": state},
        "PublicIpAddress": ip,
        "Tags": tags,
        "InstanceType": "g5.xlarge",
        "ImageId": "ami-123",
        "CpuOptions": {"CoreCount": 2, "ThreadsPerCore": 2}
    })
}

fn listing(instances: Vec<serde_json::Value>) -> String {
    json!({"Reservations": [{"Instances": instances}]}).to_string()
}

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

#[rstest]
fn listing_filters_foreign_and_terminated() {
    let gateway = AwsGateway::new(aws_config(), ScriptedRunner::new());
    let text = listing(vec![
        instance("i-1", "grp_0", "running", Some("198.51.100.1"), true),
        instance("i-2", "grp_1", "pending", None, true),
        instance("i-3", "other", "running", Some("198.51.100.3"), false),
        instance("i-4", "grp_2", "terminated", Some("198.51.100.4"), true),
    ]);

    let snapshot = gateway.parse_listing(&text).expect("listing should parse");

    assert_eq!(snapshot.instances.len(), 1);
    let record = snapshot.find("i-1").expect("owned instance");
    assert_eq!(record.name.to_string(), "grp_0");
    assert_eq!(record.endpoint.user, "ubuntu");
    assert_eq!(record.endpoint.home_dir, "/home/ubuntu");
    assert_eq!(record.endpoint.env_file, "~/.bashrc");
    assert_eq!(record.endpoint.port, 22);
    assert_eq!(record.resources.vcpu, Some(4));
    assert_eq!(record.resources.instance_type.as_deref(), Some("g5.xlarge"));
    assert_eq!(snapshot.foreign, ["i-3"]);
    let degraded = snapshot.degraded.first().expect("pending instance");
    assert_eq!(degraded.id, "i-2");
}

#[rstest]
fn missing_name_tag_falls_back_to_id() {
    let gateway = AwsGateway::new(aws_config(), ScriptedRunner::new());
    let text = json!({"Reservations": [{"Instances": [{
        "InstanceId": "i-9",
        "State": {"Name": "running"},
        "PublicIpAddress": "198.51.100.9",
        "Tags": [{"Key": "PodFleet", "Value": "true"}]
    }]}]})
    .to_string();

    let snapshot = gateway.parse_listing(&text).expect("listing should parse");
    let record = snapshot.find("i-9").expect("instance listed");
    assert_eq!(record.name.to_string(), "i-9");
}

#[rstest]
fn malformed_json_is_a_parse_error() {
    let gateway = AwsGateway::new(aws_config(), ScriptedRunner::new());
    let err = gateway
        .parse_listing("not json")
        .expect_err("garbage should fail");
    assert!(matches!(err, ProviderError::Parse { .. }));
}

#[rstest]
#[tokio::test]
async fn list_passes_region(runner: ScriptedRunner) {
    runner.push_output(Some(0), listing(vec![]), "");
    let gateway = AwsGateway::new(aws_config(), runner.clone());

    let snapshot = gateway
        .list_instances(Some("eu-west-1"))
        .await
        .expect("listing should succeed");

    assert!(snapshot.instances.is_empty());
    let call = runner.invocations().into_iter().next().expect("one call");
    assert_eq!(
        call.command_string(),
        "aws ec2 describe-instances --output json --region eu-west-1"
    );
}

#[rstest]
#[tokio::test]
async fn create_builds_run_instances_call(runner: ScriptedRunner) {
    runner.push_output(
        Some(0),
        json!({"Instances": [{"InstanceId": "i-new"}]}).to_string(),
        "",
    );
    let gateway = AwsGateway::new(aws_config(), runner.clone());
    let request = CreateRequest {
        name: String::from("grp_5"),
        overrides: ResourceOverrides {
            disk_gb: Some(200),
            ..ResourceOverrides::default()
        },
    };

    let id = gateway
        .create_instance(&request)
        .await
        .expect("create should succeed");

    assert_eq!(id, "i-new");
    let command = runner
        .invocations()
        .into_iter()
        .next()
        .expect("one call")
        .command_string();
    assert!(command.starts_with("aws ec2 run-instances --image-id ami-base"));
    assert!(command.contains("--security-group-ids sg-1 sg-2"));
    assert!(command.contains("VolumeSize=200,VolumeType=gp3"));
    assert!(command.contains("{Key=Name,Value=grp_5},{Key=PodFleet,Value=true}"));
}

#[rstest]
#[tokio::test]
async fn terminate_failure_reports_stderr(runner: ScriptedRunner) {
    runner.push_output(Some(255), "", "InvalidInstanceID.NotFound");
    let gateway = AwsGateway::new(aws_config(), runner);

    let err = gateway
        .terminate_instance("i-gone")
        .await
        .expect_err("non-zero exit should fail");

    assert!(err.to_string().contains("InvalidInstanceID.NotFound"));
}
