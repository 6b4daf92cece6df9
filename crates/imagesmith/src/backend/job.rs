//! [`ExecutionBackend`] running build strategies as Kubernetes Jobs
//!
//! Every step but the last becomes an init container so steps run strictly in
//! order inside one pod; the last step is the pod's only container. Steps
//! share a `workspace` emptyDir and report results through their termination
//! messages.

use super::{
    parse_termination_message, BackendError, ExecutionBackend, JobHandle, JobSpec, JobState,
    JobStep, Observation, StepOutputs, StepResult, SubmissionError, RESULT_MESSAGE, RESULT_REASON,
};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/workspace";

#[derive(Clone)]
pub struct JobBackend {
    client: Client,
}

impl JobBackend {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn container(step: &JobStep, mounts: &[Value]) -> Value {
    let env: Vec<Value> = step
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut container = json!({
        "name": step.name,
        "image": step.image,
        "env": env,
        "volumeMounts": mounts,
        "terminationMessagePolicy": "FallbackToLogsOnError",
    });
    if !step.command.is_empty() {
        container["command"] = json!(step.command);
    }
    if !step.args.is_empty() {
        container["args"] = json!(step.args);
    }
    container
}

/// Render the Job object for a [`JobSpec`]
pub fn build_job(spec: &JobSpec) -> Result<Job, serde_json::Error> {
    let mut volumes = vec![json!({ "name": WORKSPACE_VOLUME, "emptyDir": {} })];
    let mut mounts = vec![json!({ "name": WORKSPACE_VOLUME, "mountPath": WORKSPACE_PATH })];
    for volume in &spec.volumes {
        volumes.push(json!({
            "name": volume.name,
            "secret": { "secretName": volume.secret_name }
        }));
        mounts.push(json!({
            "name": volume.name,
            "mountPath": volume.mount_path,
            "readOnly": true
        }));
    }

    let (last, earlier) = match spec.steps.split_last() {
        Some((last, earlier)) => (vec![container(last, &mounts)], earlier),
        None => (Vec::new(), &[][..]),
    };
    let init_containers: Vec<Value> = earlier.iter().map(|step| container(step, &mounts)).collect();

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "initContainers": init_containers,
        "containers": last,
        "volumes": volumes,
    });
    if let Some(account) = spec.service_account.as_ref().filter(|s| !s.trim().is_empty()) {
        pod_spec["serviceAccountName"] = json!(account);
    }

    let mut metadata = json!({
        "name": spec.name,
        "namespace": spec.namespace,
        "labels": spec.labels,
    });
    if let Some(owner) = &spec.owner {
        metadata["ownerReferences"] = json!([owner]);
    }

    serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": metadata,
        "spec": {
            "backoffLimit": 0,
            "activeDeadlineSeconds": spec.timeout_seconds,
            "template": {
                "metadata": { "labels": spec.labels },
                "spec": pod_spec
            }
        }
    }))
}

fn step_result(status: &ContainerStatus) -> StepResult {
    let terminated = status
        .state
        .as_ref()
        .and_then(|state| state.terminated.as_ref());

    let Some(terminated) = terminated else {
        return StepResult {
            name: status.name.clone(),
            ..StepResult::default()
        };
    };

    let output = terminated.message.clone().unwrap_or_default();
    let reported = parse_termination_message(&output).unwrap_or_default();

    StepResult {
        name: status.name.clone(),
        exit_code: Some(terminated.exit_code),
        reason: reported
            .get(RESULT_REASON)
            .cloned()
            .or_else(|| terminated.reason.clone()),
        message: reported.get(RESULT_MESSAGE).cloned(),
        output,
    }
}

/// Derive an [`Observation`] from a Job and the pods it created
pub fn observe_job(job: &Job, pods: &[Pod]) -> Observation {
    let mut observation = Observation::default();

    // Latest pod wins; backoffLimit 0 normally leaves exactly one
    let pod = pods
        .iter()
        .max_by_key(|pod| pod.metadata.creation_timestamp.as_ref().map(|t| t.0));

    if let Some(status) = pod.and_then(|pod| pod.status.as_ref()) {
        observation.evicted = status.reason.as_deref() == Some("Evicted");
        if observation.evicted {
            observation.reason = Some("Evicted".to_string());
            observation.message = status.message.clone();
        }

        let statuses = status
            .init_container_statuses
            .iter()
            .flatten()
            .chain(status.container_statuses.iter().flatten());
        for container_status in statuses {
            let step = step_result(container_status);
            if let Some(values) = parse_termination_message(&step.output) {
                observation.results.absorb(&values);
            }
            observation.steps.push(step);
        }
    }

    let job_status = job.status.as_ref();
    let failed_condition = job_status
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
        });

    if let Some(condition) = failed_condition {
        observation.deadline_exceeded = condition.reason.as_deref() == Some("DeadlineExceeded");
        if observation.reason.is_none() {
            observation.reason = condition.reason.clone();
            observation.message = condition.message.clone();
        }
    }

    let succeeded = job_status.and_then(|s| s.succeeded).unwrap_or(0) > 0;
    let failed = job_status.and_then(|s| s.failed).unwrap_or(0) > 0;
    let active = job_status.and_then(|s| s.active).unwrap_or(0) > 0;
    let pod_started = observation
        .steps
        .iter()
        .any(|step| step.exit_code.is_some())
        || pod
            .and_then(|pod| pod.status.as_ref())
            .and_then(|status| status.phase.as_deref())
            == Some("Running");

    observation.state = if succeeded {
        JobState::Succeeded
    } else if failed || failed_condition.is_some() || observation.evicted {
        JobState::Failed
    } else if active && pod_started {
        JobState::Running
    } else {
        JobState::Pending
    };
    observation
}

fn classify_submission(err: kube::Error, name: &str) -> SubmissionError {
    match err {
        kube::Error::Api(response) if response.code == 409 => {
            SubmissionError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(response)
            if response.code == 429
                || response.code >= 500
                || (response.code == 403 && response.message.contains("exceeded quota")) =>
        {
            SubmissionError::Transient(response.message)
        }
        kube::Error::Api(response) => SubmissionError::Rejected(response.message),
        other => SubmissionError::Transient(other.to_string()),
    }
}

#[async_trait]
impl ExecutionBackend for JobBackend {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError> {
        let job = build_job(spec).map_err(|e| SubmissionError::Rejected(e.to_string()))?;
        self.jobs(&spec.namespace)
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| classify_submission(e, &spec.name))?;

        info!(job = %spec.name, namespace = %spec.namespace, steps = spec.steps.len(), "Created build job");
        Ok(spec.handle())
    }

    async fn observe(&self, handle: &JobHandle) -> Result<Observation, BackendError> {
        let job = self
            .jobs(&handle.namespace)
            .get_opt(&handle.name)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?
            .ok_or_else(|| BackendError::NotFound(handle.name.clone()))?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &handle.namespace);
        let pods = pods
            .list(&ListParams::default().labels(&format!("job-name={}", handle.name)))
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let observation = observe_job(&job, &pods.items);
        debug!(job = %handle.name, state = ?observation.state, "Observed build job");
        Ok(observation)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), BackendError> {
        match self
            .jobs(&handle.namespace)
            .delete(&handle.name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!(job = %handle.name, "Deleted build job");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(BackendError::NotFound(handle.name.clone()))
            }
            Err(e) => Err(BackendError::Unavailable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{JobVolume, StepOutputs};
    use std::collections::BTreeMap;

    fn spec() -> JobSpec {
        JobSpec {
            name: "app-run-1-build".to_string(),
            namespace: "builds".to_string(),
            labels: BTreeMap::from([("imagesmith.dev/buildrun".to_string(), "run-1".to_string())]),
            owner: None,
            service_account: Some("builder".to_string()),
            steps: vec![
                JobStep {
                    name: "source-default".to_string(),
                    image: "alpine/git".to_string(),
                    ..JobStep::default()
                },
                JobStep {
                    name: "build-and-push".to_string(),
                    image: "quay.io/buildah/stable".to_string(),
                    command: vec!["buildah".to_string()],
                    args: vec!["bud".to_string()],
                    env: vec![("STORAGE_DRIVER".to_string(), "vfs".to_string())],
                },
            ],
            volumes: vec![JobVolume {
                name: "push-credentials".to_string(),
                secret_name: "push-secret".to_string(),
                mount_path: "/var/run/imagesmith/push".to_string(),
            }],
            timeout_seconds: 600,
        }
    }

    #[test]
    fn steps_run_as_init_containers_then_final_container() {
        let job = build_job(&spec()).unwrap();
        let job_spec = job.spec.unwrap();
        assert_eq!(job_spec.active_deadline_seconds, Some(600));
        assert_eq!(job_spec.backoff_limit, Some(0));

        let pod = job_spec.template.spec.unwrap();
        let init = pod.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, "source-default");
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].name, "build-and-push");
        assert_eq!(pod.service_account_name.as_deref(), Some("builder"));
        assert_eq!(pod.volumes.unwrap().len(), 2);
    }

    fn pod_with(status: Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": { "name": "app-run-1-build-xyz" },
            "status": status
        }))
        .unwrap()
    }

    fn job_with(status: Value) -> Job {
        serde_json::from_value(json!({
            "metadata": { "name": "app-run-1-build" },
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn successful_job_reports_step_results() {
        let pod = pod_with(json!({
            "phase": "Succeeded",
            "initContainerStatuses": [{
                "name": "source-default", "image": "git", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "terminated": { "exitCode": 0, "message": "{\"commit-sha\":\"abc123\"}" } }
            }],
            "containerStatuses": [{
                "name": "build-and-push", "image": "buildah", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "terminated": { "exitCode": 0, "message": "{\"image-digest\":\"sha256:feed\"}" } }
            }]
        }));
        let job = job_with(json!({ "succeeded": 1 }));

        let observation = observe_job(&job, &[pod]);
        assert_eq!(observation.state, JobState::Succeeded);
        assert_eq!(observation.steps.len(), 2);
        assert_eq!(
            observation.results,
            StepOutputs {
                image_digest: Some("sha256:feed".to_string()),
                commit_sha: Some("abc123".to_string()),
                ..StepOutputs::default()
            }
        );
    }

    #[test]
    fn eviction_and_deadline_are_infra_signals() {
        let evicted = pod_with(json!({ "phase": "Failed", "reason": "Evicted", "message": "node low on memory" }));
        let observation = observe_job(&job_with(json!({ "active": 1 })), &[evicted]);
        assert_eq!(observation.state, JobState::Failed);
        assert!(observation.evicted);

        let job = job_with(json!({
            "failed": 1,
            "conditions": [{ "type": "Failed", "status": "True", "reason": "DeadlineExceeded" }]
        }));
        let observation = observe_job(&job, &[]);
        assert_eq!(observation.state, JobState::Failed);
        assert!(observation.deadline_exceeded);
    }

    #[test]
    fn new_job_without_pods_is_pending() {
        let observation = observe_job(&job_with(json!({ "active": 1 })), &[]);
        assert_eq!(observation.state, JobState::Pending);
    }
}
