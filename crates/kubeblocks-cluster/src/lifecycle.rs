//! User-defined lifecycle actions
//!
//! Actions declared on definitions run as commands inside the target pods of
//! a component. Arguments are passed as environment variables prepended to
//! the command with `env`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::{Client, ResourceExt};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use kubeblocks_common::constants::ROLE_LABEL;
use kubeblocks_common::crd::{Action, ExecAction, PreConditionType, TargetPodSelector};
use kubeblocks_common::{label_selector, Error, Result};

/// Where an action runs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionOptions {
    /// Namespace of the target pods
    pub namespace: String,
    /// Owning cluster
    pub cluster: String,
    /// Full name of the target component
    pub component: String,
    /// ComponentDefinition of the target component
    pub comp_def: String,
    /// Labels the target pods must carry
    pub selector: BTreeMap<String, String>,
}

/// Runs user-defined actions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LifecycleActions: Send + Sync {
    /// Run `action` against the pods selected by `options`
    ///
    /// `args` are exposed to the action as environment variables.
    async fn user_defined(
        &self,
        options: &ActionOptions,
        name: &str,
        action: &Action,
        args: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Runs actions through the pod exec subresource
pub struct ExecLifecycleActions {
    client: Client,
}

impl ExecLifecycleActions {
    /// Create a runner using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Check the action's precondition against the candidate pods
fn check_precondition(name: &str, action: &Action, pods: &[Pod]) -> Result<()> {
    match action.pre_condition.unwrap_or_default() {
        PreConditionType::Immediately => Ok(()),
        PreConditionType::RuntimeReady
        | PreConditionType::ComponentReady
        | PreConditionType::ClusterReady => {
            if pods.is_empty() {
                return Err(Error::action_precondition_failed(name, "no pods to run the action"));
            }
            if !pods.iter().all(is_pod_ready) {
                return Err(Error::action_precondition_failed(name, "not all pods are ready"));
            }
            Ok(())
        }
    }
}

/// Pick the pods an exec action runs on
fn select_target_pods<'a>(name: &str, exec: &ExecAction, pods: &'a [Pod]) -> Result<Vec<&'a Pod>> {
    let mut sorted: Vec<&Pod> = pods.iter().collect();
    sorted.sort_by_key(|p| p.name_any());

    let selected: Vec<&Pod> = match exec.target_pod_selector.unwrap_or_default() {
        TargetPodSelector::Any => sorted
            .iter()
            .find(|p| is_pod_ready(p))
            .or(sorted.first())
            .into_iter()
            .copied()
            .collect(),
        TargetPodSelector::All => sorted,
        TargetPodSelector::Role => {
            let role = exec.matching_key.as_deref().unwrap_or_default();
            sorted
                .into_iter()
                .filter(|p| p.labels().get(ROLE_LABEL).map(String::as_str) == Some(role))
                .collect()
        }
        TargetPodSelector::Ordinal => {
            let suffix = format!("-{}", exec.matching_key.as_deref().unwrap_or_default());
            sorted
                .into_iter()
                .filter(|p| p.name_any().ends_with(&suffix))
                .collect()
        }
    };

    if selected.is_empty() {
        return Err(Error::action_precondition_failed(
            name,
            "no pod matches the target pod selector",
        ));
    }
    Ok(selected)
}

/// Build the command line: `env K=V ... command args`
pub fn build_command(exec: &ExecAction, args: &BTreeMap<String, String>) -> Vec<String> {
    let mut command = Vec::new();
    let env: Vec<String> = exec
        .env
        .iter()
        .filter_map(|e| e.value.as_ref().map(|v| format!("{}={}", e.name, v)))
        .chain(args.iter().map(|(k, v)| format!("{}={}", k, v)))
        .collect();
    if !env.is_empty() {
        command.push("env".to_string());
        command.extend(env);
    }
    command.extend(exec.command.iter().cloned());
    command.extend(exec.args.iter().cloned());
    command
}

impl ExecLifecycleActions {
    async fn exec_in_pod(
        &self,
        api: &Api<Pod>,
        pod: &str,
        name: &str,
        exec: &ExecAction,
        command: &[String],
    ) -> Result<String> {
        let mut params = AttachParams::default().stdout(true).stderr(true);
        if let Some(container) = &exec.container {
            params = params.container(container.clone());
        }
        let mut process = api.exec(pod, command.to_vec(), &params).await?;

        let mut output = String::new();
        if let Some(mut stdout) = process.stdout() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| Error::action(name, format!("read output from {}: {}", pod, e)))?;
        }
        let mut errors = String::new();
        if let Some(mut stderr) = process.stderr() {
            stderr
                .read_to_string(&mut errors)
                .await
                .map_err(|e| Error::action(name, format!("read errors from {}: {}", pod, e)))?;
        }

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        if let Some(status) = status {
            if status.status.as_deref() != Some("Success") {
                let message = status.message.unwrap_or_default();
                return Err(Error::action(
                    name,
                    format!("{} on pod {}: {}", message, pod, errors.trim()),
                ));
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl LifecycleActions for ExecLifecycleActions {
    async fn user_defined(
        &self,
        options: &ActionOptions,
        name: &str,
        action: &Action,
        args: &BTreeMap<String, String>,
    ) -> Result<()> {
        let Some(exec) = action.exec.as_ref() else {
            return Err(Error::action(name, "the action has no exec handler"));
        };

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &options.namespace);
        let lp = ListParams::default().labels(&label_selector(&options.selector));
        let pods = api.list(&lp).await?.items;

        check_precondition(name, action, &pods)?;
        let targets = select_target_pods(name, exec, &pods)?;
        let command = build_command(exec, args);

        for pod in targets {
            let pod_name = pod.name_any();
            info!(action = %name, component = %options.component, pod = %pod_name, "running lifecycle action");

            let run = self.exec_in_pod(&api, &pod_name, name, exec, &command);
            let output = if action.timeout_seconds > 0 {
                let timeout = Duration::from_secs(action.timeout_seconds as u64);
                tokio::time::timeout(timeout, run).await.map_err(|_| {
                    Error::action(name, format!("timed out after {:?} on pod {}", timeout, pod_name))
                })??
            } else {
                run.await?
            };
            debug!(action = %name, pod = %pod_name, output = %output.trim(), "lifecycle action finished");
        }
        Ok(())
    }
}
