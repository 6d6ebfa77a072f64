//! KubeBlocks operator: cluster and InstanceSet controllers

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, ResourceExt};

use kubeblocks_common::config::OperatorArgs;
use kubeblocks_common::crd::{
    Cluster, ClusterDefinition, Component, ComponentDefinition, ComponentVersion, InstanceSet,
    ShardingDefinition, SidecarDefinition,
};
use kubeblocks_common::telemetry::{init_telemetry, TelemetryConfig};
use kubeblocks_common::{OperatorConfig, FIELD_MANAGER};

/// KubeBlocks - database cluster operator
#[derive(Parser, Debug)]
#[command(name = "kubeblocks-operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    operator: OperatorArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default mode)
    ///
    /// Watches Clusters and InstanceSets and reconciles them together with
    /// the objects they own.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "kubeblocks-operator".to_string(),
        json: cli.operator.log_json,
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli.operator).await,
    }
}

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ClusterDefinition::crd(),
        ComponentDefinition::crd(),
        ComponentVersion::crd(),
        ShardingDefinition::crd(),
        SidecarDefinition::crd(),
        Cluster::crd(),
        Component::crd(),
        InstanceSet::crd(),
    ]
}

/// Install every KubeBlocks CRD with server-side apply
///
/// Keeps the installed schemas in step with the running operator.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }
    Ok(())
}

async fn run_controller(args: &OperatorArgs) -> anyhow::Result<()> {
    tracing::info!("KubeBlocks operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let version = client
        .apiserver_version()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read API server version: {}", e))?;
    let config = Arc::new(OperatorConfig::from_args(args, &version.major, &version.minor));
    tracing::info!(
        server = %format!("{}.{}", version.major, version.minor),
        vertical_scaling = ?config.vertical_scaling,
        "Operator configured"
    );

    let cluster_ctx = Arc::new(
        kubeblocks_cluster::Context::builder(client.clone())
            .config(config.clone())
            .build(),
    );
    let its_ctx = Arc::new(
        kubeblocks_instanceset::Context::builder(client.clone())
            .config(config)
            .build(),
    );

    tracing::info!("Starting Cluster controller");
    let cluster_controller = Controller::new(Api::<Cluster>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Component>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Service>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Secret>::all(client.clone()), WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            kubeblocks_cluster::reconcile,
            kubeblocks_cluster::error_policy,
            cluster_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Cluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Cluster reconciliation error");
                }
            }
        });

    tracing::info!("Starting InstanceSet controller");
    let its_controller = Controller::new(Api::<InstanceSet>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Pod>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Service>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<ConfigMap>::all(client), WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            kubeblocks_instanceset::reconcile,
            kubeblocks_instanceset::error_policy,
            its_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "InstanceSet reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "InstanceSet reconciliation error");
                }
            }
        });

    tokio::select! {
        _ = cluster_controller => {
            tracing::info!("Cluster controller completed");
        }
        _ = its_controller => {
            tracing::info!("InstanceSet controller completed");
        }
    }

    tracing::info!("KubeBlocks operator shutting down");
    Ok(())
}
