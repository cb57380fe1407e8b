//! Bulwark operator binary

use std::sync::Arc;

use bulwark_common::kube_utils::create_client;
use bulwark_common::telemetry::{init_telemetry, TelemetryConfig};
use bulwark_engine::cluster::{ClusterClient, KubeClusterClient};
use bulwark_engine::pod::KubePodControllerFactory;
use bulwark_engine::{ExecContext, FunctionRegistry};
use clap::Parser;

use bulwark_operator::controller_runner::{crds, ensure_crds_installed, run_actionset_controller};
use bulwark_operator::{Cli, Context};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "bulwark-operator".to_string(),
        ..Default::default()
    })?;

    run_controller(cli).await
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Bulwark controller starting...");

    let client = create_client(cli.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !cli.skip_crd_install {
        ensure_crds_installed(&client).await?;
    }

    let config = cli.engine_config();
    tracing::info!(
        namespace = %config.controller_namespace,
        service_account = %config.service_account,
        fanout_limit = config.fanout_limit,
        "engine configured"
    );

    let registry = FunctionRegistry::with_builtins()?;
    tracing::info!(functions = ?registry.names(), "functions registered");

    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let pods = Arc::new(KubePodControllerFactory::new(cluster.clone(), &config));
    let exec = ExecContext::new(cluster, pods, config);
    let ctx = Arc::new(Context::new(client.clone(), Arc::new(registry), exec));

    run_actionset_controller(client, ctx).await;

    tracing::info!("Bulwark controller shutting down");
    Ok(())
}
