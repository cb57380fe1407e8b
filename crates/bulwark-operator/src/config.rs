//! Command-line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use bulwark_common::kube_utils::{controller_namespace, controller_service_account};
use bulwark_engine::context::DEFAULT_FANOUT_LIMIT;
use bulwark_engine::poll::Backoff;
use bulwark_engine::EngineConfig;
use clap::Parser;

/// Bulwark - runs blueprint actions requested by ActionSets
#[derive(Parser, Debug, Clone)]
#[command(name = "bulwark-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Path to a kubeconfig; in-cluster config when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace the controller runs in; function pods default to it
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: Option<String>,

    /// Service account function pods run as
    #[arg(long, env = "POD_SERVICE_ACCOUNT")]
    pub service_account: Option<String>,

    /// Maximum pods or containers a fan-out function works on at once
    #[arg(long, env = "BULWARK_FANOUT_LIMIT", default_value_t = DEFAULT_FANOUT_LIMIT)]
    pub fanout_limit: usize,

    /// Initial delay between readiness and condition checks
    #[arg(long, env = "BULWARK_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Skip installing CRDs on startup
    #[arg(long, env = "BULWARK_SKIP_CRD_INSTALL")]
    pub skip_crd_install: bool,
}

impl Cli {
    /// Engine settings derived from the flags, falling back to the pod's own identity
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            controller_namespace: self
                .namespace
                .clone()
                .unwrap_or_else(controller_namespace),
            service_account: self
                .service_account
                .clone()
                .unwrap_or_else(controller_service_account),
            fanout_limit: self.fanout_limit.max(1),
            poll_backoff: Backoff {
                initial: Duration::from_millis(self.poll_interval_ms.max(1)),
                ..defaults.poll_backoff
            },
            ..defaults
        }
    }
}
