use crate::{
    action::{self, ActionService},
    admission::Admission,
    core::SidecarConfig,
    index::Index,
    k8s::{policy::PolicyDefinition, watcher},
    quarantine::Quarantine,
    queue::Queue,
    reconcile::Reconciler,
    repository::KubeRepository,
};
use anyhow::{bail, Result};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "cluster-monitor",
    about = "Injects monitoring sidecars into the deployments selected by PolicyDefinitions"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "cluster_monitor=info,warn",
        env = "CLUSTER_MONITOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission webhook server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// A YAML file listing the containers and volumes added to injected pods.
    #[clap(long, default_value = "/etc/webhook/config/sidecarconfig.yaml")]
    sidecar_config: PathBuf,

    /// The address on which the quarantine action endpoint is served.
    #[clap(long, default_value = "0.0.0.0:9080")]
    action_addr: SocketAddr,

    /// Bounds the webhook's lookup of a pod's deployment. Must stay below the
    /// webhook timeout configured on the API server.
    #[clap(long, default_value = "8000")]
    admission_timeout_ms: u64,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// The number of distinct policies that may wait for reconciliation.
    #[clap(long, default_value = "1024")]
    queue_capacity: usize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            sidecar_config,
            action_addr,
            admission_timeout_ms,
            patch_timeout_ms,
            queue_capacity,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder())
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // The webhook cannot run without its template, so a bad file is fatal.
        let sidecar = Arc::new(SidecarConfig::load(&sidecar_config)?);
        info!(
            containers = sidecar.containers.len(),
            volumes = sidecar.volumes.len(),
            "Sidecar template ready"
        );

        let repo = KubeRepository::new(runtime.client(), Duration::from_millis(patch_timeout_ms));

        // Index policy events and feed them to a single reconciler.
        let queue = Queue::new(queue_capacity);
        let index = Index::shared(queue.clone());
        let policies = runtime.watch_all::<PolicyDefinition>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), policies)
                .instrument(info_span!("policydefinitions")),
        );

        let reconciler = Reconciler::new(repo.clone(), index, queue);
        tokio::spawn(
            reconciler
                .run(runtime.shutdown_handle().signaled())
                .instrument(info_span!("reconciler")),
        );

        let actions = ActionService::new(Quarantine::new(repo.clone()));
        let drain = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                if let Err(error) = action::serve(action_addr, actions, drain).await {
                    error!(%error, "Action server failed");
                }
            }
            .instrument(info_span!("action")),
        );

        let admission = Admission::new(
            repo,
            sidecar,
            Duration::from_millis(admission_timeout_ms),
        );
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
