use crate::{
    index::{self, Activation, Controller, ControllerMetrics, Index},
    k8s,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::time::Duration;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "iprule-controller", about = "A source-IP policy routing controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "iprule=info,warn",
        env = "IPRULE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Period between full reconciliation passes, in seconds. Watch events
    /// trigger additional passes.
    #[clap(long, default_value = "10")]
    reconcile_period_secs: u64,

    /// Namespace holding the controller deployment; used to list replica
    /// pods for the active-writer tie-break.
    #[clap(long, env = "POD_NAMESPACE", default_value = "iprule-system")]
    controller_namespace: String,

    /// Label selector matching the controller's replica pods.
    #[clap(long, default_value = "app=iprule-controller")]
    controller_pod_selector: String,
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
            reconcile_period_secs,
            controller_namespace,
            controller_pod_selector,
        } = self;

        let mut prom = <Registry>::default();
        let metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("iprule_controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").expect("Failed to fetch `HOSTNAME` environment variable");

        let (idx, changed) = Index::shared();

        // Spawn resource watches feeding the resolution inputs.

        let rules = runtime.watch_all::<k8s::IPRule>(watcher::Config::default());
        tokio::spawn(index::index_rules(idx.clone(), rules).instrument(info_span!("iprules")));

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            index::index_services(idx.clone(), services).instrument(info_span!("services")),
        );

        // Spawn the reconciliation loop.
        let activation = Activation::new(
            runtime.client(),
            &controller_namespace,
            &controller_pod_selector,
            &hostname,
        );
        let controller = Controller::new(
            runtime.client(),
            idx,
            changed,
            Duration::from_secs(reconcile_period_secs),
            activation,
            metrics,
        );
        tokio::spawn(controller.run().instrument(info_span!("controller")));

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
