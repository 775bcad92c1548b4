use crate::{metrics::AgentMetrics, rules::NetlinkRules, sync::Synchronizer};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::time::Duration;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "iprule-agent", about = "Converges kernel ip rules with cluster rule records")]
pub struct Args {
    #[clap(long, default_value = "iprule=info,warn", env = "IPRULE_AGENT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Name of the node this agent runs on, used for cleanup
    /// acknowledgments. Without it, kernel reconciliation still runs but the
    /// agent never participates in record retirement.
    #[clap(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Period between synchronization passes, in seconds.
    #[clap(long, default_value = "10", env = "RECONCILE_PERIOD_SECS")]
    reconcile_period_secs: u64,
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
            node_name,
            reconcile_period_secs,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = AgentMetrics::register(prom.sub_registry_with_prefix("iprule_agent"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        if node_name.is_none() {
            warn!("No node identity; cleanup coordination is disabled");
        }

        let sync = Synchronizer::new(
            runtime.client(),
            NetlinkRules::new(handle),
            node_name,
            Duration::from_secs(reconcile_period_secs),
            metrics,
        );
        tokio::spawn(sync.run().instrument(info_span!("sync")));

        // Block the main thread on the shutdown signal; the in-flight pass
        // is allowed to finish and the next one re-establishes correctness.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
