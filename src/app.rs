use crate::config::ReplayConfig;
use crate::error::{Context, Result};
use crate::replay::message::PlannedColumn;
use crate::replay::source::read_csv_header;
use crate::replay::{
    ColumnCatalog, ColumnPlan, CsvRowSource, IdentityResolver, ReplayReport, ReplayScheduler,
    SystemClock,
};
use crate::transport::Publisher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Column overrides from the config file, then from the process environment (which wins).
pub fn column_catalog(config: &ReplayConfig) -> ColumnCatalog {
    let from_file = config
        .columns
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()));
    ColumnCatalog::load(from_file.chain(std::env::vars()))
}

/// Resolves every data column of the CSV header without connecting anywhere.
pub fn describe_columns(config: &ReplayConfig) -> Result<Vec<PlannedColumn>> {
    let header = read_csv_header(&config.csv)?;
    let catalog = column_catalog(config);
    let resolver = IdentityResolver::new(config.mqtt.identity_salt(), config.thing_model.clone());
    let plan = ColumnPlan::build(&header, &config.csv, &resolver, &catalog);
    Ok(plan.columns().to_vec())
}

pub struct ReplayApp {
    config: Arc<ReplayConfig>,
    catalog: Arc<ColumnCatalog>,
    source: CsvRowSource,
    publisher: Box<dyn Publisher>,
    shutdown: CancellationToken,
}

impl ReplayApp {
    pub async fn initialise(config: ReplayConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let catalog = column_catalog(&config);
        tracing::info!(
            target: "syntised::app",
            event = "catalog_loaded",
            overrides = catalog.len()
        );

        let source = CsvRowSource::open(&config.csv, config.replay.repeat)?;
        tracing::info!(
            target: "syntised::app",
            event = "source_opened",
            file = %config.csv.file.display(),
            columns = source.headers().len()
        );

        let publisher = connect_publisher(&config)?;

        Ok(Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            source,
            publisher,
            shutdown: CancellationToken::new(),
        })
    }

    pub async fn run(self) -> Result<ReplayReport> {
        let Self {
            config,
            catalog,
            mut source,
            publisher,
            shutdown,
        } = self;

        let signal_shutdown = shutdown.clone();
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(target: "syntised::app", "shutdown signal received");
                signal_shutdown.cancel();
            }
        });

        let clock = SystemClock::new(config.replay.clock);
        let mut scheduler = ReplayScheduler::new(config, catalog, clock);
        let report = scheduler
            .run(&mut source, publisher.as_ref(), &shutdown)
            .await;

        signal_task.abort();
        report
    }
}

#[cfg(feature = "mqtt")]
fn connect_publisher(config: &ReplayConfig) -> Result<Box<dyn Publisher>> {
    let publisher = crate::transport::mqtt::RumqttcPublisher::connect(&config.mqtt)
        .context("failed to create MQTT client")?;
    Ok(Box::new(publisher))
}

#[cfg(not(feature = "mqtt"))]
fn connect_publisher(_: &ReplayConfig) -> Result<Box<dyn Publisher>> {
    Err(crate::err!("mqtt support is disabled in this build"))
}
