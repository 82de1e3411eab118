#![allow(clippy::result_large_err)]

use anyhow::Context;
use std::path::PathBuf;
use syntised::app::{describe_columns, ReplayApp};
use syntised::config::ReplayConfig;
use syntised::telemetry;

enum CliCommand {
    Run { config_path: Option<PathBuf> },
    Columns { config_path: Option<PathBuf> },
    Help,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match parse_cli_args(std::env::args().skip(1))? {
        CliCommand::Run { config_path } => {
            let config = load_config(config_path)?;
            telemetry::init_tracing(config.logging.format)
                .context("failed to initialise telemetry")?;

            let app = ReplayApp::initialise(config)
                .await
                .context("failed to construct application")?;
            let report = app.run().await.context("replay failed")?;

            println!(
                "{}",
                serde_json::to_string(&report).context("failed to render replay report")?
            );
            Ok(())
        }
        CliCommand::Columns { config_path } => {
            let config = load_config(config_path)?;
            config
                .validate_source()
                .context("invalid configuration")?;
            let columns = describe_columns(&config).context("failed to read CSV header")?;

            println!("{:<6} {:<64} {:<24} TYPE", "INDEX", "IDENTITY", "PROPERTY");
            for column in columns {
                println!(
                    "{:<6} {:<64} {:<24} {}",
                    column.index, column.identity, column.property, column.type_name
                );
            }
            Ok(())
        }
        CliCommand::Help => {
            print_help();
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<ReplayConfig> {
    ReplayConfig::load(path.as_deref()).context("failed to load configuration")
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().peekable();
    let columns = args.peek().is_some_and(|first| first == "columns");
    if columns {
        args.next();
    }

    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                if config_path.is_some() {
                    anyhow::bail!("config path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("expected path after {arg}"))?;
                config_path = Some(PathBuf::from(value));
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    if columns {
        Ok(CliCommand::Columns { config_path })
    } else {
        Ok(CliCommand::Run { config_path })
    }
}

fn print_help() {
    println!(
        "\
Usage: syntised [OPTIONS]
       syntised columns [OPTIONS]

Replays a timestamped CSV file to an MQTT gateway at the recorded time of day.

Commands:
  columns                Print the resolved identity, property and type of every data column

Options:
  -c, --config <PATH>    Configuration file (TOML, YAML or JSON); SYNTISED_* variables override it
  -h, --help             Print this help message
"
    );
}
