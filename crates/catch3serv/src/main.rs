use std::sync::Arc;

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use tracing::info;

mod catchment;
mod config;
mod contour;
mod db;
mod error;
mod heatmap;
mod network;
mod request;
mod splice;
mod status;
mod subnetwork;

use crate::catchment::CatchmentAreaComputer;
use crate::config::ServerConfig;
use crate::heatmap::HeatmapMatrixDriver;
use crate::network::store::RoutingNetwork;
use crate::request::{CatchmentAreaRequest, TransportMode};
use crate::status::ProcessingStatus;

const SC_CATCHMENT: &str = "catchment";
const SC_HEATMAP: &str = "heatmap";

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let app = Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about("catchment area and travel-time matrix computation")
        .subcommand(
            Command::new(SC_CATCHMENT)
                .about("Compute a single catchment area request")
                .arg(
                    Arg::new("CONFIG-FILE")
                        .help("server configuration file")
                        .required(true),
                )
                .arg(
                    Arg::new("REQUEST-FILE")
                        .help("catchment area request as json")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new(SC_HEATMAP)
                .about("Prepare the heatmap travel-time matrix for one transport mode")
                .arg(
                    Arg::new("CONFIG-FILE")
                        .help("server configuration file")
                        .required(true),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .num_args(1)
                        .default_value("walking")
                        .help("transport mode (walking, bicycle, pedelec, car)"),
                ),
        );

    dispatch_command(app.get_matches())
}

fn dispatch_command(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some((SC_CATCHMENT, sc_matches)) => subcommand_catchment(sc_matches),
        Some((SC_HEATMAP, sc_matches)) => subcommand_heatmap(sc_matches),
        _ => {
            println!("unknown subcommand");
            Ok(())
        }
    }
}

fn read_config(sc_matches: &ArgMatches) -> Result<ServerConfig> {
    let config_contents =
        std::fs::read_to_string(sc_matches.get_one::<String>("CONFIG-FILE").unwrap())?;
    let config: ServerConfig = serde_yaml::from_str(&config_contents)?;
    config.validate()?;
    Ok(config)
}

fn transport_mode_from_str(value: &str) -> Result<TransportMode> {
    Ok(match value {
        "walking" => TransportMode::Walking,
        "bicycle" => TransportMode::Bicycle,
        "pedelec" => TransportMode::Pedelec,
        "car" => TransportMode::Car,
        other => anyhow::bail!("unknown transport mode: {}", other),
    })
}

fn subcommand_catchment(sc_matches: &ArgMatches) -> Result<()> {
    let config = Arc::new(read_config(sc_matches)?);
    let request: CatchmentAreaRequest = serde_json::from_str(&std::fs::read_to_string(
        sc_matches.get_one::<String>("REQUEST-FILE").unwrap(),
    )?)?;
    request.validate()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let mut client = db::connect(&config.postgres).await?;
        let network = Arc::new(
            RoutingNetwork::open(&client, &config.network_region_table, &config.cache_dir)
                .await?,
        );

        let computer = CatchmentAreaComputer::new(config, network);
        let cancel = reachgraph::CancellationFlag::new();
        match computer.run(&mut client, &request, &cancel).await {
            Ok(()) => {
                println!("{}", ProcessingStatus::Success);
                Ok(())
            }
            Err(e) => {
                println!("{}", ProcessingStatus::from_error(&e));
                Err(e.into())
            }
        }
    })
}

fn subcommand_heatmap(sc_matches: &ArgMatches) -> Result<()> {
    let config = Arc::new(read_config(sc_matches)?);
    let mode = transport_mode_from_str(sc_matches.get_one::<String>("mode").unwrap())?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        HeatmapMatrixDriver::new(config, mode).run().await?;
        info!("heatmap matrix preparation finished");
        Ok(())
    })
}
