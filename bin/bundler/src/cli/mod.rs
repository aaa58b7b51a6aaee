// This file is part of opbundler.
//
// opbundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// opbundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with opbundler.
// If not, see https://www.gnu.org/licenses/.

use std::{collections::HashSet, sync::Arc, time::Duration};

use alloy_primitives::{Address, U256};
use anyhow::{bail, Context};
use clap::{Args, Parser};
use opbundler_builder::{BuilderEvent, Relay, RelaySettings};
use opbundler_pool::{
    checks::{
        EntityStatus, IncOpsIncluded, IncOpsSeen, OpValueSettings, PaymasterDeposit, SimulateOp,
        ThrottledPerCycle, ValidateOpValues,
    },
    BanThreshold, Client, ClientSettings, DbReputation, MaintenanceSettings, MaintenanceTask,
    MemoryDatabase, Mempool, Pipeline, PoolConfig, PoolEvent, ReputationParams,
};
use opbundler_provider::{
    new_alloy_provider, AlloyEntryPointV0_6, AlloyEvmProvider, AlloyTransport, EvmProvider,
};
use opbundler_sim::{GasOverheads, SimulationSettings, SimulatorImpl};
use opbundler_utils::{
    emit::{self, WithEntryPoint, EVENT_CHANNEL_CAPACITY},
    handle::flatten_handle,
};
use tokio::sync::broadcast;

mod events;
mod tracing;

use self::events::Event;

/// Main entry point for the CLI
///
/// Wires the admission client, one relay per entry point, and the store
/// maintenance task, then runs until ctrl-c or until a task fails.
pub(crate) async fn run() -> anyhow::Result<()> {
    let opt = Cli::parse();
    let _guard = tracing::configure_logging(&opt.logs)?;
    tracing::info!("Parsed CLI options: {:#?}", opt);
    let args = opt.bundler;
    args.validate()?;

    let provider = new_alloy_provider(&args.node_http)?;
    let evm = Arc::new(AlloyEvmProvider::<_, AlloyTransport>::new(provider.clone()));
    let chain_id = evm
        .get_chain_id()
        .await
        .context("should fetch chain id from node")?;
    tracing::info!("Connected to chain {chain_id}");

    let (event_sender, event_rx) =
        broadcast::channel::<WithEntryPoint<Event>>(EVENT_CHANNEL_CAPACITY);
    let (pool_event_sender, pool_event_rx) =
        broadcast::channel::<WithEntryPoint<PoolEvent>>(EVENT_CHANNEL_CAPACITY);
    let (builder_event_sender, builder_event_rx) =
        broadcast::channel::<WithEntryPoint<BuilderEvent>>(EVENT_CHANNEL_CAPACITY);

    emit::receive_and_log_events(event_rx);
    emit::receive_events("op pool", pool_event_rx, {
        let event_sender = event_sender.clone();
        move |event| {
            let _ = event_sender.send(WithEntryPoint::of(event));
        }
    });
    emit::receive_events("builder", builder_event_rx, {
        let event_sender = event_sender.clone();
        move |event| {
            let _ = event_sender.send(WithEntryPoint::of(event));
        }
    });

    let db = Arc::new(MemoryDatabase::new());
    let mempool = Arc::new(
        Mempool::new(Arc::clone(&db), args.pool_config()).context("should load pending ops")?,
    );
    let reputation = Arc::new(
        DbReputation::new(
            Arc::clone(&db),
            args.reputation_params(),
            args.blocklist(),
            args.allowlist(),
        )
        .context("should load reputation")?,
    );

    let overheads = GasOverheads::default();
    let sim_settings = args.simulation_settings()?;
    let mut client = Client::new(
        Arc::clone(&mempool),
        Arc::clone(&reputation),
        Arc::clone(&evm),
        ClientSettings {
            chain_id,
            max_verification_gas: U256::from(args.max_verification_gas),
            overheads,
        },
        pool_event_sender.clone(),
    );

    let mut relays = vec![];
    for &address in &args.entry_points {
        let entry_point = Arc::new(AlloyEntryPointV0_6::<_, AlloyTransport>::new(
            address,
            provider.clone(),
        ));
        let simulator = Arc::new(SimulatorImpl::new(
            Arc::clone(&evm),
            Arc::clone(&entry_point),
            sim_settings.clone(),
        ));

        let inbound = Pipeline::default()
            .with_module(Arc::new(ValidateOpValues::new(
                Arc::clone(&mempool),
                Arc::clone(&entry_point),
                overheads,
                OpValueSettings {
                    max_verification_gas: U256::from(args.max_verification_gas),
                    max_ops_for_unstaked_sender: args.max_ops_for_unstaked_sender,
                },
            )))
            .with_module(Arc::new(EntityStatus::new(Arc::clone(&mempool))))
            .with_module(Arc::new(SimulateOp::new(
                simulator,
                Arc::clone(&reputation),
            )))
            .with_module(Arc::new(IncOpsSeen::new(Arc::clone(&reputation))));
        client = client.with_entry_point(address, inbound);

        let outbound = Pipeline::default()
            .with_module(Arc::new(PaymasterDeposit::new(Arc::clone(&entry_point))))
            .with_module(Arc::new(ThrottledPerCycle));
        let included =
            Pipeline::default().with_module(Arc::new(IncOpsIncluded::new(Arc::clone(&reputation))));

        let relay = Relay::new(
            Arc::clone(&mempool),
            Arc::clone(&reputation),
            Arc::clone(&evm),
            entry_point,
            outbound,
            included,
            args.relay_settings(),
            builder_event_sender.clone(),
            pool_event_sender.clone(),
        );
        if args.debug {
            relay.set_ban_threshold(BanThreshold::Disabled);
        }
        relays.push(Arc::new(relay));
    }

    tracing::info!(
        "Accepting operations on chain {} for entry points {:?}",
        client.chain_id(),
        client.supported_entry_points()
    );

    let mut handles = vec![tokio::spawn(
        MaintenanceTask::new(
            db,
            MaintenanceSettings {
                interval: Duration::from_secs(args.maintenance_interval_secs),
                ..Default::default()
            },
        )
        .run(),
    )];
    handles.extend(relays.into_iter().map(|relay| tokio::spawn(relay.run())));
    let tasks = futures::future::try_join_all(handles.into_iter().map(flatten_handle));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received ctrl-c, shutting down");
        },
        res = tasks => {
            res.context("bundler task failed")?;
        },
    }

    tracing::info!("Shutdown, goodbye");
    Ok(())
}

/// CLI options
#[derive(Debug, Parser)]
#[command(author, version, about = "ERC-4337 operation bundler", long_about = None)]
struct Cli {
    #[command(flatten)]
    bundler: BundlerArgs,

    #[clap(flatten)]
    logs: LogsArgs,
}

/// Bundler options
#[derive(Debug, Args)]
#[command(next_help_heading = "Bundler")]
struct BundlerArgs {
    /// ETH Node HTTP URL to connect to
    #[arg(long = "node_http", name = "node_http", env = "NODE_HTTP")]
    node_http: String,

    /// Supported entry points
    #[arg(
        long = "entry_points",
        name = "entry_points",
        env = "ENTRY_POINTS",
        value_delimiter = ',',
        default_value = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
    )]
    entry_points: Vec<Address>,

    /// Receives bundle fees, and sends bundle transactions from the node's account
    #[arg(long = "beneficiary", name = "beneficiary", env = "BENEFICIARY")]
    beneficiary: Address,

    #[arg(
        long = "max_verification_gas",
        name = "max_verification_gas",
        env = "MAX_VERIFICATION_GAS",
        default_value = "5000000"
    )]
    max_verification_gas: u64,

    #[arg(
        long = "max_ops_for_unstaked_sender",
        name = "max_ops_for_unstaked_sender",
        env = "MAX_OPS_FOR_UNSTAKED_SENDER",
        default_value = "4"
    )]
    max_ops_for_unstaked_sender: usize,

    #[arg(
        long = "min_replacement_fee_increase_percentage",
        name = "min_replacement_fee_increase_percentage",
        env = "MIN_REPLACEMENT_FEE_INCREASE_PERCENTAGE",
        default_value = "10"
    )]
    min_replacement_fee_increase_percentage: u32,

    #[arg(
        long = "throttling_threshold",
        name = "throttling_threshold",
        env = "THROTTLING_THRESHOLD",
        default_value = "10"
    )]
    throttling_threshold: u64,

    #[arg(
        long = "ban_threshold",
        name = "ban_threshold",
        env = "BAN_THRESHOLD",
        default_value = "50"
    )]
    ban_threshold: u64,

    /// Debug mode: entities are never banned
    #[arg(long = "debug", name = "debug", env = "DEBUG")]
    debug: bool,

    #[arg(
        long = "bundle_interval_millis",
        name = "bundle_interval_millis",
        env = "BUNDLE_INTERVAL_MILLIS",
        default_value = "1000"
    )]
    bundle_interval_millis: u64,

    #[arg(
        long = "max_bundle_size",
        name = "max_bundle_size",
        env = "MAX_BUNDLE_SIZE",
        default_value = "10"
    )]
    max_bundle_size: usize,

    /// Upper bound on a validation simulation, RPC round trip included
    #[arg(
        long = "sim_timeout_millis",
        name = "sim_timeout_millis",
        env = "SIM_TIMEOUT_MILLIS",
        default_value = "10000"
    )]
    sim_timeout_millis: u64,

    /// Javascript collector tracer, the built-in one if unset
    #[arg(long = "tracer_file", name = "tracer_file", env = "TRACER_FILE")]
    tracer_file: Option<String>,

    #[arg(
        long = "maintenance_interval_secs",
        name = "maintenance_interval_secs",
        env = "MAINTENANCE_INTERVAL_SECS",
        default_value = "300"
    )]
    maintenance_interval_secs: u64,

    /// Entities that are always banned
    #[arg(
        long = "blocklist",
        name = "blocklist",
        env = "BLOCKLIST",
        value_delimiter = ','
    )]
    blocklist: Vec<Address>,

    /// Entities that are never throttled or banned
    #[arg(
        long = "allowlist",
        name = "allowlist",
        env = "ALLOWLIST",
        value_delimiter = ','
    )]
    allowlist: Vec<Address>,
}

impl BundlerArgs {
    fn validate(&self) -> anyhow::Result<()> {
        if self.entry_points.is_empty() {
            bail!("at least one entry point is required");
        }
        if self.max_bundle_size == 0 {
            bail!("max_bundle_size must be positive");
        }
        if self.bundle_interval_millis == 0 || self.maintenance_interval_secs == 0 {
            bail!("bundle and maintenance intervals must be positive");
        }
        Ok(())
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_replacement_fee_increase_percentage: self.min_replacement_fee_increase_percentage,
            ..Default::default()
        }
    }

    fn reputation_params(&self) -> ReputationParams {
        ReputationParams {
            throttling_threshold: self.throttling_threshold,
            ban_threshold: if self.debug {
                BanThreshold::Disabled
            } else {
                BanThreshold::Value(self.ban_threshold)
            },
        }
    }

    fn blocklist(&self) -> Option<HashSet<Address>> {
        to_set(&self.blocklist)
    }

    fn allowlist(&self) -> Option<HashSet<Address>> {
        to_set(&self.allowlist)
    }

    fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            beneficiary: self.beneficiary,
            max_bundle_size: self.max_bundle_size,
            bundle_interval: Duration::from_millis(self.bundle_interval_millis),
        }
    }

    fn simulation_settings(&self) -> anyhow::Result<SimulationSettings> {
        let mut settings = SimulationSettings {
            sim_timeout: Duration::from_millis(self.sim_timeout_millis),
            ..Default::default()
        };
        if let Some(path) = &self.tracer_file {
            settings.tracer = std::fs::read_to_string(path)
                .with_context(|| format!("should read tracer file {path}"))?;
        }
        Ok(settings)
    }
}

fn to_set(addresses: &[Address]) -> Option<HashSet<Address>> {
    (!addresses.is_empty()).then(|| addresses.iter().copied().collect())
}

/// CLI options for logging
#[derive(Debug, Args)]
#[command(next_help_heading = "Logging")]
struct LogsArgs {
    /// Log file
    ///
    /// If not provided, logs will be written to stdout
    #[arg(long = "log.file", name = "log.file", env = "LOG_FILE", global = true)]
    file: Option<String>,

    /// Log JSON
    ///
    /// If set, logs will be written in JSON format
    #[arg(
        long = "log.json",
        name = "log.json",
        env = "LOG_JSON",
        required = false,
        num_args = 0,
        global = true
    )]
    json: bool,
}
