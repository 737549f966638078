use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hdrhistogram::Histogram;
use log::info;

use ferry::core::{ChannelConfig, NamedSemaphore};
use ferry::ipc::DuplexChannel;
use ferry::protocol::{ArrayPayload, ScalarMap};
use ferry::sim::{Controller, LineWalk, Worker};

#[derive(Parser)]
#[command(name = "ferry-cli", version, about = "Shared-memory simulation transport tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct ChannelArgs {
    /// JSON channel configuration; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Directory for the backing region files
    #[arg(long)]
    region_dir: Option<PathBuf>,

    /// Payload bytes per region
    #[arg(long)]
    capacity: Option<usize>,
}

impl ChannelArgs {
    fn load(&self) -> Result<ChannelConfig> {
        let mut config = match &self.config {
            Some(path) => ChannelConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ChannelConfig::default(),
        };
        if let Some(id) = &self.id {
            config.id = id.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = &self.region_dir {
            config.region_dir = dir.clone();
        }
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the channel and serve the LineWalk demo simulation
    Worker {
        #[command(flatten)]
        channel: ChannelArgs,

        /// Remove leftovers of a crashed run before creating
        #[arg(long)]
        unlink_stale: bool,

        /// CPU core to pin the process to
        #[arg(long)]
        core_id: Option<usize>,
    },
    /// Connect to a worker, reset once and step it
    Controller {
        #[command(flatten)]
        channel: ChannelArgs,

        #[arg(long)]
        seed: Option<i64>,

        /// Reset options as a JSON object, e.g. '{"max_steps": 500}'
        #[arg(long)]
        options: Option<String>,

        #[arg(long, default_value_t = 1_000)]
        steps: u64,

        /// Bound on each reply wait
        #[arg(long)]
        recv_timeout_ms: Option<u64>,

        #[arg(long)]
        core_id: Option<usize>,
    },
    /// Remove every named object of a channel
    Cleanup {
        #[command(flatten)]
        channel: ChannelArgs,
    },
    /// Print the derived names of a channel and whether each exists
    Inspect {
        #[command(flatten)]
        channel: ChannelArgs,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Worker {
            channel,
            unlink_stale,
            core_id,
        } => {
            pin_to_core(core_id)?;
            let config = channel.load()?.with_unlink_stale(unlink_stale);
            cmd_worker(config, &mut out)?;
        }
        Commands::Controller {
            channel,
            seed,
            options,
            steps,
            recv_timeout_ms,
            core_id,
        } => {
            pin_to_core(core_id)?;
            let config = channel
                .load()?
                .with_recv_timeout(recv_timeout_ms.map(Duration::from_millis));
            let options = parse_options(options.as_deref())?;
            cmd_controller(&config, seed, options, steps, &mut out)?;
        }
        Commands::Cleanup { channel } => cmd_cleanup(&channel.load()?, &mut out)?,
        Commands::Inspect { channel } => cmd_inspect(&channel.load()?, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn pin_to_core(core_id: Option<usize>) -> Result<()> {
    let Some(core_id) = core_id else {
        return Ok(());
    };
    let core_ids = core_affinity::get_core_ids().context("Failed to get core IDs")?;
    if core_id >= core_ids.len() {
        bail!("Core ID {} out of range ({} cores available)", core_id, core_ids.len());
    }
    info!("Pinning process to core {}", core_id);
    core_affinity::set_for_current(core_ids[core_id]);
    Ok(())
}

fn parse_options(raw: Option<&str>) -> Result<ScalarMap> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--options must be a JSON object"),
        None => Ok(ScalarMap::new()),
    }
}

fn cmd_worker(config: ChannelConfig, out: &mut dyn Write) -> Result<()> {
    info!(
        "Serving LineWalk on {}.{} (regions in {})",
        config.id,
        config.port,
        config.region_dir.display()
    );
    let worker = Worker::new(|| Ok(LineWalk::new()), config).context("Failed to create worker")?;
    let summary = worker.run()?;
    writeln!(out, "resets={} steps={}", summary.resets, summary.steps)?;
    Ok(())
}

fn cmd_controller(
    config: &ChannelConfig,
    seed: Option<i64>,
    options: ScalarMap,
    steps: u64,
    out: &mut dyn Write,
) -> Result<()> {
    let mut controller = Controller::connect(config)
        .with_context(|| format!("Failed to connect to {}.{}", config.id, config.port))?;
    let clock = quanta::Clock::new();
    let mut latency = Histogram::<u64>::new(3)?;

    let (observation, _) = controller.reset(seed, options.clone())?;
    writeln!(out, "reset observation={:?}", observation.to_f64_vec()?)?;

    let mut episodes = 1u64;
    let mut total_reward = 0.0;
    for i in 0..steps {
        let action = ArrayPayload::discrete((i % 2) as i64);
        let start = clock.now();
        let step = controller.step(action)?;
        latency.record(clock.now().duration_since(start).as_nanos() as u64)?;
        total_reward += step.reward;
        if step.terminated || step.truncated {
            controller.reset(None, options.clone())?;
            episodes += 1;
        }
    }
    let stats = controller.stats();
    controller.close()?;

    writeln!(out, "steps={steps} episodes={episodes} total_reward={total_reward:.3}")?;
    if let Some(stats) = stats {
        writeln!(out, "sent={} received={}", stats.sent, stats.received)?;
    }
    if !latency.is_empty() {
        writeln!(
            out,
            "step_rtt_ns p50={} p99={} p99.9={} max={}",
            latency.value_at_quantile(0.50),
            latency.value_at_quantile(0.99),
            latency.value_at_quantile(0.999),
            latency.max()
        )?;
    }
    Ok(())
}

fn cmd_cleanup(config: &ChannelConfig, out: &mut dyn Write) -> Result<()> {
    let removed = DuplexChannel::unlink_all(config)?;
    writeln!(out, "removed {removed} objects for {}.{}", config.id, config.port)?;
    Ok(())
}

fn cmd_inspect(config: &ChannelConfig, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "channel={}.{}", config.id, config.port)?;
    for name in config.semaphore_names() {
        let state = if NamedSemaphore::exists(&name)? { "present" } else { "absent" };
        writeln!(out, "semaphore {name} {state}")?;
    }
    for path in config.region_paths() {
        let state = if path.exists() { "present" } else { "absent" };
        writeln!(out, "region {} {state}", path.display())?;
    }
    Ok(())
}
