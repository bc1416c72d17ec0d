use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use dit_parallel_core::distributed::DistributedConfig;

use dit_parallel_cli::config::LaunchConfig;
use dit_parallel_cli::launch;
use dit_parallel_cli::logging;

#[derive(Parser)]
#[command(name = "dit-parallel", about = "Sequence/batch parallel launcher for DiT inference")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the parallel topology a world size resolves to
    Topology {
        /// Number of cooperating workers
        #[arg(long)]
        world_size: usize,

        #[command(flatten)]
        sizes: TopologyArgs,
    },

    /// Run one forward pass of a zero-weight DiT on this worker
    Run {
        /// Launch config file (TOML). Defaults to ~/.config/dit-parallel/config.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Model config file (JSON)
        #[arg(long)]
        model_config: Option<PathBuf>,

        #[command(flatten)]
        sizes: TopologyArgs,

        /// Transformer blocks
        #[arg(long)]
        num_layers: Option<usize>,

        /// Hidden width
        #[arg(long)]
        hidden_size: Option<usize>,

        /// Attention heads
        #[arg(long)]
        num_heads: Option<usize>,

        /// Audio token width
        #[arg(long)]
        audio_dim: Option<usize>,

        /// Latent tokens per sample
        #[arg(long)]
        seq_len: Option<usize>,

        /// Audio tokens per sample
        #[arg(long)]
        audio_len: Option<usize>,

        /// Samples per forward pass
        #[arg(long)]
        batch_size: Option<usize>,

        /// Write the merged launch settings back to the config file
        #[arg(long)]
        save_config: bool,
    },
}

/// Explicit topology sizes; leaving all unset infers them from the world size.
#[derive(Args)]
struct TopologyArgs {
    /// Ulysses sequence split factor
    #[arg(long)]
    ulysses_size: Option<usize>,

    /// Ring-attention sequence split factor
    #[arg(long)]
    ring_size: Option<usize>,

    /// Batch-parallel replicas (1 or 3)
    #[arg(long)]
    batch_parallel_size: Option<usize>,
}

impl TopologyArgs {
    fn into_launch(self) -> LaunchConfig {
        LaunchConfig {
            ulysses_size: self.ulysses_size,
            ring_size: self.ring_size,
            batch_parallel_size: self.batch_parallel_size,
            ..Default::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(&cli.log_level)?;

    match cli.command {
        Command::Topology { world_size, sizes } => {
            let topology = launch::resolve_topology(&sizes.into_launch(), world_size)?;
            println!("{topology}");
            println!("sequence_parallel_width={}", topology.sequence_parallel_width());
        }
        Command::Run {
            config,
            model_config,
            sizes,
            num_layers,
            hidden_size,
            num_heads,
            audio_dim,
            seq_len,
            audio_len,
            batch_size,
            save_config,
        } => {
            let mut launch_config = match &config {
                Some(path) => LaunchConfig::load_from(path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => LaunchConfig::load(),
            };
            // CLI > config file
            launch_config.merge(&LaunchConfig {
                num_layers,
                hidden_size,
                num_heads,
                audio_dim,
                seq_len,
                audio_len,
                batch_size,
                ..sizes.into_launch()
            });

            if save_config {
                let path = match &config {
                    Some(path) => {
                        launch_config.save_to(path)?;
                        path.clone()
                    }
                    None => launch_config.save()?,
                };
                tracing::info!(path = %path.display(), "launch config saved");
            }

            let distributed = DistributedConfig::from_env();
            let report = launch::run(&launch_config, model_config.as_deref(), &distributed)?;
            println!(
                "rank={} topology={} width={} output_shape={:?} restored={}",
                distributed.rank,
                report.topology,
                report.width,
                report.output_shape,
                report.restored
            );
            anyhow::ensure!(report.restored, "pipeline routines were not restored");
        }
    }
    Ok(())
}
