use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use dubwise::batch::BatchStats;
use dubwise::channels::{ChannelId, ChannelRegistry};
use dubwise::config::AppConfig;
use dubwise::engines::Engines;
use dubwise::metadata::MetadataRecord;
use dubwise::pipeline::Pipeline;

#[derive(Parser)]
#[command(
    name = "dubwise",
    version,
    about = "Reggae multitrack processor: stems, note events, training metadata"
)]
struct Cli {
    /// Root directory for derived artifacts (default: next to each input)
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process recordings or note-event files through the full pipeline
    Process {
        /// Files to process
        files: Vec<PathBuf>,

        /// Keep separated stems even when conversion validates
        #[arg(long)]
        keep_stems: bool,
    },

    /// Process every supported file under one or more directory trees
    Batch {
        /// Directories to process (defaults to config file music_dirs)
        dirs: Vec<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Show the channel registry: agents, ranges, tones, interactions
    Agents,

    /// Print a channel's training export from a saved metadata record
    Export {
        /// Path to a *.metadata.json file
        metadata: PathBuf,

        /// Channel number to export (omit to list channels in the record)
        #[arg(short, long)]
        channel: Option<u8>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let mut config = AppConfig::load();
    if let Some(out) = cli.out {
        config.output_root = Some(out);
    }

    match cli.command {
        Commands::Process { files, keep_stems } => {
            if files.is_empty() {
                anyhow::bail!("No files to process.");
            }
            if keep_stems {
                config.keep_stems = true;
            }
            let pipeline = build_pipeline(config);

            let mut completed = 0usize;
            let mut failed = 0usize;
            for file in &files {
                let result = pipeline.process(file);
                if result.success {
                    completed += 1;
                    let accuracy = result
                        .conversion_accuracy
                        .map(|a| format!("{a:.3}"))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}: ok (accuracy {}, validation {})",
                        file.display(),
                        accuracy,
                        if result.validation_passed {
                            "passed"
                        } else {
                            "failed"
                        }
                    );
                } else {
                    failed += 1;
                    println!(
                        "{}: failed ({})",
                        file.display(),
                        result.error.unwrap_or_else(|| "unknown error".to_string())
                    );
                }
            }
            println!();
            println!(
                "Process complete: {} processed, {} failed",
                completed, failed
            );
        }

        Commands::Batch { dirs, jobs } => {
            // Resolve directories: CLI args > config music_dirs
            let roots = if !dirs.is_empty() {
                dirs
            } else if !config.music_dirs.is_empty() {
                config.music_dirs.clone()
            } else {
                anyhow::bail!(
                    "No directories to process. Pass paths as arguments or set music_dirs in config."
                );
            };

            let workers = if jobs > 0 {
                jobs
            } else {
                config.resolve_workers()
            };
            let pipeline = build_pipeline(config);

            let mut totals = BatchStats::default();
            for root in &roots {
                let result = dubwise::batch::process_batch(&pipeline, root, workers);
                totals.total += result.stats.total;
                totals.completed += result.stats.completed;
                totals.failed += result.stats.failed;
                totals.validation_passed += result.stats.validation_passed;
                totals.stems_deleted += result.stats.stems_deleted;
            }
            println!(
                "Batch complete: {} files, {} completed, {} failed, {} validated, {} stem sets removed",
                totals.total,
                totals.completed,
                totals.failed,
                totals.validation_passed,
                totals.stems_deleted
            );
        }

        Commands::Agents => {
            let registry = ChannelRegistry::new();
            print_agents(&registry);
        }

        Commands::Export { metadata, channel } => {
            let record = MetadataRecord::load(&metadata)
                .with_context(|| format!("Failed to load {}", metadata.display()))?;

            match channel {
                Some(number) => {
                    let channel = ChannelId(number);
                    let export = record.export_for_training(channel).with_context(|| {
                        format!("No analysis for channel {channel} in this record")
                    })?;
                    println!("{}", serde_json::to_string_pretty(&export)?);
                }
                None => {
                    if record.channel_analyses().is_empty() {
                        println!("Record has no channel analyses.");
                        return Ok(());
                    }
                    println!("Channels in {}:", record.id());
                    for (channel, analysis) in record.channel_analyses() {
                        println!(
                            "  {:>2}  {:<16} {} events",
                            channel, analysis.instrument_name, analysis.event_count
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

fn build_pipeline(config: AppConfig) -> Pipeline {
    log::info!("Engine backends: deterministic mocks");
    Pipeline::new(config, Arc::new(ChannelRegistry::new()), Engines::mock())
}

/// Print the agent table plus the interaction matrix.
fn print_agents(registry: &ChannelRegistry) {
    println!("Channel Registry");
    println!("================");
    println!(
        "{:>2}  {:<16} {:<11} {:>7}  {:>7}  {}",
        "Ch", "Instrument", "Role", "Notes", "Vel", "Tone"
    );
    println!("{}", "-".repeat(72));

    for agent in registry.agents() {
        let tone = agent.tone();
        println!(
            "{:>2}  {:<16} {:<11} {:>3}-{:<3}  {:>3}-{:<3}  {}/{}, {}",
            agent.channel,
            agent.instrument,
            agent.role.label(),
            agent.note_range.0,
            agent.note_range.1,
            agent.velocity_range.0,
            agent.velocity_range.1,
            tone.primary_color,
            tone.secondary_color,
            tone.texture,
        );
    }

    println!();
    println!("Behavioral traits:");
    for agent in registry.agents() {
        let traits: Vec<String> = agent
            .behavioral_traits
            .iter()
            .map(|(name, value)| format!("{name} {value:.2}"))
            .collect();
        println!("  {:<16} {}", agent.instrument, traits.join(", "));
    }

    println!();
    println!("Interactions:");
    for agent in registry.agents() {
        for (partner, kind) in registry.interactions_of(agent.channel) {
            let partner_name = registry
                .get_agent(partner)
                .map(|p| p.instrument)
                .unwrap_or("?");
            println!(
                "  {:<16} {} {} ({:.2})",
                agent.instrument,
                kind,
                partner_name,
                kind.base_strength()
            );
        }
    }
}
