//! NPC Population Simulator
//!
//! Headless demo run: a roaming observer sweeps across the map while the
//! population manager promotes and demotes NPCs around it.

use clap::Parser;
use npc_core::config::DEFAULT_CONFIG_PATH;
use npc_core::{Config, NpcWorld};
use npc_events::Vec3;
use std::path::PathBuf;
use std::process::ExitCode;

/// Command line arguments for the simulator
#[derive(Parser, Debug)]
#[command(name = "npc_sim")]
#[command(about = "A proximity-driven NPC population simulator")]
struct Args {
    /// Population config file; falls back to a built-in demo population
    #[arg(long)]
    config: Option<PathBuf>,

    /// Random seed for reproducibility
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Simulated seconds to run
    #[arg(long, default_value_t = 120.0)]
    duration: f32,

    /// Fixed timestep in seconds
    #[arg(long, default_value_t = 0.1)]
    timestep: f32,

    /// Observer sweep speed in units per second
    #[arg(long, default_value_t = 4.0)]
    observer_speed: f32,
}

fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("npc_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => {
            if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() {
                match Config::load(DEFAULT_CONFIG_PATH) {
                    Ok(config) => config,
                    Err(err) => {
                        eprintln!("error: {err}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                Config::demo()
            }
        }
    };

    println!("NPC Population Simulator");
    println!("========================");
    println!("Seed: {}", args.seed);
    println!("Duration: {}s at {}s per step", args.duration, args.timestep);
    println!("NPCs: {}", config.npcs.len());
    println!();

    let mut world = match NpcWorld::from_config(config, args.seed) {
        Ok(world) => world,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    // The observer walks back and forth along the x axis, dragging the
    // activation bubble across the whole population.
    let mut observer = Vec3::new(-60.0, 0.0, 0.0);
    let mut heading = 1.0f32;
    let steps = (args.duration / args.timestep).ceil() as u64;
    let report_every = (5.0 / args.timestep).ceil() as u64;

    for step in 0..steps {
        observer.x += heading * args.observer_speed * args.timestep;
        if observer.x.abs() > 60.0 {
            heading = -heading;
        }

        world.tick(args.timestep, &[observer]);

        if step > 0 && step % report_every == 0 {
            println!(
                "[{}] observer x={:>6.1}  active: {}  total: {}",
                world.clock(),
                observer.x,
                world.active_count(),
                world.records().len()
            );
        }
    }

    let stats = world.stats();
    println!();
    println!("Run complete at {}.", world.clock());
    println!("  activated:   {}", stats.activated);
    println!("  deactivated: {}", stats.deactivated);
    println!("  deferred (non-interruptible): {}", stats.deferred_non_interruptible);
    println!("  resyncs:     {}", stats.resynced);
    ExitCode::SUCCESS
}
