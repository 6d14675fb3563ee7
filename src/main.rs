//! NVGPU operation simulator CLI
//!
//! Main entry point for the `nvgpu` command.

use clap::{Parser, Subcommand};
use miette::Result;
use nvgpu::{SimConfig, SourceFile};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "nvgpu")]
#[command(author = "Demetrios Chiuratto Agourakis, Dionisio Chiuratto Agourakis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Verify and simulate NVGPU async copy, mbarrier, TMA and MMA programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and verify a program without running it
    Check {
        /// Input file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Print the parsed program
        #[arg(long, value_enum)]
        emit: Option<EmitType>,
    },

    /// Run a program on a simulated thread block
    Run {
        /// Input file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Threads in the block (overrides the configuration file)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Device configuration (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Dump counters and final buffer contents as JSON
        #[arg(long)]
        dump: bool,
    },

    /// Show information about the simulator
    Info,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitType {
    /// Textual form, as re-printed by the printer
    Ir,
    /// Program structure (JSON)
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("nvgpu=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Check { input, emit } => check(&input, emit),
        Commands::Run {
            input,
            threads,
            config,
            dump,
        } => run(&input, threads, config.as_deref(), dump),
        Commands::Info => info(),
    }
}

fn read_source(input: &Path) -> Result<SourceFile> {
    let content = std::fs::read_to_string(input)
        .map_err(|e| miette::miette!("Failed to read input file: {}", e))?;
    Ok(SourceFile::new(input.to_string_lossy().to_string(), content))
}

fn check(input: &Path, emit: Option<EmitType>) -> Result<()> {
    tracing::info!("Checking {:?}", input);

    let file = read_source(input)?;
    let program = nvgpu::parse_file(&file)?;
    tracing::debug!("Parsed {} operations", program.len());

    nvgpu::verify(&program, &file)?;

    match emit {
        Some(EmitType::Ir) => print!("{}", program),
        Some(EmitType::Json) => {
            let json = serde_json::to_string_pretty(&program)
                .map_err(|e| miette::miette!("Failed to serialize program: {}", e))?;
            println!("{}", json);
        }
        None => println!("All checks passed: {}", input.display()),
    }
    Ok(())
}

fn run(input: &Path, threads: Option<usize>, config: Option<&Path>, dump: bool) -> Result<()> {
    let mut config = match config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    if let Some(threads) = threads {
        config.threads = threads;
    }
    tracing::info!("Running {:?} on {} thread(s)", input, config.threads);

    let file = read_source(input)?;
    let execution = nvgpu::run_file(&file, config)?;

    for line in &execution.output {
        println!("{}", line);
    }

    if dump {
        let report = serde_json::json!({
            "stats": execution.stats,
            "buffers": execution.buffers,
        });
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| miette::miette!("Failed to serialize run report: {}", e))?;
        eprintln!("{}", json);
    }
    Ok(())
}

fn info() -> Result<()> {
    let config = SimConfig::default();
    println!("NVGPU operation simulator");
    println!("Version: {}", nvgpu::VERSION);
    println!();
    println!("Operations:");
    println!("  - device_async_copy / create_group / wait");
    println!("  - mbarrier create / init / arrive / expect_tx / test.wait / try_wait.parity / inval");
    println!("  - tma create / fence / prefetch descriptor, async load (multicast), async store");
    println!("  - warpgroup generate.descriptor / mma.init.accumulator / mma / mma.store");
    println!("  - mma.sync, mma.sp.sync (verify only), rcp");
    println!();
    println!("Default device:");
    println!("  threads:              {}", config.threads);
    println!("  warp size:            {}", config.warp_size);
    println!("  cluster size:         {}", config.cluster_size);
    println!("  shared memory bytes:  {}", config.shared_memory_bytes);
    println!("  watchdog rounds:      {}", config.wait_watchdog_rounds);

    Ok(())
}
