use clap::Parser;
use lowerforge::parallel::lower_blocks;
use lowerforge::parser::parse_blocks;
use lowerforge::{LoweredBlock, TargetDescriptor};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(author, version, about = "Lower virtual instruction listings to two-operand target form", long_about = None)]
struct Args {
    /// Listing of basic blocks separated by `---` lines
    input: PathBuf,

    /// Target descriptor (JSON); defaults to amd64
    #[arg(short, long)]
    target: Option<PathBuf>,

    /// Number of worker threads
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Dump lowered blocks as JSON instead of assembly text
    #[arg(long)]
    json: bool,

    /// Print lowering counters in Prometheus text format at exit
    #[arg(long)]
    metrics: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let prometheus = if args.metrics {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to install metrics recorder: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let target = match &args.target {
        Some(path) => match TargetDescriptor::load(path) {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to load target {:?}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        None => TargetDescriptor::default(),
    };

    let source = match fs::read_to_string(&args.input) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to read {:?}: {}", args.input, e);
            return ExitCode::FAILURE;
        }
    };

    let blocks = match parse_blocks(&source) {
        Ok(b) => b,
        Err(e) => {
            error!("{:?}: {}", args.input, e);
            return ExitCode::FAILURE;
        }
    };
    info!("Lowering {} blocks for target {}", blocks.len(), target.name);

    let results = match lower_blocks(&target, &blocks, args.workers) {
        Ok(r) => r,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut failed = 0;
    let mut lowered: Vec<Option<LoweredBlock>> = Vec::with_capacity(results.len());
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(block) => lowered.push(Some(block)),
            Err(e) => {
                failed += 1;
                if e.is_engine_fault() {
                    error!("block {}: {} (lowering engine fault)", i, e);
                } else {
                    error!("block {}: {}", i, e);
                }
                lowered.push(None);
            }
        }
    }

    if args.json {
        match serde_json::to_string_pretty(&lowered) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                error!("Failed to serialize output: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        for (i, block) in lowered.iter().enumerate() {
            if i > 0 {
                println!("---");
            }
            match block {
                Some(block) => {
                    for l in block.iter() {
                        let mark = if l.flag_preserving { "  ; flags kept" } else { "" };
                        println!("{}{}", l.instruction, mark);
                    }
                }
                None => println!("# block {} failed", i),
            }
        }
    }

    if let Some(handle) = prometheus {
        print!("{}", handle.render());
    }

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
