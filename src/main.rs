use std::error::Error;
use std::fs;
use std::process::ExitCode;

use clap::Parser;
use crossfill::{render_grid, FillFailure, Grid, Solver};
use instant::Duration;
use log::{info, LevelFilter};

/// Fill a crossword grid from a word list.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the grid template ('.' for open cells, '#' for blocks)
    structure: String,

    /// Path to the word list, one word per line
    words: String,

    /// Write the filled grid to this file as well as stdout
    #[arg(short, long)]
    output: Option<String>,

    /// Give up after this many seconds
    #[arg(short = 't', long, value_name = "SECONDS")]
    time_limit: Option<u64>,
}

/// Info-level logging with bare messages, overridable via RUST_LOG.
fn init_logger() {
    let mut builder = env_logger::Builder::new();
    builder
        .filter(None, LevelFilter::Info)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn load_word_list(path: &str) -> Result<Vec<String>, std::io::Error> {
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                None
            } else {
                Some(line.to_lowercase())
            }
        })
        .collect())
}

fn try_main() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();

    let template = fs::read_to_string(&cli.structure)?;
    let grid = Grid::from_template_string(&template)?;
    let words = load_word_list(&cli.words)?;
    info!(
        "{} slots, {} candidate words",
        grid.slot_count(),
        words.len()
    );

    let mut solver = Solver::new(&grid, &words);
    if let Some(seconds) = cli.time_limit {
        solver = solver.with_time_limit(Duration::from_secs(seconds));
    }

    match solver.fill() {
        Ok(success) => {
            let stats = &success.statistics;
            info!(
                "filled in {:?} ({} states, {} backtracks)",
                stats.duration, stats.states, stats.backtracks
            );
            let rendered = render_grid(&grid, &success.assignment);
            println!("{rendered}");
            if let Some(path) = cli.output {
                fs::write(path, rendered + "\n")?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(FillFailure::Unsatisfiable) => {
            println!("No solution.");
            Ok(ExitCode::FAILURE)
        }
        Err(FillFailure::TimedOut) => {
            eprintln!("Gave up: time limit reached before the search finished.");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> ExitCode {
    init_logger();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
