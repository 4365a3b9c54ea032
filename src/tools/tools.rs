mod dump_cfg;
use dump_cfg::dump_cfg;
mod dump_target;
use dump_target::dump_target;
mod export_target;
use export_target::export_target;
mod list_targets;
use list_targets::list_targets;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use anyhow::Result;

/// Inspect and convert compilation target specifications
#[derive(Clone, Debug, Parser)]
struct Args {
    // operation to execute
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// List the built-in target triples
    ListTargets,
    /// Load a target and print it
    DumpTarget(DumpTargetArgs),
    /// Write a target out as a specification file
    ExportTarget(ExportTargetArgs),
    /// Print the cfg flags and values a target publishes
    DumpCfg(DumpCfgArgs),
}

#[derive(Clone, Debug, Parser)]
struct DumpTargetArgs {
    /// built-in triple name, or a path to a specification file
    target: String,
    /// print as JSON instead of the debug form
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Debug, Parser)]
struct ExportTargetArgs {
    /// built-in triple name, or a path to a specification file
    target: String,
    /// output filename
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Clone, Debug, Parser)]
struct DumpCfgArgs {
    /// built-in triple name, or a path to a specification file
    target: String,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.operation {
        Operation::ListTargets => list_targets(),
        Operation::DumpTarget(args) => dump_target(&args.target, args.json),
        Operation::ExportTarget(args) => {
            export_target(&args.target, &args.output)
        }
        Operation::DumpCfg(args) => dump_cfg(&args.target),
    }
}
