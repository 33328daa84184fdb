// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tl - Tidelog log file tooling

mod commands;
mod output;
mod render;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cat, dir, verify};

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "tl", version, about = "Tidelog - inspect and check log files")]
struct Cli {
    /// Output format
    #[arg(long, short = 'o', global = true, value_enum, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every row of a snapshot or WAL file
    Cat(cat::CatArgs),
    /// List the log files in a directory
    Dir(dir::DirArgs),
    /// Check every row; fails on corruption outside the WAL tail
    Verify(verify::VerifyArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Cat(args) => cat::cat(args, cli.output),
        Commands::Dir(args) => dir::dir(args, cli.output),
        Commands::Verify(args) => verify::verify(args, cli.output),
    }
}
