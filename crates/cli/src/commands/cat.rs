// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `tl cat`: print every row of a log file

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use tl_storage::ReadEnd;

use crate::output::{self, OutputFormat};
use crate::render::RowView;

#[derive(Args)]
pub struct CatArgs {
    /// Snapshot or WAL file
    pub file: PathBuf,
    /// Only rows of this shard
    #[arg(long)]
    pub shard: Option<u16>,
}

pub fn cat(args: CatArgs, format: OutputFormat) -> Result<()> {
    let reader = super::open(&args.file)?;
    let mut rows = reader.rows()?;
    let mut views = Vec::new();
    for row in rows.by_ref() {
        let Ok(row) = row else {
            break;
        };
        if args.shard.is_some_and(|id| id != row.shard_id) {
            continue;
        }
        let view = RowView::new(&row);
        match format {
            OutputFormat::Text => println!("{}", view),
            OutputFormat::Json => views.push(view),
        }
    }
    if let OutputFormat::Json = format {
        output::print_list(&views, format);
    }
    if let ReadEnd::Broken { offset, error } = rows.end() {
        eprintln!("{}: stopped at offset {}: {}", args.file.display(), offset, error);
    }
    Ok(())
}
