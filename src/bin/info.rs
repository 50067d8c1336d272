//! strata-info
//!
//! Prints the header, index summary and data usage of a layer file.

use std::process;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use stratabd::index::{SegmentIndex, ALIGNMENT};
use stratabd::layer::open_file_ro;

/// Layer file inspector
#[derive(Parser, Debug)]
#[command(name = "strata-info")]
#[command(about = "Inspect stratabd layer files")]
#[command(version)]
struct Args {
    /// Layer file to inspect
    file: String,

    /// Also dump every index record
    #[arg(short = 'd', long)]
    dump_index: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();

    let layer = match open_file_ro(args.file.as_ref()) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("cannot open {}: {}", args.file, e);
            process::exit(1);
        }
    };

    println!("file:          {}", args.file);
    println!("uuid:          {}", layer.uuid());
    println!("parent uuid:   {}", layer.parent_uuid());
    println!("virtual size:  {} bytes", layer.virtual_size());
    println!("index entries: {}", layer.index().size());

    let valid: u64 = layer
        .index()
        .buffer()
        .iter()
        .map(|m| if m.zeroed { 0 } else { m.length as u64 })
        .sum();
    println!("valid data:    {} bytes", valid * ALIGNMENT);

    if args.dump_index {
        for m in layer.index().buffer() {
            println!(
                "  [{:>12}, {:>12})  -> {:>12}  {}",
                m.offset,
                m.end(),
                m.moffset,
                if m.zeroed { "zeroed" } else { "" }
            );
        }
    }
}
