//! `fstitch-fsck`: a small inspection CLI over a raw disk image, shipped
//! as a thin binary alongside the library.
//!
//! There is no on-disk patch graph to recover: every patch lives only in
//! an `Engine` for the lifetime of a process. So this tool's "checkpoint"
//! is simply the raw block image a [`featherstitch::RawDiskBd`] writes to.
//! It reports block geometry and scans for the one thing that actually can
//! go wrong on disk: a file whose length isn't a whole number of blocks.

use std::env;
use std::process;

use featherstitch::{BlockDevice, Engine, RawDiskBd};

fn print_usage() {
    eprintln!("fstitch-fsck <image> <block-size> <command>");
    eprintln!();
    eprintln!("COMMANDS:");
    eprintln!("    info      Show block geometry");
    eprintln!("    verify    Check the image's length is a whole number of blocks");
    eprintln!();
    eprintln!("EXAMPLE:");
    eprintln!("    fstitch-fsck disk.img 4096 info");
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn print_section(title: &str) {
    println!();
    println!("--- {title} ---");
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {name:.<28} {value}");
}

fn cmd_info(path: &str, block_size: usize) -> featherstitch::Result<()> {
    let engine = Engine::shared(true);
    let disk = RawDiskBd::open(path, block_size, engine)?;

    let file_len = std::fs::metadata(path)?.len();

    print_section("Image");
    print_field("Path", path);
    print_field("File size", format_bytes(file_len));
    print_field("Block size", format!("{block_size} bytes"));
    print_field(
        "Block count",
        disk.num_blocks().map(|n| n.to_string()).unwrap_or_else(|| "unknown".into()),
    );
    println!();
    Ok(())
}

fn cmd_verify(path: &str, block_size: usize) -> featherstitch::Result<()> {
    let file_len = std::fs::metadata(path)?.len();
    let remainder = file_len % block_size as u64;

    print_section("Verification");
    print_field("File size", format_bytes(file_len));
    print_field("Block size", format!("{block_size} bytes"));
    print_field("Trailing bytes", remainder);
    println!();

    if remainder == 0 {
        println!("  image length is a whole number of blocks");
    } else {
        println!("  image is truncated: {remainder} trailing byte(s) short of a full block");
        process::exit(1);
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        print_usage();
        process::exit(1);
    }

    let path = &args[1];
    let block_size: usize = match args[2].parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Error: block size must be a positive integer");
            process::exit(1);
        }
    };
    let command = &args[3];

    let result = match command.as_str() {
        "info" => cmd_info(path, block_size),
        "verify" => cmd_verify(path, block_size),
        other => {
            eprintln!("Error: unknown command '{other}'");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
