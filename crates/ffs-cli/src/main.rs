#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffs::{
    CheckReport, Cred, Ffs, FfsError, FileByteDevice, FormatOptions, FsStats, IFREG, MountOptions,
    Superblock,
};
use serde::Serialize;
use std::env;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct InspectOutput<'a> {
    stats: FsStats,
    superblock: &'a Superblock,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        let code = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<FfsError>())
            .map_or(1, FfsError::to_errno);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let (Some(path), Some(size)) = (args.next(), args.next()) else {
                bail!("mkfs requires <image-path> <size-bytes>");
            };
            let size: u64 = size
                .parse()
                .with_context(|| format!("invalid size: {size}"))?;
            let remaining: Vec<String> = args.collect();
            let opts = match flag_value(&remaining, "--options") {
                Some(file) => {
                    let text = std::fs::read_to_string(file)
                        .with_context(|| format!("failed to read {file}"))?;
                    serde_json::from_str(&text).with_context(|| format!("invalid options in {file}"))?
                }
                None => FormatOptions::default(),
            };
            mkfs(Path::new(&path), size, &opts)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "check" => {
            let Some(path) = args.next() else {
                bail!("check requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            check_cmd(Path::new(&path), json)
        }
        "fill" => {
            let (Some(path), Some(bytes)) = (args.next(), args.next()) else {
                bail!("fill requires <image-path> <bytes>");
            };
            let bytes: u64 = bytes
                .parse()
                .with_context(|| format!("invalid byte count: {bytes}"))?;
            let remaining: Vec<String> = args.collect();
            let files = match flag_value(&remaining, "--files") {
                Some(n) => n.parse().with_context(|| format!("invalid --files: {n}"))?,
                None => 1_u32,
            };
            fill(Path::new(&path), bytes, files.max(1))
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn print_usage() {
    println!("ffs\n");
    println!("USAGE:");
    println!("  ffs mkfs <image-path> <size-bytes> [--options <options.json>]");
    println!("  ffs inspect <image-path> [--json]");
    println!("  ffs check <image-path> [--json]");
    println!("  ffs fill <image-path> <bytes> [--files <n>]");
}

fn mkfs(path: &Path, size: u64, opts: &FormatOptions) -> Result<()> {
    let dev = FileByteDevice::create(path, size)
        .with_context(|| format!("failed to create image: {}", path.display()))?;
    let fs = Ffs::format(Box::new(dev), opts, MountOptions::default())
        .with_context(|| format!("failed to format {}", path.display()))?;
    let stats = fs.stats();
    fs.unmount().context("unmount after format")?;
    println!(
        "{}: {} groups, {} byte blocks, {} byte fragments, {} bytes free",
        path.display(),
        stats.ncg,
        stats.bsize,
        stats.fsize,
        stats.free_bytes
    );
    Ok(())
}

fn open_read_only(path: &Path) -> Result<Ffs> {
    let opts = MountOptions {
        read_only: true,
        ..MountOptions::default()
    };
    Ffs::open(path, opts).with_context(|| format!("failed to open filesystem image: {}", path.display()))
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let fs = open_read_only(path)?;
    let output = InspectOutput {
        stats: fs.stats(),
        superblock: fs.superblock(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }
    let sb = output.superblock;
    let stats = &output.stats;
    println!("FFS Inspector");
    println!("groups: {}", stats.ncg);
    println!("block_size: {}", stats.bsize);
    println!("fragment_size: {}", stats.fsize);
    println!("fragments: {}", stats.size);
    println!("data_fragments: {}", stats.dsize);
    println!("frags_per_group: {}", sb.fpg);
    println!("inodes_per_group: {}", sb.ipg);
    println!("free_blocks: {}", stats.cstotal.nbfree);
    println!("free_fragments: {}", stats.cstotal.nffree);
    println!("free_inodes: {}", stats.cstotal.nifree);
    println!("directories: {}", stats.cstotal.ndir);
    println!("free_bytes: {}", stats.free_bytes);
    println!("optimization: {:?}", stats.optim);
    println!("clean: {}", sb.clean);
    println!("needs_check: {}", stats.needs_check);
    Ok(())
}

fn print_report(report: &CheckReport) {
    println!("groups: {}", report.groups);
    println!("inodes_in_use: {}", report.inodes_in_use);
    for line in &report.summary_mismatches {
        println!("summary: {line}");
    }
    for line in &report.inode_problems {
        println!("inode: {line}");
    }
    if !report.claimed_but_free.is_empty() {
        println!("claimed_but_free: {} fragments", report.claimed_but_free.len());
    }
    if !report.duplicates.is_empty() {
        println!("duplicates: {} fragments", report.duplicates.len());
    }
    if report.leaked_frags > 0 {
        println!("leaked: {} fragments", report.leaked_frags);
    }
}

fn check_cmd(path: &Path, json: bool) -> Result<()> {
    let fs = open_read_only(path)?;
    let report = fs.check().context("check failed")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        print_report(&report);
    }
    if !report.is_clean() {
        bail!("{} is inconsistent", path.display());
    }
    Ok(())
}

fn fill(path: &Path, bytes: u64, files: u32) -> Result<()> {
    let fs = Ffs::open(path, MountOptions::default())
        .with_context(|| format!("failed to open filesystem image: {}", path.display()))?;
    let root = fs.root().context("read root inode")?;
    let per_file = bytes / u64::from(files);
    let chunk = vec![0xA5_u8; fs.superblock().bsize as usize];
    for n in 0..files {
        let mut ip = fs
            .create(&root, IFREG | 0o644, Cred::ROOT)
            .with_context(|| format!("create file {n}"))?;
        let mut off = 0_u64;
        while off < per_file {
            let len = chunk.len().min(usize::try_from(per_file - off).unwrap_or(chunk.len()));
            let written = fs
                .write(&mut ip, off, &chunk[..len], Cred::ROOT)
                .with_context(|| format!("write at offset {off}"))?;
            off += written as u64;
        }
        info!(target: "ffs::cli", event = "filled", ino = ip.number.0, bytes = off);
    }
    let stats = fs.stats();
    fs.unmount().context("unmount")?;
    println!(
        "wrote {} files of {per_file} bytes, {} bytes free",
        files, stats.free_bytes
    );
    Ok(())
}
