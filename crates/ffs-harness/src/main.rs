#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffs_block::{ByteDevice, FileByteDevice, MemoryByteDevice};
use ffs_harness::{MiniFs, ReplayConfig, check, crash::formatted_image, run_replay};
use ffs_softdep::SoftdepConfig;
use ffs_types::LogicalBlock;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("format") => format_cmd(&args[1..]),
        Some("fsck") => fsck_cmd(&args[1..]),
        Some("demo") => demo_cmd(&args[1..]),
        Some("crash-replay") => crash_replay(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn format_cmd(args: &[String]) -> Result<()> {
    let path = args.first().context("usage: ffs-harness format <image>")?;
    let geometry = MiniFs::default_geometry()?;
    let device = FileByteDevice::create(path, MiniFs::image_len(&geometry))
        .with_context(|| format!("failed to create {path}"))?;
    MiniFs::format(&device, geometry)?;
    device.sync()?;
    println!("{}", serde_json::to_string_pretty(&geometry)?);
    Ok(())
}

fn fsck_cmd(args: &[String]) -> Result<()> {
    let path = args.first().context("usage: ffs-harness fsck <image>")?;
    let device = FileByteDevice::open(path).with_context(|| format!("failed to open {path}"))?;
    let report = check(&device)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_consistent() {
        bail!("{} consistency violation(s)", report.violations.len());
    }
    Ok(())
}

fn load_config(path: &str) -> Result<SoftdepConfig> {
    let text = fs::read_to_string(Path::new(path)).with_context(|| format!("failed to read {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("invalid engine config {path}"))
}

/// Build a small tree on an in-memory image, crash it before it is flushed,
/// and report what the checker finds after the crash and after recovery.
fn demo_cmd(args: &[String]) -> Result<()> {
    let mut config = SoftdepConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--config" => {
                let raw = args.get(index + 1).context("--config requires a value")?;
                config = load_config(raw)?;
                index += 2;
            }
            other => bail!("unknown demo option: {other}"),
        }
    }

    let image = formatted_image()?;
    let device = Arc::new(MemoryByteDevice::new(image.len()));
    device.write_all_at(0, &image)?;
    let fs = MiniFs::mount(device.clone(), config.clone())?;
    let root = fs.resolve("/")?;
    let docs = fs.mkdir(root, "docs")?;
    let notes = fs.create(docs, "notes.txt")?;
    fs.write_block(notes, LogicalBlock(0), b"written before the crash")?;
    fs.fsync(notes)?;
    let scratch = fs.create(root, "scratch")?;
    fs.write_block(scratch, LogicalBlock(13), b"never synced")?;
    fs.unlink(docs, "notes.txt")?;

    println!("dependencies on the root directory inode block:");
    print!("{}", fs.engine().print(fs.geometry().ino_to_fsba(root)));
    println!("{}", serde_json::to_string_pretty(&fs.stats())?);
    fs.crash();
    drop(fs);

    let after_crash = check(device.as_ref())?;
    println!("after crash: {}", serde_json::to_string_pretty(&after_crash)?);

    let fs = MiniFs::mount(device.clone(), config)?;
    fs.sync()?;
    fs.unmount()?;
    let recovered = check(device.as_ref())?;
    println!("after recovery: {}", serde_json::to_string_pretty(&recovered)?);
    if !after_crash.is_consistent() || !recovered.is_consistent() {
        bail!("demo image failed consistency checks");
    }
    Ok(())
}

fn crash_replay(args: &[String]) -> Result<()> {
    let mut config = ReplayConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let raw = args
            .get(index + 1)
            .with_context(|| format!("{flag} requires a value"))?;
        match flag {
            "--count" => config.workloads = raw.parse().context("invalid --count value")?,
            "--seed" => config.seed = raw.parse().context("invalid --seed value")?,
            "--min-steps" => config.min_steps = raw.parse().context("invalid --min-steps value")?,
            "--max-steps" => config.max_steps = raw.parse().context("invalid --max-steps value")?,
            other => bail!("unknown crash-replay option: {other}"),
        }
        index += 2;
    }

    let report = run_replay(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.failed.is_empty() {
        bail!("workloads {:?} failed", report.failed);
    }
    Ok(())
}

fn print_usage() {
    println!("ffs-harness: soft-updates reference filesystem and crash replay");
    println!();
    println!("USAGE:");
    println!("  ffs-harness format <image>");
    println!("  ffs-harness fsck <image>");
    println!("  ffs-harness demo [--config FILE]");
    println!("  ffs-harness crash-replay [--count N] [--seed S] [--min-steps N] [--max-steps N]");
    println!();
    println!("FSCK:");
    println!("  Checks an image and prints a JSON report. Leaked inodes and fragments");
    println!("  are reported but only dangling names, doubly claimed blocks and low");
    println!("  link counts fail the check.");
    println!();
    println!("DEMO:");
    println!("  Crashes an in-memory filesystem with pending dependencies and checks");
    println!("  it before and after recovery. --config loads engine settings as JSON.");
    println!();
    println!("CRASH REPLAY:");
    println!("  Plans seeded workloads of directory adds, removes, renames, directory");
    println!("  moves, block writes, truncations and syncs. Each one runs to the end,");
    println!("  then the image is rebuilt and checked at a few write prefixes. The JSON");
    println!("  report lists every cut; the same --seed always plans the same workloads.");
    println!();
    println!("EXAMPLES:");
    println!("  ffs-harness format disk.img && ffs-harness fsck disk.img");
    println!("  ffs-harness crash-replay --count 500 --seed 42");
}
