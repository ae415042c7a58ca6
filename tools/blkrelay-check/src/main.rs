//! Bring up a relay device and verify it mirrors its backing store.
//!
//! Two modes:
//!
//! * `--backing <PATH>` opens the given file or block-device node, relays
//!   reads through a freshly created device and compares them with reads
//!   issued directly against the path. No writes are issued.
//! * `--mem <MIB>` runs a write/read self-test against a scratch in-memory
//!   store, including split, out-of-range and zero-length probes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use blkrelay_backing::{completion_channel, MemBacking, SECTOR_SIZE};
use blkrelay_device::{DeviceConfig, DeviceTable, IoRequest, RelayDevice, SubmitLimits};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Sectors moved per relay request.
const CHUNK_SECTORS: u64 = 64;

/// Upper bound on any single completion wait.
const WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(
    name = "blkrelay-check",
    version,
    about = "Bring up a relay device and verify it mirrors its backing store"
)]
struct Args {
    /// Backing file or block-device node to verify; only reads are issued.
    #[arg(long, env = "BLKRELAY_BACKING", value_name = "PATH")]
    backing: Option<PathBuf>,

    /// Self-test against a scratch in-memory store of this many MiB.
    #[arg(long, value_name = "MIB", conflicts_with = "backing")]
    mem: Option<u64>,

    /// Registry name for the relay device.
    #[arg(long, default_value = "relay0")]
    name: String,

    /// Worker threads for the backing store; 0 selects the default.
    #[arg(long, default_value_t = 0)]
    io_workers: usize,

    /// Split transfers above this many sectors; 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    max_io_sectors: u32,

    /// Sectors to sample from the start of a backing path.
    #[arg(long, default_value_t = 2048)]
    verify_sectors: u64,

    /// Log filter, in tracing-subscriber's EnvFilter syntax.
    #[arg(long, env = "BLKRELAY_LOG")]
    log_filter: Option<String>,

    /// Suppress the progress bar.
    #[arg(long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    if let Some(path) = args.backing.clone() {
        verify_backing(&args, path)
    } else if let Some(mib) = args.mem {
        self_test(&args, mib)
    } else {
        bail!("nothing to do: pass --backing <PATH> or --mem <MIB>");
    }
}

fn init_logging(args: &Args) {
    let filter = match &args.log_filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn verify_backing(args: &Args, path: PathBuf) -> anyhow::Result<()> {
    if args.verify_sectors == 0 {
        bail!("--verify-sectors must be at least 1");
    }

    let table = Arc::new(DeviceTable::new());
    let mut config = DeviceConfig::new(args.name.clone(), path.clone());
    config.io_workers = args.io_workers;
    config.limits = SubmitLimits::with_max_sectors(args.max_io_sectors);

    let device = RelayDevice::create(config, table.clone())
        .with_context(|| format!("bringing up a relay over {}", path.display()))?;

    let capacity = device.capacity_sectors();
    let head = args.verify_sectors.min(capacity);
    // A tail chunk catches capacity truncation bugs the head misses.
    let tail = CHUNK_SECTORS.min(capacity - head);
    info!(
        device = %device.name(),
        capacity,
        sample = head + tail,
        "verifying relay reads against the backing path"
    );

    let mut direct =
        File::open(&path).with_context(|| format!("opening {} directly", path.display()))?;
    let pb = progress(args.quiet, head + tail)?;

    let outcome = compare_relay_to_file(&device, &mut direct, capacity, head, tail, &pb);
    device.delete();
    outcome?;

    if !table.is_empty() {
        bail!("device is still registered after delete");
    }
    pb.finish_with_message("match");
    println!(
        "relay matches {}: {} sectors compared",
        path.display(),
        head + tail
    );
    Ok(())
}

fn compare_relay_to_file(
    device: &Arc<RelayDevice>,
    direct: &mut File,
    capacity: u64,
    head: u64,
    tail: u64,
    pb: &ProgressBar,
) -> anyhow::Result<()> {
    let mut sector = 0;
    while sector < head {
        let n = CHUNK_SECTORS.min(head - sector);
        compare_chunk(device, direct, sector, n as u32)?;
        pb.inc(n * SECTOR_SIZE as u64);
        sector += n;
    }
    if tail > 0 {
        compare_chunk(device, direct, capacity - tail, tail as u32)?;
        pb.inc(tail * SECTOR_SIZE as u64);
    }
    Ok(())
}

fn compare_chunk(
    device: &Arc<RelayDevice>,
    direct: &mut File,
    sector: u64,
    sectors: u32,
) -> anyhow::Result<()> {
    let relayed = relay_read(device, sector, sectors)?;

    let mut expected = vec![0u8; sectors as usize * SECTOR_SIZE];
    direct
        .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
        .with_context(|| format!("seeking to sector {sector}"))?;
    direct
        .read_exact(&mut expected)
        .with_context(|| format!("reading {sectors} sectors at sector {sector} directly"))?;

    if relayed != expected {
        let bad = first_mismatch(&relayed, &expected);
        bail!(
            "relay read differs from the backing path at sector {}",
            sector + (bad / SECTOR_SIZE) as u64
        );
    }
    Ok(())
}

fn first_mismatch(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).position(|(x, y)| x != y).unwrap_or(0)
}

fn self_test(args: &Args, mib: u64) -> anyhow::Result<()> {
    if mib == 0 {
        bail!("--mem must be at least 1 MiB");
    }
    let sectors = mib * (1024 * 1024 / SECTOR_SIZE as u64);

    let table = Arc::new(DeviceTable::new());
    let backing = MemBacking::new(sectors);
    let device = RelayDevice::create_with_backing(
        args.name.clone(),
        Box::new(backing.clone()),
        SubmitLimits::with_max_sectors(args.max_io_sectors),
        table.clone(),
    )
    .context("bringing up a relay over the scratch store")?;

    info!(device = %device.name(), sectors, "running the scratch self-test");
    // One write pass plus one read-back pass.
    let pb = progress(args.quiet, 2 * sectors)?;
    let outcome = exercise_device(&device, &backing, sectors, &pb);
    device.delete();
    outcome?;

    if !table.is_empty() {
        bail!("device is still registered after delete");
    }
    if device.in_flight() != 0 {
        bail!("device still reports in-flight requests after delete");
    }
    pb.finish_with_message("self-test passed");
    println!(
        "self-test passed: {sectors} sectors through {}",
        device.name()
    );
    Ok(())
}

fn exercise_device(
    device: &Arc<RelayDevice>,
    backing: &MemBacking,
    sectors: u64,
    pb: &ProgressBar,
) -> anyhow::Result<()> {
    let mut sector = 0;
    while sector < sectors {
        let n = CHUNK_SECTORS.min(sectors - sector);
        relay_write(device, sector, pattern(sector, n))?;
        pb.inc(n * SECTOR_SIZE as u64);
        sector += n;
    }
    relay_flush(device)?;

    let mut sector = 0;
    while sector < sectors {
        let n = CHUNK_SECTORS.min(sectors - sector);
        let relayed = relay_read(device, sector, n as u32)?;
        if relayed != pattern(sector, n) {
            bail!("read-back differs at sector {sector}");
        }
        pb.inc(n * SECTOR_SIZE as u64);
        sector += n;
    }

    // The scratch store must hold exactly what went through the relay.
    if backing.contents() != pattern(0, sectors) {
        bail!("backing store contents differ from what was written");
    }

    // Requests past the end must fail without touching anything.
    let (done, waiter) = completion_channel();
    device.submit(IoRequest::read(sectors, 1, done));
    let result = waiter
        .wait_timeout(WAIT)
        .context("out-of-range probe never completed")?;
    if result.is_ok() {
        bail!("read past the end of the device unexpectedly succeeded");
    }

    // Zero-length requests complete successfully without being forwarded.
    let (done, waiter) = completion_channel();
    device.submit(IoRequest::read(0, 0, done));
    let result = waiter
        .wait_timeout(WAIT)
        .context("zero-length probe never completed")?;
    if !result.is_ok() {
        bail!("zero-length read failed");
    }

    Ok(())
}

fn relay_read(device: &Arc<RelayDevice>, sector: u64, sectors: u32) -> anyhow::Result<Vec<u8>> {
    let (done, waiter) = completion_channel();
    device.submit(IoRequest::read(sector, sectors, done));
    let result = waiter
        .wait_timeout(WAIT)
        .context("relay read never completed")?;
    if !result.is_ok() {
        bail!("relay read of {sectors} sectors at sector {sector} failed");
    }
    result
        .data
        .with_context(|| format!("relay read at sector {sector} completed without data"))
}

fn relay_write(device: &Arc<RelayDevice>, sector: u64, data: Vec<u8>) -> anyhow::Result<()> {
    let sectors = data.len() / SECTOR_SIZE;
    let (done, waiter) = completion_channel();
    device.submit(IoRequest::write(sector, data, done));
    let result = waiter
        .wait_timeout(WAIT)
        .context("relay write never completed")?;
    if !result.is_ok() {
        bail!("relay write of {sectors} sectors at sector {sector} failed");
    }
    Ok(())
}

fn relay_flush(device: &Arc<RelayDevice>) -> anyhow::Result<()> {
    let (done, waiter) = completion_channel();
    device.submit(IoRequest::flush(done));
    let result = waiter
        .wait_timeout(WAIT)
        .context("relay flush never completed")?;
    if !result.is_ok() {
        bail!("relay flush failed");
    }
    Ok(())
}

/// Deterministic per-byte fill so any corruption pinpoints its own offset.
fn pattern(first_sector: u64, sectors: u64) -> Vec<u8> {
    let base = first_sector * SECTOR_SIZE as u64;
    (0..sectors * SECTOR_SIZE as u64)
        .map(|i| (base + i).wrapping_mul(31).wrapping_add(7) as u8)
        .collect()
}

fn progress(quiet: bool, total_sectors: u64) -> anyhow::Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(total_sectors * SECTOR_SIZE as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} {msg} ({eta})",
        )?
        .progress_chars("##-"),
    );
    Ok(pb)
}
