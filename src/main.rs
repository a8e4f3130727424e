//! pipesync: schedule hazard synchronization for a kernel manifest.

use anyhow::{bail, Context};
use pipesync::config::Config;
use pipesync::schedule::ScheduleOptions;
use pipesync::testing::{run_dir, KernelManifest};
use std::env;
use std::path::Path;

const USAGE: &str = "\
usage: pipesync <manifest.toml> [--unroll N] [--event-pool N] [--edges] [--stats]
       pipesync check <dir>
       pipesync --sample-config";

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }
    if args[0] == "--sample-config" {
        print!("{}", Config::sample_config());
        if let Some(path) = Config::user_config_path() {
            eprintln!("# user config path: {}", path.display());
        }
        return Ok(());
    }

    let mut options = ScheduleOptions::from_config(Config::get());

    if args[0] == "check" {
        let Some(dir) = args.get(1) else {
            bail!("check needs a directory\n{}", USAGE);
        };
        return check(Path::new(dir), &options);
    }

    let mut path = None;
    let mut show_edges = false;
    let mut show_stats = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--unroll" => {
                let value = iter.next().context("--unroll needs a value")?;
                options = options.with_unroll(value.parse().context("invalid --unroll")?);
            }
            "--event-pool" => {
                let value = iter.next().context("--event-pool needs a value")?;
                options = options.with_event_pool(value.parse().context("invalid --event-pool")?);
            }
            "--edges" => show_edges = true,
            "--stats" => show_stats = true,
            other if other.starts_with('-') => bail!("unknown option '{}'\n{}", other, USAGE),
            other => path = Some(other),
        }
    }
    let Some(path) = path else {
        bail!("no manifest given\n{}", USAGE);
    };

    let manifest = KernelManifest::from_file(Path::new(path))?;
    let result = manifest.run(options);

    if let Some((name, message)) = &result.error {
        if result.passed() {
            // The manifest expected this failure.
            println!("{}: expected error {}", result.name, name);
            return Ok(());
        }
        bail!("{}", message);
    }

    if let Some(schedule) = &result.schedule {
        print!("{}", schedule.plan);
        if show_edges {
            println!();
            println!("Hazard edges");
            println!("============");
            for edge in &schedule.edges {
                println!("  {}", edge);
            }
        }
        if show_stats {
            println!();
            print!("{}", schedule.stats);
        }
    }

    if !result.passed() {
        for mismatch in &result.mismatches {
            eprintln!("MISMATCH: {}", mismatch);
        }
        bail!("{} expectation(s) not met", result.mismatches.len());
    }
    Ok(())
}

/// Run every manifest in `dir` and report pass/fail.
fn check(dir: &Path, options: &ScheduleOptions) -> anyhow::Result<()> {
    let results = run_dir(dir, options)?;
    let mut failed = 0;
    for (path, result) in &results {
        let name = path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        if result.passed() {
            println!("PASS  {}", name);
        } else {
            failed += 1;
            println!("FAIL  {}", name);
            for mismatch in &result.mismatches {
                println!("      {}", mismatch);
            }
        }
    }
    println!();
    println!("{} passed, {} failed", results.len() - failed, failed);
    if failed > 0 {
        bail!("{} manifest(s) failed", failed);
    }
    Ok(())
}
