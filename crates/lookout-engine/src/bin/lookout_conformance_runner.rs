//! Conformance runner: executes the invariant catalog and the needle suite
//! per domain and writes machine-readable artifacts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use lookout_engine::conformance_catalog::ReferenceStackProvider;
use lookout_engine::needle_harness::{report_digest, run_needles, NeedleRunReport};
use serde::Serialize;

#[derive(Debug, Clone)]
struct CliArgs {
    domains: Vec<String>,
    seed: u64,
    output_root: PathBuf,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("artifacts/conformance")
}

fn parse_args() -> Result<CliArgs, String> {
    let mut domains = vec!["perimeter".to_string(), "overworld".to_string()];
    let mut seed = 7u64;
    let mut output_root = default_output_root();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--domain" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--domain requires a value".to_string())?;
                domains = match value.as_str() {
                    "all" => vec!["perimeter".to_string(), "overworld".to_string()],
                    "perimeter" | "overworld" => vec![value],
                    other => return Err(format!("unknown domain: {other}")),
                };
            }
            "--seed" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--seed requires a value".to_string())?;
                seed = value
                    .parse()
                    .map_err(|_| format!("invalid seed: {value}"))?;
            }
            "--output-root" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output-root requires a value".to_string())?;
                output_root = PathBuf::from(value);
            }
            "--help" | "-h" => {
                return Err(
                    "usage: lookout_conformance_runner [--domain <perimeter|overworld|all>] [--seed <u64>] [--output-root <path>]"
                        .to_string(),
                );
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    Ok(CliArgs {
        domains,
        seed,
        output_root,
    })
}

#[derive(Debug, Serialize)]
struct RunManifest {
    domain: String,
    seed: u64,
    report_path: String,
    report_digest: String,
    total_needles: usize,
    passed: usize,
    failed: usize,
    baseline_clean: bool,
}

fn provider_for(domain: &str) -> ReferenceStackProvider {
    match domain {
        "overworld" => ReferenceStackProvider::overworld(),
        _ => ReferenceStackProvider::perimeter(),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_artifacts(root: &Path, report: &NeedleRunReport) -> io::Result<()> {
    let run_root = root.join(&report.domain);
    let report_path = run_root.join("needle_report.json");
    let report_bytes = serde_json::to_vec_pretty(report)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_atomic(&report_path, &report_bytes)?;

    let manifest = RunManifest {
        domain: report.domain.clone(),
        seed: report.seed,
        report_path: "needle_report.json".to_string(),
        report_digest: report_digest(report),
        total_needles: report.summary.total_needles,
        passed: report.summary.passed,
        failed: report.summary.failed,
        baseline_clean: report.summary.baseline_clean,
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_atomic(&run_root.join("run_manifest.json"), &manifest_bytes)?;
    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let mut gate_failed = false;
    for domain in &args.domains {
        let provider = provider_for(domain);
        let report = run_needles(&provider, args.seed);

        if let Err(err) = write_artifacts(&args.output_root, &report) {
            eprintln!("failed to write artifacts for `{domain}`: {err}");
            return ExitCode::FAILURE;
        }

        match report.enforce_ci_gate() {
            Ok(()) => {
                println!(
                    "{domain}: {} needles, {} passed, baseline clean",
                    report.summary.total_needles, report.summary.passed
                );
            }
            Err(err) => {
                eprintln!("{err}");
                for outcome in report.outcomes.iter().filter(|o| !o.passed) {
                    eprintln!("  {}: {}", outcome.needle, outcome.detail);
                }
                gate_failed = true;
            }
        }
    }

    if gate_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
