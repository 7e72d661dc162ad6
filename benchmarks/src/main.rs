mod harness;
mod kernels;

use std::path::PathBuf;

use throughput::config::parse_device_class;
use throughput::{DeviceApiChoice, Operation, Profile, RunConfig, Runner};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::kernels::WgslKernels;

fn print_usage() {
    eprintln!("Usage: benchmarks [OPTIONS]");
    eprintln!();
    eprintln!("  --bench <name>     Operation to run: sum, vecadd, matmul, all (default: all)");
    eprintln!("  --profile <name>   Profile: quick, medium, full (default: medium)");
    eprintln!("  --rounds <n>       Rounds per measurement, median reported (default: 5)");
    eprintln!("  --workers <n>      Worker threads for the thread pool (default: auto)");
    eprintln!("  --device <api>     Device api: wgpu, emulated, none (default: wgpu)");
    eprintln!("  --class <class>    Device class: gpu, accelerator, cpu, any (default: gpu)");
    eprintln!("  --config <path>    JSON run config; flags override its values");
    eprintln!("  --json <path>      Write every report as JSON");
    eprintln!("  --phases           Print upload/kernel/readback breakdown");
    eprintln!("  --help             Show this help");
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("{}", msg);
    std::process::exit(1);
}

fn main() {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("off")),
                ),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut bench = "all".to_string();
    let mut profile: Option<String> = None;
    let mut rounds: Option<usize> = None;
    let mut workers: Option<usize> = None;
    let mut device: Option<String> = None;
    let mut class: Option<String> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut json_path: Option<PathBuf> = None;
    let mut phases = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bench" => {
                i += 1;
                if i < args.len() { bench = args[i].clone(); }
            }
            "--profile" => {
                i += 1;
                if i < args.len() { profile = Some(args[i].clone()); }
            }
            "--rounds" => {
                i += 1;
                if i < args.len() { rounds = args[i].parse().ok(); }
            }
            "--workers" => {
                i += 1;
                if i < args.len() { workers = args[i].parse().ok(); }
            }
            "--device" => {
                i += 1;
                if i < args.len() { device = Some(args[i].clone()); }
            }
            "--class" => {
                i += 1;
                if i < args.len() { class = Some(args[i].clone()); }
            }
            "--config" => {
                i += 1;
                if i < args.len() { config_path = Some(PathBuf::from(&args[i])); }
            }
            "--json" => {
                i += 1;
                if i < args.len() { json_path = Some(PathBuf::from(&args[i])); }
            }
            "--phases" => phases = true,
            "--help" | "-h" => {
                print_usage();
                return;
            }
            other => {
                eprintln!("Unknown flag: {}", other);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => RunConfig::from_json_file(path).unwrap_or_else(|e| fail(e)),
        None => RunConfig::default(),
    };
    if let Some(p) = profile {
        config.profile = p.parse::<Profile>().unwrap_or_else(|e| fail(e));
    }
    if let Some(r) = rounds {
        config.rounds = r;
    }
    if let Some(w) = workers {
        config.workers = w;
        config.max_workers = config.max_workers.max(w);
    }
    if let Some(d) = device {
        config.device.api = d.parse::<DeviceApiChoice>().unwrap_or_else(|e| fail(e));
    }
    if let Some(c) = class {
        config.device.class = parse_device_class(&c).unwrap_or_else(|e| fail(e));
    }

    let wanted: &[Operation] = match bench.as_str() {
        "all" => &[Operation::Sum, Operation::VectorAdd, Operation::MatMul],
        "sum" => &[Operation::Sum],
        "vecadd" => &[Operation::VectorAdd],
        "matmul" => &[Operation::MatMul],
        other => fail(format!("Unknown bench: {}", other)),
    };
    let problems: Vec<_> =
        config.problems().into_iter().filter(|p| wanted.contains(&p.operation())).collect();

    println!(
        "Profile: {:?}  Rounds: {}  Workers: {}  Device: {:?}/{:?}",
        config.profile, config.rounds, config.workers, config.device.api, config.device.class
    );

    let mut runner = Runner::from_config(config, WgslKernels).unwrap_or_else(|e| fail(e));
    tracing::info!(problems = problems.len(), backends = ?runner.backend_labels(), "sweep_start");
    let mut reports = Vec::with_capacity(problems.len());
    for problem in &problems {
        match runner.run(problem) {
            Ok(report) => {
                harness::print_report(&report);
                if phases {
                    harness::print_phases(&report);
                }
                reports.push(report);
            }
            Err(e) => fail(format!("{}: {}", problem.label(), e)),
        }
    }
    harness::print_summary(&reports);

    if let Some(path) = json_path {
        if let Err(e) = harness::write_json(&reports, &path) {
            fail(format!("{}: {}", path.display(), e));
        }
    }
}
