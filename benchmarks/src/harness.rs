use std::path::Path;

use throughput::{RecordClass, RecordStatus, RunReport};

fn ms(value: f64) -> String {
    if value < 1.0 {
        format!("{:.3}ms", value)
    } else {
        format!("{:.1}ms", value)
    }
}

fn rate(per_sec: f64) -> String {
    if per_sec >= 1e9 {
        format!("{:.2}G", per_sec / 1e9)
    } else if per_sec >= 1e6 {
        format!("{:.1}M", per_sec / 1e6)
    } else {
        format!("{:.0}", per_sec)
    }
}

/// Print one problem's comparison table to stdout.
pub fn print_report(report: &RunReport) {
    let name_w = 22;
    let col_w = 12;

    println!();
    println!("{}  (reference {})", report.problem.label(), ms(report.reference.elapsed_ms));
    println!(
        "{:<name_w$} {:>col_w$} {:>col_w$} {:>col_w$} {:>col_w$} {:>6}",
        "Backend", "Time", "GFLOP/s", "Elem/s", "Speedup", "Check",
        name_w = name_w, col_w = col_w
    );
    println!("{}", "-".repeat(name_w + col_w * 4 + 6 + 5));

    for r in &report.records {
        let check_str = match r.class() {
            RecordClass::Verified => "✓",
            RecordClass::Mismatch => "✗",
            RecordClass::Failed => "—",
        };
        match &r.status {
            RecordStatus::Completed { elapsed_ms, throughput, .. } => println!(
                "{:<name_w$} {:>col_w$} {:>col_w$} {:>col_w$} {:>col_w$} {:>6}",
                r.backend_label,
                ms(*elapsed_ms),
                format!("{:.2}", throughput.gflops),
                rate(throughput.elements_per_sec),
                format!("{:.2}x", throughput.speedup),
                check_str,
                name_w = name_w, col_w = col_w
            ),
            RecordStatus::Failed { error_kind, diagnostic } => println!(
                "{:<name_w$} {:>col_w$} {}: {}",
                r.backend_label, check_str, error_kind, diagnostic,
                name_w = name_w, col_w = col_w
            ),
        }
    }
}

/// Per-phase breakdown for backends that report one.
pub fn print_phases(report: &RunReport) {
    for r in &report.records {
        if let RecordStatus::Completed { phases, .. } = &r.status {
            if phases.is_empty() {
                continue;
            }
            let parts: Vec<String> =
                phases.iter().map(|p| format!("{} {}", p.label, ms(p.elapsed_ms))).collect();
            println!("  {:<20} {}", r.backend_label, parts.join(", "));
        }
    }
}

/// One-line tally across every report.
pub fn print_summary(reports: &[RunReport]) {
    let (mut verified, mut mismatched, mut failed) = (0, 0, 0);
    for r in reports.iter().flat_map(|r| &r.records) {
        match r.class() {
            RecordClass::Verified => verified += 1,
            RecordClass::Mismatch => mismatched += 1,
            RecordClass::Failed => failed += 1,
        }
    }
    println!();
    println!(
        "{} problems: {} verified, {} mismatched, {} failed",
        reports.len(), verified, mismatched, failed
    );
}

pub fn write_json(reports: &[RunReport], path: &Path) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(reports)?;
    std::fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use throughput::{
        DType, ProblemDescriptor, ReportRecord, Throughput, TimingSample, VerificationOutcome,
    };

    fn report() -> RunReport {
        let problem = ProblemDescriptor::sum(1000, DType::F32);
        RunReport {
            reference: TimingSample { label: "serial".into(), elapsed_ms: 2.0 },
            records: vec![
                ReportRecord {
                    backend_label: "threads x4".into(),
                    status: RecordStatus::Completed {
                        elapsed_ms: 0.5,
                        phases: Vec::new(),
                        throughput: Throughput::measure(&problem, 0.5, 2.0),
                        verification: VerificationOutcome { compared: 1, matched: 1, tolerance: 1e-3 },
                    },
                },
                ReportRecord {
                    backend_label: "gpu (wgpu)".into(),
                    status: RecordStatus::Failed {
                        error_kind: "NoPlatformFound".into(),
                        diagnostic: "no compute platform found".into(),
                    },
                },
            ],
            problem,
        }
    }

    #[test]
    fn test_ms_formatting() {
        assert_eq!(ms(0.25), "0.250ms");
        assert_eq!(ms(12.34), "12.3ms");
        assert_eq!(rate(2.5e9), "2.50G");
        assert_eq!(rate(4.0e6), "4.0M");
    }

    #[test]
    fn test_json_report_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_json(&[report()], &path).unwrap();
        let back: Vec<RunReport> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].problem, report().problem);
        assert_eq!(back[0].record("threads x4").unwrap().class(), RecordClass::Verified);
        assert_eq!(back[0].record("gpu (wgpu)").unwrap().class(), RecordClass::Failed);
    }
}
