//! Display formatting for CLI output

use console::style;
use stackfile_state::{AffectedReleases, ReleaseOutput};
use std::fmt::Write;

/// Summary of what a sync or destroy did
pub fn format_affected(affected: &AffectedReleases) -> String {
    let mut out = String::new();

    if !affected.upgraded.is_empty() {
        let _ = writeln!(out, "\n{}", style("UPDATED RELEASES:").bold());
        let _ = writeln!(out, "{:<30} {:<40} {}", "NAME", "CHART", "VERSION");
        for r in &affected.upgraded {
            let _ = writeln!(out, "{:<30} {:<40} {}", r.name, r.chart, r.version);
        }
    }

    if !affected.deleted.is_empty() {
        let _ = writeln!(out, "\n{}", style("DELETED RELEASES:").bold());
        let _ = writeln!(out, "NAME");
        for r in &affected.deleted {
            let _ = writeln!(out, "{}", r.name);
        }
    }

    if !affected.failed.is_empty() {
        let _ = writeln!(out, "\n{}", style("FAILED RELEASES:").red().bold());
        let _ = writeln!(out, "NAME");
        for r in &affected.failed {
            let _ = writeln!(out, "{}", style(&r.name).red());
        }
    }

    out
}

pub fn print_affected(affected: &AffectedReleases) {
    if affected.is_empty() {
        return;
    }
    print!("{}", format_affected(affected));
}

/// Print per-release output, optionally under a header line per release
pub fn print_outputs(outputs: &[ReleaseOutput], header: &str) {
    for output in outputs {
        if output.output.trim().is_empty() {
            continue;
        }
        if !header.is_empty() {
            println!("{} {}", style("→").blue(), style(format!("{} {}", header, output.name)).bold());
        }
        print!("{}", output.output);
        if !output.output.ends_with('\n') {
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackfile_state::AffectedRelease;

    fn affected(name: &str) -> AffectedRelease {
        AffectedRelease {
            id: format!("default/{}", name),
            name: name.into(),
            chart: format!("stable/{}", name),
            version: "1.0.0".into(),
        }
    }

    #[test]
    fn test_format_affected_sections() {
        let summary = format_affected(&AffectedReleases {
            upgraded: vec![affected("web")],
            deleted: vec![affected("old")],
            failed: vec![],
        });
        assert!(summary.contains("UPDATED RELEASES:"));
        assert!(summary.contains("stable/web"));
        assert!(summary.contains("DELETED RELEASES:"));
        assert!(summary.contains("old"));
        assert!(!summary.contains("FAILED RELEASES:"));
    }

    #[test]
    fn test_format_affected_empty() {
        assert!(format_affected(&AffectedReleases::default()).is_empty());
    }
}
