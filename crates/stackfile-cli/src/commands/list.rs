//! List command - list the selected releases

use console::style;
use serde_json::json;

use crate::GlobalArgs;
use crate::error::{CliError, Result};

pub async fn run(global: &GlobalArgs, output_json: bool) -> Result<()> {
    let (state, _) = super::load(global).await?;
    let releases = state.select(&global.selectors, global.include_transitive_needs)?;
    let selected: Vec<_> = releases.iter().filter(|r| !r.filtered).map(|r| &r.spec).collect();

    if output_json {
        let rows: Vec<_> = selected
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "namespace": spec.namespace,
                    "installed": spec.desired(),
                    "labels": spec.labels,
                    "chart": spec.chart,
                    "version": spec.version,
                })
            })
            .collect();
        let out = serde_json::to_string_pretty(&rows).map_err(|e| CliError::Other {
            message: e.to_string(),
        })?;
        println!("{}", out);
        return Ok(());
    }

    if selected.is_empty() {
        println!("No releases selected");
        return Ok(());
    }

    println!(
        "{:<24} {:<16} {:<10} {:<32} {:<28} {}",
        style("NAME").bold(),
        style("NAMESPACE").bold(),
        style("INSTALLED").bold(),
        style("LABELS").bold(),
        style("CHART").bold(),
        style("VERSION").bold()
    );
    for spec in selected {
        let labels: Vec<String> = spec.labels.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
        println!(
            "{:<24} {:<16} {:<10} {:<32} {:<28} {}",
            spec.name,
            spec.namespace,
            spec.desired(),
            labels.join(","),
            spec.chart,
            spec.version
        );
    }
    Ok(())
}
