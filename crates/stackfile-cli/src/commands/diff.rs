//! Diff command - show pending changes

use crate::GlobalArgs;
use crate::display;
use crate::error::{CliError, Result};

pub async fn run(global: &GlobalArgs, detailed_exitcode: bool) -> Result<()> {
    let run = super::open(global, false).await?;
    let report = run.diff().await?;
    display::print_outputs(&report.outputs, "Comparing release");

    let changed = report.outputs.iter().filter(|o| !o.output.trim().is_empty()).count();
    let has_changes = report.changed;
    report.into_result()?;

    if detailed_exitcode && has_changes {
        return Err(CliError::Changes { count: changed });
    }
    Ok(())
}
