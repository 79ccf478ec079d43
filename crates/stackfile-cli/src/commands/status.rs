//! Status command - show the status of each release

use crate::GlobalArgs;
use crate::display;
use crate::error::Result;

pub async fn run(global: &GlobalArgs) -> Result<()> {
    let run = super::open(global, false).await?;
    let report = run.status().await?;
    display::print_outputs(&report.outputs, "Status of release");
    report.into_result()?;
    Ok(())
}
