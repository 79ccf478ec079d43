//! Template command - render manifests locally

use crate::GlobalArgs;
use crate::display;
use crate::error::Result;

pub async fn run(global: &GlobalArgs) -> Result<()> {
    let run = super::open(global, false).await?;
    let report = run.template().await?;
    display::print_outputs(&report.outputs, "");
    report.into_result()?;
    Ok(())
}
