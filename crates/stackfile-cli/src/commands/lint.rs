//! Lint command - lint the chart of each release

use crate::GlobalArgs;
use crate::display;
use crate::error::Result;

pub async fn run(global: &GlobalArgs) -> Result<()> {
    let run = super::open(global, false).await?;
    let report = run.lint().await?;
    display::print_outputs(&report.outputs, "Linting release");
    report.into_result()?;
    Ok(())
}
