//! Sync command - converge releases to the state

use crate::GlobalArgs;
use crate::display;
use crate::error::Result;

pub async fn run(global: &GlobalArgs) -> Result<()> {
    let run = super::open(global, false).await?;
    let report = run.sync().await?;
    display::print_affected(&report.affected);
    report.into_result()?;
    Ok(())
}
