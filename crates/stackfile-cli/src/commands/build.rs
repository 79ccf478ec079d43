//! Build command - print the resolved state

use serde_json::json;

use crate::GlobalArgs;
use crate::error::{CliError, Result};

pub async fn run(global: &GlobalArgs) -> Result<()> {
    let (state, _) = super::load(global).await?;

    let resolved = json!({
        "environment": state.env.name,
        "values": state.rendered_values()?,
        "repositories": state.repositories,
        "releases": state.releases,
    });
    let yaml = serde_yaml::to_string(&resolved).map_err(|e| CliError::Other {
        message: format!("failed to serialize state: {}", e),
    })?;

    println!("---");
    println!("# Source: {}", state.file_path.display());
    println!();
    print!("{}", yaml);
    Ok(())
}
