//! Config command implementation.

use catsync_engine::EngineConfig;

/// Prints the default engine configuration.
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", render()?);
    Ok(())
}

fn render() -> serde_json::Result<String> {
    serde_json::to_string_pretty(&EngineConfig::default())
}
