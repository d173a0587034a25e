//! Rules command implementation.

use catsync_core::ConflictRules;

/// Prints the default conflict rule table.
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(&ConflictRules::default())?);
    Ok(())
}
