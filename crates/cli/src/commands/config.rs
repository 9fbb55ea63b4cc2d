//! Configuration commands

use anyhow::{Context, Result};
use harvester::RuntimeConfig;

/// Show the effective configuration as TOML
pub fn cmd_config_show(runtime: &RuntimeConfig) -> Result<()> {
  if runtime.config_path.exists() {
    println!("# Using config: {}", runtime.config_path.display());
  } else {
    println!(
      "# Using default configuration ({} not found)",
      runtime.config_path.display()
    );
  }
  println!();

  let toml_str = toml::to_string_pretty(&runtime.config).context("Failed to render configuration")?;
  println!("{toml_str}");
  Ok(())
}
