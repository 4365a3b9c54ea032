use std::path::Path;

use anyhow::Result;

use tyrepr::target::TargetSpec;

pub fn export_target(target: &str, output: &Path) -> Result<()> {
    let spec = TargetSpec::load(target)?;
    spec.save_to_file(output)?;
    println!("wrote {}", output.display());
    Ok(())
}
