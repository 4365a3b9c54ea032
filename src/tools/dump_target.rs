use anyhow::Result;

use tyrepr::target::TargetSpec;

pub fn dump_target(target: &str, json: bool) -> Result<()> {
    let spec = TargetSpec::load(target)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&spec)?);
    } else {
        println!("{spec:#?}");
    }
    Ok(())
}
