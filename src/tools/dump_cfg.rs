use anyhow::Result;

use tyrepr::cfg::CfgRegistry;
use tyrepr::target::TargetSpec;

pub fn dump_cfg(target: &str) -> Result<()> {
    let spec = TargetSpec::load(target)?;
    let mut cfg = CfgRegistry::new();
    spec.apply_cfg(&mut cfg);

    println!("flags:");
    for flag in cfg.flags() {
        println!("  {flag}");
    }
    println!("values:");
    for (name, values) in cfg.values() {
        for value in values {
            println!("  {name} = {value:?}");
        }
    }
    Ok(())
}
