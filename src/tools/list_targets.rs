use anyhow::Result;

use tyrepr::target::BUILTIN_NAMES;

pub fn list_targets() -> Result<()> {
    for name in BUILTIN_NAMES {
        println!("{name}");
    }
    Ok(())
}
