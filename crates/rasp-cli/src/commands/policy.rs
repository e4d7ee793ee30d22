use std::path::Path;

use anyhow::{Context, Result};

use policy_engine::rules::RuleScript;
use policy_engine::runtime::PolicyScript;
use rasp_core::types::CheckType;

pub fn check(file: &Path) -> Result<()> {
    let script = PolicyScript::load(file)?;
    let compiled = RuleScript::compile(&script.source)
        .with_context(|| format!("invalid policy {}", file.display()))?;

    println!(
        "Policy '{}' is valid: {} active rules (sha256 {}).",
        compiled.id,
        compiled.rules.len(),
        &script.digest[..12]
    );
    for check_type in CheckType::ALL {
        let count = compiled.rules_for(check_type);
        if count > 0 {
            println!("  {:<16} {count}", check_type.as_str());
        }
    }
    Ok(())
}
