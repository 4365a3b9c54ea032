use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// Compiler-wide `cfg(...)` registry. The target loader publishes the
/// derived flags and values here once per compilation; conditional
/// compilation then only queries it.
///
/// Values are a multimap: a name such as `target_has_atomic` carries
/// one entry per supported width.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CfgRegistry {
    flags: BTreeSet<String>,
    values: BTreeMap<String, Vec<String>>,
}

impl CfgRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_flag(&mut self, name: &str) {
        self.flags.insert(name.to_owned());
    }

    pub fn set_value(&mut self, name: &str, value: &str) {
        let entry = self.values.entry(name.to_owned()).or_default();
        if !entry.iter().any(|v| v == value) {
            entry.push(value.to_owned());
        }
    }

    /// Assign a value only when the name has none yet. Lets a generic
    /// fallback coexist with an earlier, more specific assignment.
    pub fn set_value_default(&mut self, name: &str, value: &str) {
        self.values
            .entry(name.to_owned())
            .or_insert_with(|| vec![value.to_owned()]);
    }

    pub fn is_flag_set(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    pub fn check_value(&self, name: &str, value: &str) -> bool {
        self.values
            .get(name)
            .is_some_and(|vals| vals.iter().any(|v| v == value))
    }

    pub fn values_of(&self, name: &str) -> &[String] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_value_does_not_override() {
        let mut cfg = CfgRegistry::new();
        cfg.set_value_default("target_vendor", "gnu");
        cfg.set_value_default("target_vendor", "");
        assert_eq!(cfg.values_of("target_vendor"), ["gnu"]);
        assert!(cfg.check_value("target_vendor", "gnu"));
        assert!(!cfg.check_value("target_vendor", ""));
    }

    #[test]
    fn multi_valued_names_accumulate() {
        let mut cfg = CfgRegistry::new();
        cfg.set_value("target_has_atomic", "8");
        cfg.set_value("target_has_atomic", "16");
        cfg.set_value("target_has_atomic", "16");
        assert_eq!(cfg.values_of("target_has_atomic"), ["8", "16"]);
    }

    #[test]
    fn flags_are_a_set() {
        let mut cfg = CfgRegistry::new();
        cfg.set_flag("unix");
        cfg.set_flag("unix");
        assert!(cfg.is_flag_set("unix"));
        assert!(!cfg.is_flag_set("windows"));
        assert_eq!(cfg.flags().count(), 1);
    }
}
