//! Per-run lookup context: the attribute table and option-set codes.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use pdir_core::{Attribute, AttributeKind, AttributeTable, Variant};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct LookupFile {
    /// variant -> store field -> label -> code
    #[serde(default)]
    option_sets: BTreeMap<String, BTreeMap<String, BTreeMap<String, i64>>>,
}

fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Built once per run and passed to whatever needs it.
#[derive(Debug, Clone, Default)]
pub struct LookupContext {
    attributes: AttributeTable,
    option_sets: HashMap<Attribute, HashMap<String, i64>>,
}

impl LookupContext {
    pub fn new(attributes: AttributeTable) -> Self {
        Self {
            attributes,
            option_sets: HashMap::new(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: LookupFile = serde_yaml::from_str(text).context("parsing lookup yaml")?;
        let mut context = Self::new(AttributeTable::standard());
        for (variant_name, fields) in &file.option_sets {
            let variant = Variant::ALL
                .into_iter()
                .find(|v| v.to_string() == *variant_name)
                .with_context(|| format!("unknown variant '{variant_name}' in option sets"))?;
            for (field, labels) in fields {
                let attribute = context.attributes.resolve(variant, field)?;
                context.insert_option_set(attribute, labels.iter().map(|(l, c)| (l.as_str(), *c)))?;
            }
        }
        Ok(context)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading lookups from {}", path.display()))
    }

    pub fn insert_option_set<'a>(
        &mut self,
        attribute: Attribute,
        labels: impl IntoIterator<Item = (&'a str, i64)>,
    ) -> Result<()> {
        if attribute.kind() != AttributeKind::OptionSet {
            bail!("{} is not an option-set attribute", attribute.field());
        }
        let table = self.option_sets.entry(attribute).or_default();
        for (label, code) in labels {
            table.insert(normalize_label(label), code);
        }
        Ok(())
    }

    pub fn attributes(&self) -> &AttributeTable {
        &self.attributes
    }

    pub fn option_code(&self, attribute: Attribute, label: &str) -> Option<i64> {
        self.option_sets
            .get(&attribute)?
            .get(&normalize_label(label))
            .copied()
    }

    pub fn specialty_code(&self, name: &str) -> Option<i64> {
        self.option_code(Attribute::PrimarySpecialty, name)
    }

    pub fn option_set_len(&self, attribute: Attribute) -> usize {
        self.option_sets.get(&attribute).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE: &str = r#"
option_sets:
  individual:
    pd_primaryspecialty:
      CARDIOLOGY: 100000004
      Family Practice: 100000008
"#;

    #[test]
    fn specialty_lookup_ignores_case_and_spacing() {
        let ctx = LookupContext::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(ctx.specialty_code("cardiology"), Some(100000004));
        assert_eq!(ctx.specialty_code("  FAMILY   practice "), Some(100000008));
        assert_eq!(ctx.specialty_code("NUCLEAR MEDICINE"), None);
    }

    #[test]
    fn unknown_fields_and_non_option_attributes_are_rejected() {
        let unknown = "option_sets:\n  individual:\n    pd_nonexistent:\n      A: 1\n";
        assert!(LookupContext::from_yaml_str(unknown).is_err());

        let not_option = "option_sets:\n  facility:\n    pd_name:\n      A: 1\n";
        assert!(LookupContext::from_yaml_str(not_option).is_err());

        let bad_variant = "option_sets:\n  clinic:\n    pd_name:\n      A: 1\n";
        assert!(LookupContext::from_yaml_str(bad_variant).is_err());
    }

    #[test]
    fn empty_file_yields_empty_context() {
        let ctx = LookupContext::from_yaml_str("{}").unwrap();
        assert_eq!(ctx.option_set_len(Attribute::PrimarySpecialty), 0);
        assert!(!ctx.attributes().is_empty());
    }

    #[test]
    fn workspace_lookups_file_loads() {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let ctx = LookupContext::load(root.join("lookups.yaml")).unwrap();
        assert_eq!(ctx.specialty_code("Cardiology"), Some(100000004));
        assert!(ctx.option_set_len(Attribute::PrimarySpecialty) > 10);
    }
}
