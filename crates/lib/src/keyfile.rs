//! A small, order-preserving codec for the sectioned key-value format
//! shared by `system.conf` and update manifests.
//!
//! The serializer is canonical: emitting a parsed document reproduces the
//! input byte-for-byte as long as the input carried no comments or excess
//! whitespace. Manifest checksums and signatures depend on this.

use anyhow::{bail, Result};

/// One `[name]` section with its entries in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Section {
    pub(crate) name: String,
    pub(crate) entries: Vec<(String, String)>,
}

impl Section {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value for the given key, if any.
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed document: sections in file order. Duplicate section names are
/// allowed; manifests use repeated `[file.<class>]` sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct KeyFile {
    pub(crate) sections: Vec<Section>,
}

impl KeyFile {
    pub(crate) fn parse(input: &str) -> Result<Self> {
        let mut sections: Vec<Section> = Vec::new();
        for (lineno, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let Some(name) = name.strip_suffix(']') else {
                    bail!("line {}: unterminated section header", lineno + 1);
                };
                if name.is_empty() {
                    bail!("line {}: empty section name", lineno + 1);
                }
                sections.push(Section::new(name));
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("line {}: expected 'key=value', got '{line}'", lineno + 1);
            };
            let Some(section) = sections.last_mut() else {
                bail!("line {}: entry outside of any section", lineno + 1);
            };
            section.push(key.trim_end(), value.trim_start());
        }
        Ok(Self { sections })
    }

    /// First section with the given name.
    pub(crate) fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Canonical serialization: `[name]` then `key=value` lines, one
    /// blank line between sections, trailing newline.
    pub(crate) fn to_string(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push('[');
            out.push_str(&section.name);
            out.push_str("]\n");
            for (k, v) in &section.entries {
                out.push_str(k);
                out.push('=');
                out.push_str(v);
                out.push('\n');
            }
        }
        out
    }
}
