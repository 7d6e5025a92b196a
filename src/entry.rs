//! Directory entries as produced by search.

use std::collections::HashSet;
use std::fmt;

use crate::error::{LdapError, LdapResult};
use crate::session::RawEntry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeValue {
    Text(String),
    Binary(Vec<u8>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            AttributeValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeValue::Text(s) => s.as_bytes(),
            AttributeValue::Binary(b) => b,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, AttributeValue::Binary(_))
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(b: Vec<u8>) -> Self {
        AttributeValue::Binary(b)
    }
}

/// Named attribute with its values in arrival order. Duplicate values are
/// dropped on insert.
#[derive(Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    values: Vec<AttributeValue>,
    // Mirrors `values` for constant-time duplicate checks.
    seen: HashSet<AttributeValue>,
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("values", &self.values)
            .finish()
    }
}

impl Attribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[AttributeValue] {
        &self.values
    }

    pub fn add_value(&mut self, value: AttributeValue) {
        if self.seen.insert(value.clone()) {
            self.values.push(value);
        }
    }

    pub fn text_values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().filter_map(AttributeValue::as_str)
    }
}

/// DN plus attributes. Attribute names are unique ignoring ASCII case; the
/// spelling of the first occurrence is kept.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectoryEntry {
    dn: String,
    attributes: Vec<Attribute>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    fn attribute_mut(&mut self, name: &str) -> &mut Attribute {
        let pos = match self
            .attributes
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))
        {
            Some(pos) => pos,
            None => {
                self.attributes.push(Attribute::new(name));
                self.attributes.len() - 1
            }
        };
        &mut self.attributes[pos]
    }

    pub fn add_value(&mut self, name: &str, value: impl Into<AttributeValue>) {
        self.attribute_mut(name).add_value(value.into());
    }

    pub fn with_value(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.add_value(name, value);
        self
    }

    /// First textual value of `name`.
    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.attribute(name).and_then(|a| a.text_values().next())
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        let pos = self
            .attributes
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))?;
        Some(self.attributes.remove(pos))
    }

    /// Removes one value; the attribute goes away with its last value.
    pub fn remove_value(&mut self, name: &str, value: &AttributeValue) -> bool {
        let Some(pos) = self
            .attributes
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))
        else {
            return false;
        };
        let attr = &mut self.attributes[pos];
        let before = attr.values.len();
        attr.values.retain(|v| v.as_bytes() != value.as_bytes());
        attr.seen.retain(|v| v.as_bytes() != value.as_bytes());
        let removed = attr.values.len() != before;
        if attr.values.is_empty() {
            self.attributes.remove(pos);
        }
        removed
    }

    /// Unions `other`'s attribute values into this entry. The DN is kept.
    pub fn merge(&mut self, other: DirectoryEntry) {
        for attr in other.attributes {
            let target = self.attribute_mut(&attr.name);
            for value in attr.values {
                target.add_value(value);
            }
        }
    }

    /// Builds an entry from backend attribute octets. Values of attributes
    /// named in `binary_attributes` (ASCII case ignored) always stay binary;
    /// other values become text when they are valid UTF-8.
    pub fn from_raw(raw: RawEntry, binary_attributes: &[String]) -> LdapResult<Self> {
        let binary: HashSet<String> = binary_attributes
            .iter()
            .map(|n| n.to_ascii_lowercase())
            .collect();
        let mut entry = DirectoryEntry::new(raw.dn);
        for (name, values) in raw.attributes {
            if name.is_empty() {
                return Err(LdapError::decode(format!(
                    "Entry {} has an attribute with an empty name",
                    entry.dn
                )));
            }
            let force_binary = binary.contains(&name.to_ascii_lowercase())
                || name.to_ascii_lowercase().ends_with(";binary");
            let attr = entry.attribute_mut(&name);
            for value in values {
                let value = if force_binary {
                    AttributeValue::Binary(value)
                } else {
                    match String::from_utf8(value) {
                        Ok(s) => AttributeValue::Text(s),
                        Err(e) => AttributeValue::Binary(e.into_bytes()),
                    }
                };
                attr.add_value(value);
            }
        }
        Ok(entry)
    }
}

impl fmt::Display for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dn: {}", self.dn)?;
        for attr in &self.attributes {
            for value in &attr.values {
                match value {
                    AttributeValue::Text(s) => writeln!(f, "{}: {}", attr.name, s)?,
                    AttributeValue::Binary(b) => {
                        writeln!(f, "{}:: <{} bytes>", attr.name, b.len())?
                    }
                }
            }
        }
        Ok(())
    }
}

/// Collapses a result set into one entry: the first entry, with the values of
/// every later entry merged into it. `None` for an empty result.
pub fn merge_entries(entries: Vec<DirectoryEntry>) -> Option<DirectoryEntry> {
    let mut iter = entries.into_iter();
    let mut merged = iter.next()?;
    for entry in iter {
        merged.merge(entry);
    }
    Some(merged)
}
