//! Layer stack parsing and lookup.

use std::collections::HashSet;
use std::ops::Index;

use stein_common::{SteinError, SteinResult};

/// Ordered stack of layer directory names, topmost first.
///
/// Each entry is `"<priority>-<shortname>"`, e.g.
/// `["99-local", "50-custom", "00-base"]`. The digit prefix is informational
/// only; the order of the vector is authoritative. Index 0 is the writable
/// upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStack(Vec<String>);

impl LayerStack {
    /// Build a stack from full directory names, validating the naming form
    /// and short-name uniqueness.
    pub fn new(layers: Vec<String>) -> SteinResult<Self> {
        if layers.is_empty() {
            return Err(SteinError::EmptyLayerStack);
        }
        let mut seen = HashSet::new();
        for full in &layers {
            let short = split_short(full).ok_or_else(|| SteinError::InvalidLayerName {
                name: full.clone(),
            })?;
            if !seen.insert(short) {
                return Err(SteinError::InvalidLayerName { name: full.clone() });
            }
        }
        Ok(Self(layers))
    }

    /// Position of the layer with short name `short`, 0 being the top.
    pub fn index_of(&self, short: &str) -> SteinResult<usize> {
        self.0
            .iter()
            .position(|full| split_short(full) == Some(short))
            .ok_or_else(|| SteinError::UnknownLayer {
                name: short.to_string(),
            })
    }

    /// Full directory name of the layer with short name `short`.
    ///
    /// `dir_name("custom")` returns `"50-custom"`.
    pub fn dir_name(&self, short: &str) -> SteinResult<&str> {
        Ok(&self.0[self.index_of(short)?])
    }

    /// Directory name of the topmost (writable) layer.
    pub fn top(&self) -> &str {
        &self.0[0]
    }

    /// Number of layers in the stack. Always at least 1.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// A validated stack is never empty; this exists for completeness.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the full directory names, topmost first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Index<usize> for LayerStack {
    type Output = str;

    fn index(&self, index: usize) -> &str {
        &self.0[index]
    }
}

/// Split `"NN-name"` on the first dash, returning the short name when the
/// full name matches the required form (digit prefix, possibly empty; short
/// name non-empty, no `/`).
fn split_short(full: &str) -> Option<&str> {
    let (prefix, short) = full.split_once('-')?;
    if short.is_empty() || short.contains('/') {
        return None;
    }
    if !prefix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> LayerStack {
        LayerStack::new(vec![
            "99-local".to_string(),
            "50-custom".to_string(),
            "00-base".to_string(),
        ])
        .unwrap()
    }

    #[test]
    fn index_and_dir_name_round_trip() {
        let s = stack();
        for (i, short) in ["local", "custom", "base"].iter().enumerate() {
            assert_eq!(s.index_of(short).unwrap(), i);
            let full = s.dir_name(short).unwrap();
            assert!(full.ends_with(&format!("-{short}")));
            assert_eq!(s.index_of(short).unwrap(), i);
            assert_eq!(&s[i], full);
        }
    }

    #[test]
    fn top_is_first() {
        assert_eq!(stack().top(), "99-local");
    }

    #[test]
    fn unknown_layer() {
        assert!(matches!(
            stack().index_of("missing"),
            Err(SteinError::UnknownLayer { .. })
        ));
    }

    #[test]
    fn empty_priority_prefix_is_allowed() {
        let s = LayerStack::new(vec!["-only".to_string()]).unwrap();
        assert_eq!(s.index_of("only").unwrap(), 0);
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in ["nodash", "10-", "x9-name", "10-a/b"] {
            assert!(
                matches!(
                    LayerStack::new(vec![bad.to_string()]),
                    Err(SteinError::InvalidLayerName { .. })
                ),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn rejects_duplicate_short_names() {
        let result = LayerStack::new(vec!["10-base".to_string(), "20-base".to_string()]);
        assert!(matches!(result, Err(SteinError::InvalidLayerName { .. })));
    }

    #[test]
    fn rejects_empty_stack() {
        assert!(matches!(
            LayerStack::new(Vec::new()),
            Err(SteinError::EmptyLayerStack)
        ));
    }

    #[test]
    fn short_name_may_contain_dashes() {
        let s = LayerStack::new(vec!["10-extra-fonts".to_string()]).unwrap();
        assert_eq!(s.index_of("extra-fonts").unwrap(), 0);
        assert_eq!(s.dir_name("extra-fonts").unwrap(), "10-extra-fonts");
    }
}
