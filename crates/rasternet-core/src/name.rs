//! Parsing of graph-model input references.
//!
//! An input reference is `node`, `node:index` or `node:output_name:index`.

use crate::{Error, Result};
use std::collections::HashMap;

/// A parsed input reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedName {
    pub node: String,
    pub output_index: usize,
    pub output_name: Option<String>,
}

/// Parse an input reference.
///
/// # Example
///
/// ```text
/// "conv"          -> ("conv", 0, None)
/// "conv:1"        -> ("conv", 1, None)
/// "split:out:2"   -> ("split", 2, Some("out"))
/// ```
///
/// # Errors
/// Returns `GraphBuild` if the index is not a non-negative integer or the
/// reference has more than three parts.
pub fn parse_node_name(name: &str) -> Result<ParsedName> {
    let parts: Vec<&str> = name.split(':').collect();
    let invalid = |reason: &str| Error::GraphBuild(format!("invalid node reference '{name}': {reason}"));

    match parts.as_slice() {
        [node] => Ok(ParsedName {
            node: node.to_string(),
            output_index: 0,
            output_name: None,
        }),
        [node, index] | [node, _, index] => {
            let output_index = index
                .parse::<usize>()
                .map_err(|_| invalid("output index is not an integer"))?;
            let output_name = (parts.len() == 3).then(|| parts[1].to_string());
            Ok(ParsedName {
                node: node.to_string(),
                output_index,
                output_name,
            })
        }
        _ => Err(invalid("too many ':' separators")),
    }
}

/// Memo of parsed references, owned by one graph build.
///
/// The same string always yields the same parse.
#[derive(Debug, Default)]
pub struct NodeNameCache {
    parsed: HashMap<String, ParsedName>,
}

impl NodeNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, name: &str) -> Result<ParsedName> {
        if let Some(parsed) = self.parsed.get(name) {
            return Ok(parsed.clone());
        }
        let parsed = parse_node_name(name)?;
        self.parsed.insert(name.to_string(), parsed.clone());
        Ok(parsed)
    }

    pub fn len(&self) -> usize {
        self.parsed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_name() {
        let parsed = parse_node_name("conv").unwrap();
        assert_eq!(parsed.node, "conv");
        assert_eq!(parsed.output_index, 0);
        assert_eq!(parsed.output_name, None);
    }

    #[test]
    fn test_indexed_name() {
        let parsed = parse_node_name("conv:1").unwrap();
        assert_eq!((parsed.node.as_str(), parsed.output_index), ("conv", 1));
    }

    #[test]
    fn test_named_output() {
        let parsed = parse_node_name("split:out:2").unwrap();
        assert_eq!(parsed.node, "split");
        assert_eq!(parsed.output_index, 2);
        assert_eq!(parsed.output_name.as_deref(), Some("out"));
    }

    #[test]
    fn test_bad_index() {
        assert!(parse_node_name("conv:x").is_err());
        assert!(parse_node_name("a:b:c:1").is_err());
    }

    #[test]
    fn test_cache_is_stable() {
        let mut cache = NodeNameCache::new();
        let first = cache.parse("x:0").unwrap();
        let second = cache.parse("x:0").unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }
}
