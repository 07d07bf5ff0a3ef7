//! Persisted stage tree.

use serde::{Deserialize, Serialize};

/// One stage of a workflow, addressed by its position under its parent.
///
/// Only structure and cached outputs are persisted. Rollback handlers and
/// other live state are rebuilt on every attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StageNode>,
    /// Encoded stage output, present once the stage has committed.
    #[serde(
        default,
        with = "serde_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub output: Option<Vec<u8>>,
}

impl StageNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            output: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.output.is_some()
    }

    /// Walk down `path`, returning `None` if any position is missing.
    pub fn node(&self, path: &[usize]) -> Option<&StageNode> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get(index))
    }

    pub fn node_mut(&mut self, path: &[usize]) -> Option<&mut StageNode> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get_mut(index))
    }

    /// Number of committed stages in this subtree, this node included.
    pub fn committed_count(&self) -> usize {
        usize::from(self.is_committed())
            + self
                .children
                .iter()
                .map(StageNode::committed_count)
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StageNode {
        let mut root = StageNode::new("root");
        let mut inner = StageNode::new("inner");
        inner.children.push(StageNode {
            output: Some(b"1".to_vec()),
            ..StageNode::new("leaf")
        });
        root.children.push(StageNode::new("first"));
        root.children.push(inner);
        root
    }

    #[test]
    fn test_node_lookup() {
        let mut root = sample();
        assert_eq!(root.node(&[]).unwrap().name, "root");
        assert_eq!(root.node(&[1, 0]).unwrap().name, "leaf");
        assert!(root.node(&[2]).is_none());
        assert!(root.node(&[0, 0]).is_none());

        root.node_mut(&[0]).unwrap().output = Some(b"2".to_vec());
        assert_eq!(root.committed_count(), 2);
    }

    #[test]
    fn test_serde_skips_empty_fields() {
        let json = serde_json::to_string(&StageNode::new("x")).unwrap();
        assert_eq!(json, r#"{"name":"x"}"#);

        let root = sample();
        let back: StageNode =
            serde_json::from_slice(&serde_json::to_vec(&root).unwrap()).unwrap();
        assert_eq!(back, root);
    }
}
