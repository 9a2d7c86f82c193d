//! Rendered output and the bounded container it is mounted into.
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One node of a rendered component tree, as serialized by the host runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RenderNode {
    Text(String),
    Element {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        props: Map<String, Value>,
        #[serde(default)]
        children: Vec<RenderNode>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct MountLimits {
    pub max_nodes: usize,
    pub max_depth: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountError {
    TooLarge { bytes: usize, max: usize },
    TooManyNodes { max: usize },
    TooDeep { max: usize },
    Malformed(String),
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { bytes, max } => {
                write!(f, "rendered output is {bytes} bytes, container limit is {max}")
            }
            Self::TooManyNodes { max } => {
                write!(f, "rendered output exceeds the container limit of {max} nodes")
            }
            Self::TooDeep { max } => {
                write!(f, "rendered output is nested deeper than {max} levels")
            }
            Self::Malformed(e) => write!(f, "rendered output is malformed: {e}"),
        }
    }
}

impl std::error::Error for MountError {}

/// A rendered tree that fits the container limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderTree {
    roots: Vec<RenderNode>,
    nodes: usize,
}

impl RenderTree {
    /// Parses the host runtime's JSON output and enforces `limits`.
    pub fn from_json(json: &str, limits: &MountLimits) -> Result<Self, MountError> {
        if json.len() > limits.max_bytes {
            return Err(MountError::TooLarge {
                bytes: json.len(),
                max: limits.max_bytes,
            });
        }
        let roots: Vec<RenderNode> =
            serde_json::from_str(json).map_err(|e| MountError::Malformed(e.to_string()))?;

        let mut nodes = 0;
        for root in &roots {
            count(root, 1, limits, &mut nodes)?;
        }
        Ok(Self { roots, nodes })
    }

    pub fn roots(&self) -> &[RenderNode] {
        &self.roots
    }

    pub fn node_count(&self) -> usize {
        self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Concatenated text content, the way a reader of the mounted
    /// container would see it.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for root in &self.roots {
            collect_text(root, &mut out);
        }
        out
    }
}

fn count(
    node: &RenderNode,
    depth: usize,
    limits: &MountLimits,
    nodes: &mut usize,
) -> Result<(), MountError> {
    if depth > limits.max_depth {
        return Err(MountError::TooDeep {
            max: limits.max_depth,
        });
    }
    *nodes += 1;
    if *nodes > limits.max_nodes {
        return Err(MountError::TooManyNodes {
            max: limits.max_nodes,
        });
    }
    if let RenderNode::Element { children, .. } = node {
        for child in children {
            count(child, depth + 1, limits, nodes)?;
        }
    }
    Ok(())
}

fn collect_text(node: &RenderNode, out: &mut String) {
    match node {
        RenderNode::Text(text) => out.push_str(text),
        RenderNode::Element { children, .. } => {
            for child in children {
                collect_text(child, out);
            }
        }
    }
}

/// The container rendered output is mounted into. Only the bridge owns
/// one; mounting replaces whatever was there before.
#[derive(Debug, Default)]
pub struct MountPoint {
    mounted: Option<(String, RenderTree)>,
}

impl MountPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, execution_id: &str, tree: RenderTree) {
        self.mounted = Some((execution_id.to_string(), tree));
    }

    pub fn unmount(&mut self) -> Option<RenderTree> {
        self.mounted.take().map(|(_, tree)| tree)
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.mounted.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn tree(&self) -> Option<&RenderTree> {
        self.mounted.as_ref().map(|(_, tree)| tree)
    }
}
