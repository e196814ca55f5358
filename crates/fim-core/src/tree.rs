//! Hierarchical rule index mirroring the filesystem.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]; each node
//! keeps the index of its parent so paths are rebuilt by walking indices.

use crate::rules::{Rule, RuleKind};
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct RuleNode {
    name: String,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    rules: Vec<Rule>,
}

impl RuleNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Rules anchored here, in source order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn reaches_below(&self) -> bool {
        self.rules.iter().any(Rule::reaches_below)
    }

    fn selects(&self) -> bool {
        self.rules.iter().any(|r| r.kind != RuleKind::Negative)
    }
}

#[derive(Debug, Clone)]
pub struct RuleTree {
    nodes: Vec<RuleNode>,
}

impl Default for RuleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTree {
    pub const ROOT: NodeId = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![RuleNode {
                name: String::new(),
                parent: None,
                children: BTreeMap::new(),
                rules: Vec::new(),
            }],
        }
    }

    pub fn from_rules<I: IntoIterator<Item = Rule>>(rules: I) -> Self {
        let mut tree = Self::new();
        for rule in rules {
            tree.insert(rule);
        }
        tree
    }

    /// Index a rule under the node for its literal anchor, creating
    /// intermediate nodes as needed. Rules within a node stay sorted by
    /// source order.
    pub fn insert(&mut self, rule: Rule) -> NodeId {
        let mut id = Self::ROOT;
        for component in rule.anchor() {
            let existing = self.nodes[id].children.get(component).copied();
            id = match existing {
                Some(child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(RuleNode {
                        name: component.clone(),
                        parent: Some(id),
                        children: BTreeMap::new(),
                        rules: Vec::new(),
                    });
                    self.nodes[id].children.insert(component.clone(), child);
                    child
                }
            };
        }
        let rules = &mut self.nodes[id].rules;
        let pos = rules.partition_point(|r| r.source_order <= rule.source_order);
        rules.insert(pos, rule);
        id
    }

    pub fn node(&self, id: NodeId) -> &RuleNode {
        &self.nodes[id]
    }

    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[id].children.get(name).copied()
    }

    /// Node for an absolute path, if one exists.
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(Self::ROOT, |id, c| self.child(id, c))
    }

    /// Rebuild the absolute path of a node from its parent links.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = &self.nodes[n];
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            cur = node.parent;
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    pub fn rule_count(&self) -> usize {
        self.nodes.iter().map(|n| n.rules.len()).sum()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.nodes.iter().flat_map(|n| n.rules.iter())
    }

    /// Shallowest nodes carrying a selection or equals rule; the disk walk
    /// starts from these.
    pub fn roots(&self) -> Vec<String> {
        let mut roots = Vec::new();
        let mut stack = vec![Self::ROOT];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.selects() {
                roots.push(self.path_of(id));
                continue;
            }
            stack.extend(node.children.values().rev());
        }
        roots.sort();
        roots
    }

    /// Indented dump of the tree, used for `config-check` and rule logging.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_node(Self::ROOT, 0, &mut out);
        out
    }

    fn render_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let node = &self.nodes[id];
        let indent = "  ".repeat(depth);
        let _ = writeln!(out, "{indent}{}", self.path_of(id));
        for rule in &node.rules {
            let _ = writeln!(out, "{indent}  #{} {rule}", rule.source_order);
        }
        for &child in node.children.values() {
            self.render_node(child, depth + 1, out);
        }
    }
}
