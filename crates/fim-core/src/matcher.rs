//! Resolves the effective rule and attribute mask for a path by walking the
//! rule tree alongside the path's components.

use crate::attr::AttributeMask;
use crate::file_type::FileType;
use crate::rules::{Rule, RuleKind};
use crate::tree::RuleTree;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Last deciding rule was a selection rule.
    Selected,
    /// Last deciding rule was an equals rule.
    Equal,
    /// A negative rule matched the path or one of its ancestors.
    Excluded,
    /// No rule matched anywhere along the path.
    Unmatched,
}

#[derive(Debug, Clone)]
pub struct Resolution<'t> {
    pub outcome: Outcome,
    /// Accumulated mask; empty unless the path is included.
    pub mask: AttributeMask,
    /// Rule that decided the outcome.
    pub rule: Option<&'t Rule>,
    /// False when some rule matched the path but was skipped because of its
    /// file-type restriction.
    pub restriction_ok: bool,
    /// Whether anything beneath this path can still be selected.
    pub descend: bool,
}

impl Resolution<'_> {
    pub fn is_included(&self) -> bool {
        matches!(self.outcome, Outcome::Selected | Outcome::Equal)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Matcher<'t> {
    tree: &'t RuleTree,
}

impl<'t> Matcher<'t> {
    pub fn new(tree: &'t RuleTree) -> Self {
        Self { tree }
    }

    /// Resolve `path` (absolute, `/`-separated) of the given type.
    ///
    /// At each visited node carrying a negative rule, the path's ancestors at
    /// or below the node are first evaluated as directories with the node's
    /// rules: an ancestor whose last matching rule is negative excludes the
    /// path outright. The node's rules are then applied to the path
    /// itself in source order: selections OR their mask into the
    /// accumulated mask, equals rules replace it, negatives mark the node as
    /// excluding. A later matching rule at the same node overrides an
    /// earlier exclusion.
    pub fn resolve(&self, path: &str, file_type: FileType) -> Resolution<'t> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let ancestors = ancestor_paths(path);

        let mut mask = AttributeMask::EMPTY;
        let mut outcome = Outcome::Unmatched;
        let mut deciding: Option<&'t Rule> = None;
        let mut restriction_ok = true;
        let mut descend = false;

        let mut depth = 0;
        let mut node = Some(RuleTree::ROOT);
        while let Some(id) = node {
            let current = self.tree.node(id);

            if current.rules().iter().any(|r| r.kind == RuleKind::Negative) {
                for ancestor in &ancestors[depth.min(ancestors.len())..] {
                    if let Some(rule) = excluding_rule(current.rules(), ancestor) {
                        trace!(path, ancestor, rule = %rule, "ancestor excluded");
                        return excluded(rule);
                    }
                }
            }

            let mut node_excluded: Option<&'t Rule> = None;
            for rule in current.rules() {
                if !rule.pattern.matches(path) {
                    continue;
                }
                if !rule.restriction.allows(file_type) {
                    restriction_ok = false;
                    continue;
                }
                match rule.kind {
                    RuleKind::Negative => node_excluded = Some(rule),
                    RuleKind::Selection => {
                        node_excluded = None;
                        mask |= rule.mask;
                        outcome = Outcome::Selected;
                        deciding = Some(rule);
                    }
                    RuleKind::Equals => {
                        node_excluded = None;
                        mask = rule.mask;
                        outcome = Outcome::Equal;
                        deciding = Some(rule);
                    }
                }
            }
            if let Some(rule) = node_excluded {
                trace!(path, rule = %rule, "excluded");
                let mut res = excluded(rule);
                res.restriction_ok = restriction_ok;
                return res;
            }

            if current.reaches_below() {
                descend = true;
            }
            if depth == components.len() && current.has_children() {
                descend = true;
            }

            node = components.get(depth).and_then(|c| self.tree.child(id, c));
            depth += 1;
        }

        if outcome == Outcome::Unmatched {
            mask = AttributeMask::EMPTY;
        }
        Resolution {
            outcome,
            mask,
            rule: deciding,
            restriction_ok,
            descend,
        }
    }
}

fn excluded(rule: &Rule) -> Resolution<'_> {
    Resolution {
        outcome: Outcome::Excluded,
        mask: AttributeMask::EMPTY,
        rule: Some(rule),
        restriction_ok: true,
        descend: false,
    }
}

/// Negative rule that has the last word on directory `path` among one
/// node's rules, if any. A later matching selection or equals rule
/// re-includes the directory.
fn excluding_rule<'t>(rules: &'t [Rule], path: &str) -> Option<&'t Rule> {
    rules
        .iter()
        .rev()
        .find(|r| r.restriction.allows(FileType::Directory) && r.pattern.matches(path))
        .filter(|r| r.kind == RuleKind::Negative)
}

/// Strict ancestors of a normalised absolute path, shallowest first: `/`,
/// `/a`, `/a/b`, ... The ancestor at index `d` is the path of depth `d`.
fn ancestor_paths(path: &str) -> Vec<&str> {
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        return Vec::new();
    }
    let mut out = vec!["/"];
    out.extend(path.match_indices('/').skip(1).map(|(i, _)| &path[..i]));
    out
}
