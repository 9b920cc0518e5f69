//! Per-deployment projection of a resolved tree: leaves are kept or
//! dropped by an inclusion map, with default-required leaves always
//! surviving. Composites live only as long as they keep children.

use crate::spec::resolved::{FieldDescriptor, FieldKind};
use crate::walk;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Deployment-side switch for one leaf key.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct InclusionEntry {
    pub available: bool,
    pub required: bool,
}

pub type InclusionMap = HashMap<String, InclusionEntry>;

/// One tunable leaf, as offered to deployment configuration.
#[derive(Clone, Debug, Serialize)]
pub struct InclusionOption {
    pub value: String,
    pub label: Option<String>,
    pub required_by_default: bool,
}

fn is_tunable(desc: &FieldDescriptor) -> bool {
    !desc.is_composite() && desc.kind != FieldKind::Hidden
}

/// Prune a resolved tree to the leaves a deployment makes available.
/// Default-required leaves are kept and stay required regardless of the
/// map; everything else follows its entry. Returns `None` when nothing
/// survives.
pub fn project(desc: &FieldDescriptor, included: &InclusionMap) -> Option<FieldDescriptor> {
    walk::filter_map_tree(desc, &mut |node, children| {
        if node.is_composite() {
            if children.is_empty() {
                return None;
            }
            let mut kept = node.clone();
            kept.children = children;
            return Some(kept);
        }
        if !is_tunable(node) {
            return Some(node.clone());
        }
        let key = node.key.as_deref()?;
        if node.required {
            return Some(node.clone());
        }
        let entry = included.get(key).copied().unwrap_or_default();
        if !entry.available {
            return None;
        }
        let mut kept = node.clone();
        kept.required = entry.required;
        Some(kept)
    })
}

/// All tunable leaves of a tree, in schema order, plus the keys that are
/// required by default and therefore not optional.
pub fn inclusion_options(desc: &FieldDescriptor) -> (Vec<InclusionOption>, Vec<String>) {
    let mut options = Vec::new();
    let mut forced = Vec::new();
    collect(desc, &mut options, &mut forced, &mut HashSet::new());
    (options, forced)
}

fn collect(
    desc: &FieldDescriptor,
    options: &mut Vec<InclusionOption>,
    forced: &mut Vec<String>,
    seen: &mut HashSet<String>,
) {
    if desc.is_composite() || !desc.children.is_empty() {
        for child in &desc.children {
            collect(child, options, forced, seen);
        }
        return;
    }
    if !is_tunable(desc) {
        return;
    }
    let Some(key) = &desc.key else { return };
    if !seen.insert(key.clone()) {
        return;
    }
    options.push(InclusionOption {
        value: key.clone(),
        label: desc.label.clone(),
        required_by_default: desc.required,
    });
    if desc.required {
        forced.push(key.clone());
    }
}
