//! Generic bottom-up walks over descriptor trees. Children are fully
//! processed before the parent's own step. The Resolver threads its
//! entity-type context through explicit `(node, context)` recursion in
//! `spec::resolve`; the transforms here serve passes that do not need
//! typing context (required-flag relaxation, inclusion projection).

use crate::spec::resolved::FieldDescriptor;

/// Bottom-up transform with pruning: the visitor receives each node
/// together with its surviving children and returns the replacement
/// node, or `None` to prune the branch.
pub fn filter_map_tree<F>(desc: &FieldDescriptor, f: &mut F) -> Option<FieldDescriptor>
where
    F: FnMut(&FieldDescriptor, Vec<FieldDescriptor>) -> Option<FieldDescriptor>,
{
    let children: Vec<FieldDescriptor> = desc
        .children
        .iter()
        .filter_map(|c| filter_map_tree(c, f))
        .collect();
    f(desc, children)
}

/// Bottom-up map: like [`filter_map_tree`] but total.
pub fn map_tree<F>(desc: &FieldDescriptor, f: &mut F) -> FieldDescriptor
where
    F: FnMut(FieldDescriptor) -> FieldDescriptor,
{
    let mut node = desc.clone();
    node.children = desc.children.iter().map(|c| map_tree(c, f)).collect();
    node.branches = desc
        .branches
        .iter()
        .map(|(k, d)| (k.clone(), map_tree(d, f)))
        .collect();
    node.create_form = desc
        .create_form
        .as_deref()
        .map(|d| Box::new(map_tree(d, f)));
    f(node)
}
