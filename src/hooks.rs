use dyn_clone::{clone_trait_object, DynClone};

use crate::node::Node;

/// Per-translation callbacks. Observers are passed in explicitly through
/// [`TranslatorConfig`](crate::translator::TranslatorConfig); nothing is
/// toggled globally.
#[allow(unused)]
pub trait NodeObserver: DynClone {
    fn scheduled(&mut self, root: &Node, steps: usize) {}

    fn translated(&mut self, node: &Node) {}
}

clone_trait_object!(NodeObserver);

/// Emits `trace` events for the schedule and for every translated node.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver;

impl NodeObserver for TracingObserver {
    fn scheduled(&mut self, root: &Node, steps: usize) {
        tracing::trace!(root = %root.id(), hash = root.hash(), steps, "translation scheduled");
    }

    fn translated(&mut self, node: &Node) {
        tracing::trace!(
            id = %node.id(),
            hash = node.hash(),
            kind = %node.kind(),
            children = ?node.children(),
            "translated node"
        );
    }
}
