//! An action plus its resolved position in the action graph

use crate::action::Action;
use crate::target::TargetDescriptor;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Index of a [`LinkedAction`] within the slice it was linked in
pub type ActionId = usize;

/// An [`Action`] with resolved prerequisite actions
///
/// Edges are indices into the slice passed to
/// [`link`](crate::action_graph::link); they are only meaningful for that
/// slice and are recomputed by every link.
#[derive(Clone)]
pub struct LinkedAction {
    inner: Arc<Action>,

    /// Actions producing any of this action's prerequisite items
    pub prerequisite_actions: BTreeSet<ActionId>,

    /// Tags of every target that needs this action
    pub group_names: BTreeSet<String>,

    /// Targets that contributed this action
    pub targets: Vec<TargetDescriptor>,
}

impl LinkedAction {
    /// Wrap an action owned by `target`
    pub fn new(action: impl Into<Arc<Action>>, target: Option<&TargetDescriptor>) -> Self {
        let mut linked = Self {
            inner: action.into(),
            prerequisite_actions: BTreeSet::new(),
            group_names: BTreeSet::new(),
            targets: Vec::new(),
        };
        if let Some(target) = target {
            let _ = linked.group_names.insert(target.group_name());
            linked.targets.push(target.clone());
        }
        linked
    }

    /// The wrapped action
    pub fn action(&self) -> &Arc<Action> {
        &self.inner
    }

    /// Swap in a rebuilt action; edges must be re-linked afterwards
    pub fn replace_inner(&mut self, action: Action) {
        self.inner = Arc::new(action);
    }

    /// Fold another copy of the same action into this one
    pub fn absorb(&mut self, other: &LinkedAction) {
        self.group_names.extend(other.group_names.iter().cloned());
        for target in &other.targets {
            if !self.targets.contains(target) {
                self.targets.push(target.clone());
            }
        }
    }
}

impl std::ops::Deref for LinkedAction {
    type Target = Action;

    fn deref(&self) -> &Action {
        &self.inner
    }
}

impl fmt::Debug for LinkedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedAction")
            .field("action", &self.inner.description())
            .field("prerequisite_actions", &self.prerequisite_actions)
            .field("group_names", &self.group_names)
            .finish()
    }
}
