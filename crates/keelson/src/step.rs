//! Steps and the arena that links them into plans.
//!
//! A plan is built once and shared by every fiber that runs it. Steps are
//! stored in a [`StepGraph`] and refer to each other by [`StepId`], so one
//! step instance can appear in several chains without any ownership
//! questions. Steps hold no per-run state; whatever a run needs lives in its
//! [`Packet`](crate::Packet).

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::action::NextAction;
use crate::context::StepContext;
use crate::packet::Packet;

/// Handle of a step inside a [`StepGraph`]: its position in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(usize);

impl StepId {
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }

    const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step#{}", self.0)
    }
}

/// A unit of reconciliation work.
///
/// `apply` must not block: anything that waits on the outside world is
/// expressed by returning [`NextAction::Invoke`], [`NextAction::Suspend`] or
/// [`NextAction::Retry`]. A panic inside `apply` fails the whole fiber.
pub trait Step: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn apply(&self, cx: &mut StepContext<'_>) -> NextAction;
}

struct StepNode {
    step: Arc<dyn Step>,
    next: Option<StepId>,
}

/// Immutable arena of linked steps.
pub struct StepGraph {
    nodes: Vec<StepNode>,
}

impl StepGraph {
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn name(&self, id: StepId) -> Option<&str> {
        self.nodes.get(id.index()).map(|node| node.step.name())
    }

    /// Successor of `id`; `None` for leaves and unknown ids.
    #[must_use]
    pub fn next_of(&self, id: StepId) -> Option<StepId> {
        self.nodes.get(id.index()).and_then(|node| node.next)
    }

    pub(crate) fn step(&self, id: StepId) -> Option<(Arc<dyn Step>, Option<StepId>)> {
        self.nodes
            .get(id.index())
            .map(|node| (Arc::clone(&node.step), node.next))
    }
}

impl fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|node| (node.step.name(), node.next)))
            .finish()
    }
}

/// Builds a [`StepGraph`].
///
/// Successors must exist before the steps that point at them, so chains are
/// assembled back to front.
#[derive(Default)]
pub struct PlanBuilder {
    nodes: Vec<StepNode>,
}

impl PlanBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, step: impl Step, next: Option<StepId>) -> StepId {
        self.add_shared(Arc::new(step), next)
    }

    /// Adds a step instance that may also be linked elsewhere.
    pub fn add_shared(&mut self, step: Arc<dyn Step>, next: Option<StepId>) -> StepId {
        let id = StepId(self.nodes.len());
        self.nodes.push(StepNode { step, next });
        id
    }

    /// Links `steps` in order, the last one continuing to `tail`. Returns
    /// the head, or `tail` when `steps` is empty.
    pub fn chain<I>(&mut self, steps: I, tail: Option<StepId>) -> Option<StepId>
    where
        I: IntoIterator<Item = Arc<dyn Step>>,
        I::IntoIter: DoubleEndedIterator,
    {
        steps
            .into_iter()
            .rev()
            .fold(tail, |next, step| Some(self.add_shared(step, next)))
    }

    /// Adds a two-way branch.
    pub fn branch(
        &mut self,
        name: &'static str,
        predicate: fn(&Packet) -> bool,
        then: StepId,
        otherwise: Option<StepId>,
    ) -> StepId {
        self.add(Switch::new(name, otherwise).arm(predicate, then), None)
    }

    /// Finishes the graph and names its entry step.
    #[must_use]
    pub fn finish(self, entry: StepId) -> Plan {
        Plan {
            graph: Arc::new(StepGraph { nodes: self.nodes }),
            entry,
        }
    }
}

/// A shared graph plus the step every fiber of this plan starts at.
#[derive(Clone, Debug)]
pub struct Plan {
    graph: Arc<StepGraph>,
    entry: StepId,
}

impl Plan {
    /// Another entry point into the same graph.
    #[must_use]
    pub fn starting_at(&self, entry: StepId) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
            entry,
        }
    }

    #[must_use]
    pub const fn entry(&self) -> StepId {
        self.entry
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<StepGraph> {
        &self.graph
    }
}

/// Picks the first arm whose predicate holds, else `otherwise`, else done.
pub struct Switch {
    name: &'static str,
    arms: SmallVec<[(fn(&Packet) -> bool, StepId); 4]>,
    otherwise: Option<StepId>,
}

impl Switch {
    #[must_use]
    pub fn new(name: &'static str, otherwise: Option<StepId>) -> Self {
        Self {
            name,
            arms: SmallVec::new(),
            otherwise,
        }
    }

    #[must_use]
    pub fn arm(mut self, predicate: fn(&Packet) -> bool, target: StepId) -> Self {
        self.arms.push((predicate, target));
        self
    }
}

impl Step for Switch {
    fn name(&self) -> &str {
        self.name
    }

    fn apply(&self, cx: &mut StepContext<'_>) -> NextAction {
        let chosen = self
            .arms
            .iter()
            .find(|(predicate, _)| predicate(cx.packet()))
            .map(|(_, target)| *target)
            .or(self.otherwise);
        chosen.map_or(NextAction::Done, NextAction::Continue)
    }
}
