//! Call-context propagation.
//!
//! A `CallContext` is passed explicitly through every invocation. Each
//! active invocation pushes a frame holding the context-argument values it
//! resolved (e.g. `training`), so nested invocations inherit them without
//! the caller threading them by hand. `ContextDefaults` holds the sticky
//! process-level defaults (the "learning phase") and the set of argument
//! names that are treated as context arguments at all.

use crate::args::Arg;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const TRAINING: &str = "training";

#[derive(Debug)]
pub struct ContextDefaults {
    sticky: RwLock<BTreeMap<String, Arg>>,
    known: RwLock<BTreeSet<String>>,
}

impl ContextDefaults {
    pub fn new() -> Self {
        let mut known = BTreeSet::new();
        known.insert(TRAINING.to_string());
        Self {
            sticky: RwLock::new(BTreeMap::new()),
            known: RwLock::new(known),
        }
    }

    /// Sets a sticky default; the name becomes a known context argument.
    pub fn set(&self, name: &str, value: Arg) {
        self.register(name);
        self.sticky.write().insert(name.to_string(), value);
    }

    pub fn clear(&self, name: &str) {
        self.sticky.write().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arg> {
        self.sticky.read().get(name).cloned()
    }

    pub fn register(&self, name: &str) {
        self.known.write().insert(name.to_string());
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.known.read().contains(name)
    }

    pub fn known(&self) -> Vec<String> {
        self.known.read().iter().cloned().collect()
    }
}

impl Default for ContextDefaults {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Frame {
    unit: String,
    resolved: BTreeMap<String, Arg>,
    tracing: bool,
}

/// Stack of active invocations for one thread of execution.
#[derive(Debug, Clone)]
pub struct CallContext {
    defaults: Arc<ContextDefaults>,
    frames: Vec<Frame>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::with_defaults(Arc::new(ContextDefaults::new()))
    }

    pub fn with_defaults(defaults: Arc<ContextDefaults>) -> Self {
        Self {
            defaults,
            frames: Vec::new(),
        }
    }

    pub fn defaults(&self) -> &Arc<ContextDefaults> {
        &self.defaults
    }

    /// True while some invocation is active on this context.
    pub fn in_call(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// True while the innermost active invocation is tracing a graph-mode call.
    pub fn in_trace(&self) -> bool {
        self.frames.last().is_some_and(|f| f.tracing)
    }

    pub fn current_unit(&self) -> Option<&str> {
        self.frames.last().map(|f| f.unit.as_str())
    }

    /// Nearest non-null value an enclosing invocation propagated for `name`.
    pub fn lookup(&self, name: &str) -> Option<&Arg> {
        self.frames
            .iter()
            .rev()
            .filter_map(|f| f.resolved.get(name))
            .find(|a| !a.is_null())
    }

    /// Names propagated by the innermost invocation.
    pub fn propagated_names(&self) -> Vec<String> {
        self.frames
            .last()
            .map(|f| f.resolved.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn enter(&mut self, unit: &str, resolved: BTreeMap<String, Arg>, tracing: bool) {
        self.frames.push(Frame {
            unit: unit.to_string(),
            resolved,
            tracing,
        });
    }

    pub(crate) fn exit(&mut self) {
        self.frames.pop();
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_skips_null_frames() {
        let mut ctx = CallContext::new();
        let mut outer = BTreeMap::new();
        outer.insert(TRAINING.to_string(), Arg::Bool(true));
        ctx.enter("outer", outer, false);
        let mut inner = BTreeMap::new();
        inner.insert(TRAINING.to_string(), Arg::Null);
        ctx.enter("inner", inner, true);

        assert!(ctx.in_call());
        assert!(ctx.in_trace());
        assert_eq!(ctx.lookup(TRAINING).and_then(Arg::as_bool), Some(true));

        ctx.exit();
        assert!(!ctx.in_trace());
        ctx.exit();
        assert!(!ctx.in_call());
        assert!(ctx.lookup(TRAINING).is_none());
    }

    #[test]
    fn test_independent_defaults() {
        let a = Arc::new(ContextDefaults::new());
        let b = Arc::new(ContextDefaults::new());
        a.set(TRAINING, Arg::Bool(true));
        assert!(a.get(TRAINING).is_some());
        assert!(b.get(TRAINING).is_none());
        b.set("phase", Arg::Int(2));
        assert!(b.is_known("phase"));
        assert!(!a.is_known("phase"));
        a.clear(TRAINING);
        assert!(a.get(TRAINING).is_none());
    }
}
