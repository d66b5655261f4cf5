//! In-memory stub registry and the selection policy.
//!
//! Among all stubs whose pattern matches a request, the one with the highest
//! [`Specificity`] wins; equal specificity goes to the most recently
//! registered stub.

use crate::config::StubDefinition;
use crate::error::Result;
use crate::matcher::{CompiledMatcher, MatchContext, Specificity};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A registered stub. Immutable once registered.
#[derive(Debug)]
pub struct Stub {
    /// Identifier from the definition, or `stub-<order>`
    pub id: String,
    /// Monotonically increasing insertion number
    pub registration_order: u64,
    /// The original definition
    pub definition: StubDefinition,
    matcher: CompiledMatcher,
}

impl Stub {
    /// Whether this stub's request pattern matches `ctx`.
    pub fn matches(&self, ctx: &MatchContext) -> bool {
        self.matcher.matches(ctx)
    }

    pub fn specificity(&self) -> Specificity {
        self.matcher.specificity()
    }
}

/// Ordered collection of stubs owned by a single server instance.
#[derive(Debug, Default)]
pub struct StubRegistry {
    stubs: RwLock<Vec<Arc<Stub>>>,
    next_order: AtomicU64,
}

impl StubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, compile and insert a stub. Returns its registration order.
    pub fn register(&self, definition: StubDefinition) -> Result<u64> {
        definition.validate()?;
        let matcher = CompiledMatcher::compile(&definition.request)?;

        let mut stubs = self.stubs.write();
        let registration_order = self.next_order.fetch_add(1, Ordering::SeqCst);
        let id = definition
            .id
            .clone()
            .unwrap_or_else(|| format!("stub-{}", registration_order));

        debug!(
            stub_id = %id,
            order = registration_order,
            specificity = ?matcher.specificity(),
            "Registered stub"
        );

        stubs.push(Arc::new(Stub {
            id,
            registration_order,
            definition,
            matcher,
        }));
        Ok(registration_order)
    }

    /// Discard every registered stub.
    pub fn reset(&self) {
        let mut stubs = self.stubs.write();
        if !stubs.is_empty() {
            debug!(discarded = stubs.len(), "Stub registry reset");
        }
        stubs.clear();
    }

    /// Pick the stub that should answer the request, if any matches.
    pub fn select(&self, ctx: &MatchContext) -> Option<Arc<Stub>> {
        let stubs = self.stubs.read();
        stubs
            .iter()
            .filter(|stub| stub.matches(ctx))
            .max_by_key(|stub| (stub.specificity(), stub.registration_order))
            .cloned()
    }

    /// Number of registered stubs.
    pub fn len(&self) -> usize {
        self.stubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.read().is_empty()
    }

    /// Snapshot of the registered stubs in registration order.
    pub fn stubs(&self) -> Vec<Arc<Stub>> {
        self.stubs.read().clone()
    }
}
