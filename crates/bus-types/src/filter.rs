//! # Event Filters
//!
//! Pure predicates over events and the all-must-match chain that composes
//! them per subscription.

use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::event::{Event, EventId};
use crate::scope::Scope;

/// A side-effect free predicate over events.
pub trait EventFilter: Send + Sync + fmt::Debug {
    /// Whether the event passes this filter.
    fn matches(&self, event: &Event) -> bool;

    /// Scope this filter restricts to, if any.
    ///
    /// In-connectors use this to prune traffic before deserialisation.
    fn scope(&self) -> Option<&Scope> {
        None
    }
}

/// Whether a filter is being added to or removed from a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Add,
    Remove,
}

/// Accepts events whose scope is `scope` or one of its sub-scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeFilter {
    scope: Scope,
}

impl ScopeFilter {
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }
}

impl EventFilter for ScopeFilter {
    fn matches(&self, event: &Event) -> bool {
        self.scope.contains(&event.scope)
    }

    fn scope(&self) -> Option<&Scope> {
        Some(&self.scope)
    }
}

/// Accepts events with the given method, or without it when inverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodFilter {
    method: String,
    invert: bool,
}

impl MethodFilter {
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            invert: false,
        }
    }

    /// Accept everything except `method`.
    #[must_use]
    pub fn not(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            invert: true,
        }
    }
}

impl EventFilter for MethodFilter {
    fn matches(&self, event: &Event) -> bool {
        event.has_method(&self.method) != self.invert
    }
}

/// Accepts events sent by a given participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginFilter {
    origin: Uuid,
    invert: bool,
}

impl OriginFilter {
    #[must_use]
    pub fn new(origin: Uuid) -> Self {
        Self {
            origin,
            invert: false,
        }
    }

    #[must_use]
    pub fn not(origin: Uuid) -> Self {
        Self {
            origin,
            invert: true,
        }
    }
}

impl EventFilter for OriginFilter {
    fn matches(&self, event: &Event) -> bool {
        (event.sender_id() == Some(self.origin)) != self.invert
    }
}

/// Accepts events whose cause vector contains a given id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CauseFilter {
    cause: EventId,
    invert: bool,
}

impl CauseFilter {
    #[must_use]
    pub fn new(cause: EventId) -> Self {
        Self {
            cause,
            invert: false,
        }
    }

    #[must_use]
    pub fn not(cause: EventId) -> Self {
        Self {
            cause,
            invert: true,
        }
    }
}

impl EventFilter for CauseFilter {
    fn matches(&self, event: &Event) -> bool {
        event.is_caused_by(&self.cause) != self.invert
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrueFilter;

impl EventFilter for TrueFilter {
    fn matches(&self, _event: &Event) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FalseFilter;

impl EventFilter for FalseFilter {
    fn matches(&self, _event: &Event) -> bool {
        false
    }
}

/// Escape hatch: an arbitrary boolean predicate over the event.
#[derive(Clone)]
pub struct PredicateFilter {
    name: String,
    predicate: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl PredicateFilter {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for PredicateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateFilter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl EventFilter for PredicateFilter {
    fn matches(&self, event: &Event) -> bool {
        (self.predicate)(event)
    }
}

/// Conjunction of filters. An empty chain accepts everything.
///
/// Evaluation stops at the first filter that rejects the event.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn EventFilter>>,
}

impl FilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`FilterChain::add`].
    #[must_use]
    pub fn with<F: EventFilter + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Append a filter.
    pub fn add(&mut self, filter: Arc<dyn EventFilter>) {
        self.filters.push(filter);
    }

    /// Remove a previously added filter by identity.
    ///
    /// Returns false if the filter was not part of the chain.
    pub fn remove(&mut self, filter: &Arc<dyn EventFilter>) -> bool {
        let before = self.filters.len();
        self.filters.retain(|f| !Arc::ptr_eq(f, filter));
        before != self.filters.len()
    }

    /// Apply an add or remove notification.
    pub fn apply(&mut self, filter: Arc<dyn EventFilter>, action: FilterAction) {
        match action {
            FilterAction::Add => self.add(filter),
            FilterAction::Remove => {
                self.remove(&filter);
            }
        }
    }

    /// Whether every filter accepts the event.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().all(|f| f.matches(event))
    }

    #[must_use]
    pub fn filters(&self) -> &[Arc<dyn EventFilter>] {
        &self.filters
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl FromIterator<Arc<dyn EventFilter>> for FilterChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn EventFilter>>>(iter: I) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}
