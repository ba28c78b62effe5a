//! Capability table: which methods can convert a format pair, in what order.
//!
//! ## Why a separate registry and table?
//!
//! The same method (LibreOffice, ffmpeg) serves dozens of format pairs. The
//! router keeps one [`MethodSpec`] per method and a table of `(source,
//! target) → [(method, priority)]` entries that reference it by id, so
//! changing how a method is invoked never touches the routing, and a route
//! can never point at a method that does not exist ([`RouterBuilder::build`]
//! checks).
//!
//! A built [`Router`] is immutable and shared behind an `Arc` by every
//! request in a batch. To change the table, build a new router.

use crate::config::ConversionConfig;
use crate::error::ConvertError;
use crate::format::Format;
use crate::methods::{defaults, MethodId, MethodSpec};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct RouteEntry {
    method: MethodId,
    priority: i32,
    /// Registration order, used to break priority ties.
    seq: usize,
}

/// One row of [`Router::describe`].
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub from: Format,
    pub to: Format,
    /// Methods in the order they will be tried.
    pub methods: Vec<MethodId>,
}

/// Immutable capability table plus method registry.
#[derive(Debug, Clone)]
pub struct Router {
    methods: BTreeMap<MethodId, Arc<MethodSpec>>,
    routes: BTreeMap<(Format, Format), Vec<RouteEntry>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Router for the tools installed on this machine.
    ///
    /// External tools are looked up in `config.tool_paths` first, then on
    /// `PATH`; methods whose tool is missing are not registered.
    pub fn discover(config: &ConversionConfig) -> Result<Router, ConvertError> {
        let tools = defaults::ToolSet::discover(&config.tool_paths);
        defaults::default_router(&tools)
    }

    /// Ordered fallback chain for `from → to`.
    ///
    /// Descending priority, ties in registration order, no duplicates.
    ///
    /// # Errors
    /// [`ConvertError::UnsupportedConversion`] when the formats are equal or
    /// no method is registered for the pair.
    pub fn route(&self, from: Format, to: Format) -> Result<Vec<Arc<MethodSpec>>, ConvertError> {
        if from == to {
            return Err(ConvertError::UnsupportedConversion {
                from,
                to,
                reason: "source and target formats are the same".into(),
            });
        }

        let chain: Vec<Arc<MethodSpec>> = self
            .routes
            .get(&(from, to))
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| self.methods.get(&e.method).cloned())
                    .collect()
            })
            .unwrap_or_default();

        if chain.is_empty() {
            return Err(ConvertError::UnsupportedConversion {
                from,
                to,
                reason: "no conversion method is registered for this pair".into(),
            });
        }

        debug!(
            "Route {} → {}: {:?}",
            from,
            to,
            chain.iter().map(|m| m.id.as_str()).collect::<Vec<_>>()
        );
        Ok(chain)
    }

    /// Targets reachable from `from`, sorted.
    pub fn targets_for(&self, from: Format) -> Vec<Format> {
        self.routes
            .iter()
            .filter(|((f, _), entries)| *f == from && !entries.is_empty())
            .map(|((_, t), _)| *t)
            .collect()
    }

    /// Every route with its ordered method list.
    pub fn describe(&self) -> Vec<RouteInfo> {
        self.routes
            .iter()
            .map(|(&(from, to), entries)| RouteInfo {
                from,
                to,
                methods: entries.iter().map(|e| e.method.clone()).collect(),
            })
            .collect()
    }

    pub fn method(&self, id: &str) -> Option<&Arc<MethodSpec>> {
        self.methods.get(&MethodId::from(id))
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodSpec>> {
        self.methods.values()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

/// Builder for [`Router`].
#[derive(Debug, Default)]
pub struct RouterBuilder {
    methods: BTreeMap<MethodId, Arc<MethodSpec>>,
    pending: Vec<(Format, Format, MethodId, Option<i32>)>,
}

impl RouterBuilder {
    /// Register a method. A later registration with the same id replaces it.
    pub fn method(mut self, spec: MethodSpec) -> Self {
        self.methods.insert(spec.id.clone(), Arc::new(spec));
        self
    }

    /// Route `from → to` through `method` at the method's default priority.
    pub fn route(mut self, from: Format, to: Format, method: impl Into<MethodId>) -> Self {
        self.pending.push((from, to, method.into(), None));
        self
    }

    /// Route `from → to` through `method` at an explicit priority.
    pub fn route_with_priority(
        mut self,
        from: Format,
        to: Format,
        method: impl Into<MethodId>,
        priority: i32,
    ) -> Self {
        self.pending.push((from, to, method.into(), Some(priority)));
        self
    }

    /// Route `from → to` through `methods`, tried in the given order.
    ///
    /// Assigns priorities 10·n, 10·(n−1), …, 10.
    pub fn chain(mut self, from: Format, to: Format, methods: &[&str]) -> Self {
        let n = methods.len() as i32;
        for (i, id) in methods.iter().enumerate() {
            self.pending
                .push((from, to, MethodId::from(*id), Some((n - i as i32) * 10)));
        }
        self
    }

    /// Build the router, validating that every route names a registered
    /// method and joins two different formats.
    pub fn build(self) -> Result<Router, ConvertError> {
        let mut routes: BTreeMap<(Format, Format), Vec<RouteEntry>> = BTreeMap::new();

        for (seq, (from, to, method, priority)) in self.pending.into_iter().enumerate() {
            if from == to {
                return Err(ConvertError::InvalidConfig(format!(
                    "route {from} → {to} converts a format to itself"
                )));
            }
            let Some(spec) = self.methods.get(&method) else {
                return Err(ConvertError::InvalidConfig(format!(
                    "route {from} → {to} references unknown method '{method}'"
                )));
            };
            routes.entry((from, to)).or_default().push(RouteEntry {
                priority: priority.unwrap_or(spec.priority),
                method,
                seq,
            });
        }

        for entries in routes.values_mut() {
            entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            let mut seen = std::collections::HashSet::new();
            entries.retain(|e| seen.insert(e.method.clone()));
        }

        Ok(Router {
            methods: self.methods,
            routes,
        })
    }
}
