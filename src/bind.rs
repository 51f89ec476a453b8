// src/bind.rs

//! The binder: abstract entries to literal entries
//!
//! Each unbound entry is offered to every generator; the candidates
//! compete under a deterministic ranking and exactly one handler is
//! invoked. Failures never abort the build: an unbindable or
//! failed entry becomes an in-place `<error>` entry and binding moves on.
//!
//! Ranking, most significant first:
//! 1. within one plugin, an exact name match beats a regex match,
//!    regardless of priority
//! 2. higher priority
//! 3. group-scoped beats unscoped
//! 4. a group scope that is a proper superset of the other's wins
//! 5. lexicographically greater sorted group set wins
//! 6. later registration wins (and an equal-priority conflict is logged
//!    once per entry)

use crate::core::Deadline;
use crate::error::Result;
use crate::metadata::ClientMetadata;
use crate::plugin::{EntryCandidate, PluginRegistry};
use crate::xml::Element;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{debug, warn};

struct Ranked {
    plugin_idx: usize,
    candidate: EntryCandidate,
}

/// Ranking without the final registration tie-break; `Equal` here means a
/// genuine conflict between sources
fn rank(a: &Ranked, b: &Ranked) -> Ordering {
    if a.plugin_idx == b.plugin_idx && a.candidate.exact != b.candidate.exact {
        return a.candidate.exact.cmp(&b.candidate.exact);
    }
    a.candidate
        .priority
        .cmp(&b.candidate.priority)
        .then_with(|| {
            let a_scoped = !a.candidate.groups.is_empty();
            let b_scoped = !b.candidate.groups.is_empty();
            a_scoped.cmp(&b_scoped)
        })
        .then_with(|| {
            let distinct = a.candidate.groups != b.candidate.groups;
            let a_superset = distinct && a.candidate.groups.is_superset(&b.candidate.groups);
            let b_superset = distinct && b.candidate.groups.is_superset(&a.candidate.groups);
            a_superset.cmp(&b_superset)
        })
        .then_with(|| a.candidate.groups.cmp(&b.candidate.groups))
}

/// `Greater` means `a` is preferred over `b`
fn prefer(a: &Ranked, b: &Ranked) -> Ordering {
    rank(a, b).then_with(|| {
        (a.plugin_idx, a.candidate.registration).cmp(&(b.plugin_idx, b.candidate.registration))
    })
}

/// Binds assembled structures against the generator registry
pub struct Binder {
    /// Equal-priority conflicts already reported, keyed by (kind, name)
    conflicts_logged: Mutex<HashSet<(String, String)>>,
}

impl Default for Binder {
    fn default() -> Self {
        Self::new()
    }
}

impl Binder {
    pub fn new() -> Self {
        Self {
            conflicts_logged: Mutex::new(HashSet::new()),
        }
    }

    /// Bind every entry of every structure, then run the goal validators.
    ///
    /// Single-entry failures are contained as `<error>` entries; only a
    /// deadline expiry or a goal-validator rejection fails the build.
    pub fn bind_structures(
        &self,
        registry: &PluginRegistry,
        metadata: &ClientMetadata,
        structures: Vec<Element>,
        deadline: &Deadline,
    ) -> Result<Vec<Element>> {
        let mut bundles = Vec::with_capacity(structures.len());
        for structure in structures {
            let mut bound = Element::new(structure.name.clone());
            for (key, value) in structure.attrs() {
                bound.set_attr(key, value);
            }
            for entry in &structure.children {
                deadline.check()?;
                bound.children.push(self.bind_entry(registry, metadata, entry));
            }
            bundles.push(bound);
        }

        for validator in &registry.goal_validators {
            validator.validate_goals(metadata, &mut bundles)?;
        }

        Ok(bundles)
    }

    fn bind_entry(
        &self,
        registry: &PluginRegistry,
        metadata: &ClientMetadata,
        entry: &Element,
    ) -> Element {
        // Assembly-stage errors pass through untouched
        if entry.name == "error" {
            return entry.clone();
        }

        // Bound entries carry their own literal attributes
        if let Some(kind) = entry.name.strip_prefix("Bound") {
            if !kind.is_empty() {
                let mut literal = entry.clone();
                literal.name = kind.to_string();
                return literal;
            }
        }

        let kind = entry.name.as_str();
        let Some(name) = entry.attr("name") else {
            return error_entry(kind, "", "entry has no name");
        };

        let mut candidates: Vec<Ranked> = Vec::new();
        for (plugin_idx, generator) in registry.generators.iter().enumerate() {
            for candidate in generator.candidates(kind, name, metadata) {
                candidates.push(Ranked {
                    plugin_idx,
                    candidate,
                });
            }
        }

        let Some(winner) = candidates.iter().max_by(|a, b| prefer(a, b)) else {
            debug!(kind, name, client = metadata.hostname.as_str(), "no matching rule");
            return error_entry(kind, name, "no matching rule");
        };

        let rivals: Vec<&Ranked> = candidates
            .iter()
            .filter(|c| !std::ptr::eq(*c, winner) && rank(c, winner) == Ordering::Equal)
            .collect();
        if !rivals.is_empty() {
            let key = (kind.to_string(), name.to_string());
            let mut logged = self.conflicts_logged.lock().unwrap();
            if logged.insert(key) {
                let mut origins: Vec<&str> = std::iter::once(winner.candidate.origin.as_str())
                    .chain(rivals.iter().map(|r| r.candidate.origin.as_str()))
                    .collect();
                origins.sort_unstable();
                warn!(
                    kind,
                    name,
                    sources = origins.join(", "),
                    "conflicting rule sources with equal priority; later registration wins"
                );
            }
        }

        let generator = &registry.generators[winner.plugin_idx];
        match generator.bind_entry(winner.candidate.handle, entry, metadata) {
            Ok(literal) => literal,
            Err(err) => {
                warn!(kind, name, plugin = generator.name(), error = %err, "bind failed");
                error_entry(kind, name, &err.to_string())
            }
        }
    }
}

fn error_entry(kind: &str, name: &str, failure: &str) -> Element {
    Element::new("error")
        .with_attr("kind", kind)
        .with_attr("name", name)
        .with_attr("failure", failure)
}
