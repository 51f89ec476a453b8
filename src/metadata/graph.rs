// src/metadata/graph.rs

//! Group graph construction and expansion
//!
//! Parses the `<Groups>` document into an arena of group definitions plus a
//! flat list of conditional nodes (the `<Group>`/`<Client>` containers, with
//! their conjunction of enclosing conditions precomputed), then expands a
//! seed set into the full membership for one client.
//!
//! Expansion is a worklist over the arena indices. Provenance edges are
//! recorded per firing so that negation can remove groups reached
//! exclusively through a negated group while keeping groups reached through
//! independent chains. Category exclusivity is enforced once, after all
//! sources merge, with a deterministic tie-break.

use crate::error::{Error, Result};
use crate::xml::Element;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::warn;

/// A group assertion or negation as written in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub name: String,
    pub negate: bool,
}

impl GroupRef {
    pub fn assert(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            negate: false,
        }
    }

    pub fn negate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            negate: true,
        }
    }

    fn from_element(elem: &Element) -> Option<Self> {
        Some(Self {
            name: elem.attr("name")?.to_string(),
            negate: elem.bool_attr("negate"),
        })
    }
}

/// Declared properties of a group
#[derive(Debug, Clone, Default)]
pub struct GroupDef {
    pub name: String,
    pub profile: bool,
    pub public: bool,
    pub default: bool,
    pub category: Option<String>,
}

/// A single condition on a conditional node
#[derive(Debug, Clone)]
enum Condition {
    Group { name: String, negate: bool },
    Client { name: String, negate: bool },
}

impl Condition {
    fn holds(&self, client: &str, active: &HashSet<String>) -> bool {
        match self {
            Condition::Group { name, negate } => *negate != active.contains(name),
            Condition::Client { name, negate } => *negate != (name == client),
        }
    }
}

/// A conditional container flattened to its conjunction of conditions
#[derive(Debug, Clone)]
struct CondNode {
    conditions: Vec<Condition>,
    groups: Vec<GroupRef>,
    bundles: Vec<String>,
}

impl CondNode {
    /// Positive group conditions: the provenance sources of this node
    fn sources(&self) -> BTreeSet<String> {
        self.conditions
            .iter()
            .filter_map(|c| match c {
                Condition::Group {
                    name,
                    negate: false,
                } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Result of expanding a seed set for one client
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub groups: BTreeSet<String>,
    pub categories: BTreeMap<String, String>,
    pub bundles: Vec<String>,
    pub warnings: Vec<String>,
}

/// Parsed group graph: definitions in an arena, conditionals flattened
#[derive(Debug, Default)]
pub struct GroupGraph {
    arena: Vec<GroupDef>,
    index: HashMap<String, usize>,
    nodes: Vec<CondNode>,
    /// Client names mentioned as top-level conditionals (existence-implying
    /// in file-based mode)
    declared_clients: Vec<String>,
}

impl GroupGraph {
    /// Build the graph from a `<Groups>` document
    pub fn from_document(doc: &Element) -> Result<Self> {
        if doc.name != "Groups" {
            return Err(Error::MetadataConsistency(format!(
                "expected <Groups> document, found <{}>",
                doc.name
            )));
        }

        let mut graph = GroupGraph::default();
        for child in &doc.children {
            match child.name.as_str() {
                "Group" => graph.parse_group(child, &[])?,
                "Client" => graph.parse_client(child, &[])?,
                other => {
                    warn!(tag = other, "ignoring unknown element in groups document");
                }
            }
        }

        graph.validate();
        Ok(graph)
    }

    fn define(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.arena.len();
        self.arena.push(GroupDef {
            name: name.to_string(),
            ..Default::default()
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn parse_group(&mut self, elem: &Element, enclosing: &[Condition]) -> Result<()> {
        let name = elem
            .attr("name")
            .ok_or_else(|| Error::MetadataConsistency("Group element without name".to_string()))?
            .to_string();
        let negate = elem.bool_attr("negate");

        // Attributes define the group wherever they appear
        if !negate {
            let idx = self.define(&name);
            let def = &mut self.arena[idx];
            def.profile |= elem.bool_attr("profile");
            def.public |= elem.bool_attr("public");
            def.default |= elem.bool_attr("default");
            if let Some(category) = elem.attr("category") {
                def.category = Some(category.to_string());
            }
        }

        // Childless groups inside conditionals are collected as assertions
        // by collect_node; a childless top-level group is a bare definition
        if elem.children.is_empty() {
            return Ok(());
        }

        let mut conditions = enclosing.to_vec();
        conditions.push(Condition::Group {
            name: name.clone(),
            negate,
        });
        self.collect_node(elem, &conditions)
    }

    fn parse_client(&mut self, elem: &Element, enclosing: &[Condition]) -> Result<()> {
        let name = elem
            .attr("name")
            .ok_or_else(|| Error::MetadataConsistency("Client element without name".to_string()))?
            .to_string();
        let negate = elem.bool_attr("negate");

        if enclosing.is_empty() && !negate {
            self.declared_clients.push(name.clone());
        }

        let mut conditions = enclosing.to_vec();
        conditions.push(Condition::Client { name, negate });
        self.collect_node(elem, &conditions)
    }

    /// Collect the direct assertions of a conditional container and recurse
    /// into nested containers
    fn collect_node(&mut self, elem: &Element, conditions: &[Condition]) -> Result<()> {
        let mut node = CondNode {
            conditions: conditions.to_vec(),
            groups: Vec::new(),
            bundles: Vec::new(),
        };

        for child in &elem.children {
            match child.name.as_str() {
                "Bundle" => {
                    if let Some(bundle) = child.attr("name") {
                        node.bundles.push(bundle.to_string());
                    }
                }
                "Group" if child.children.is_empty() => {
                    if let Some(group_ref) = GroupRef::from_element(child) {
                        if !group_ref.negate {
                            self.define(&group_ref.name);
                        }
                        node.groups.push(group_ref);
                    }
                }
                "Group" => self.parse_group(child, conditions)?,
                "Client" => self.parse_client(child, conditions)?,
                other => {
                    warn!(tag = other, "ignoring unknown element in group container");
                }
            }
        }

        if !node.groups.is_empty() || !node.bundles.is_empty() {
            self.nodes.push(node);
        }
        Ok(())
    }

    fn validate(&mut self) {
        for def in &mut self.arena {
            if def.default && !def.profile {
                warn!(
                    group = def.name.as_str(),
                    "default group is not marked profile; treating it as one"
                );
                def.profile = true;
            }
        }
    }

    pub fn group(&self, name: &str) -> Option<&GroupDef> {
        self.index.get(name).map(|&idx| &self.arena[idx])
    }

    /// The default profile group, if one is declared
    pub fn default_profile(&self) -> Option<&str> {
        self.arena
            .iter()
            .find(|def| def.default)
            .map(|def| def.name.as_str())
    }

    /// Whether a group may be asserted as a profile by an unprivileged client
    pub fn is_public(&self, name: &str) -> bool {
        self.group(name).map(|def| def.public).unwrap_or(false)
    }

    pub fn is_profile(&self, name: &str) -> bool {
        self.group(name).map(|def| def.profile).unwrap_or(false)
    }

    /// Client names whose existence is implied by the groups document
    pub fn declared_clients(&self) -> &[String] {
        &self.declared_clients
    }

    /// Expand a seed set into the full membership for `client`.
    ///
    /// Seeds may carry negations; those are folded into the negation pass
    /// together with negations asserted by fired conditionals.
    pub fn expand(&self, client: &str, seeds: &[GroupRef]) -> Expansion {
        let mut active: HashSet<String> = HashSet::new();
        let mut depth: HashMap<String, usize> = HashMap::new();
        // Provenance: one entry per firing, (conjunction sources, target)
        let mut edges: Vec<(BTreeSet<String>, String)> = Vec::new();
        let mut negated: BTreeSet<String> = BTreeSet::new();
        // (depth, bundle name, conjunction sources)
        let mut bundle_contribs: Vec<(usize, String, BTreeSet<String>)> = Vec::new();

        for seed in seeds {
            if seed.negate {
                negated.insert(seed.name.clone());
            } else {
                active.insert(seed.name.clone());
                depth.insert(seed.name.clone(), 0);
                edges.push((BTreeSet::new(), seed.name.clone()));
            }
        }

        // Fire conditionals to fixpoint; each node fires at most once, so the
        // loop is bounded by the node count and repeated inclusion is a no-op.
        let mut fired = vec![false; self.nodes.len()];
        loop {
            let mut changed = false;
            for (idx, node) in self.nodes.iter().enumerate() {
                if fired[idx] || !node.conditions.iter().all(|c| c.holds(client, &active)) {
                    continue;
                }
                fired[idx] = true;
                changed = true;

                let sources = node.sources();
                let contrib_depth = sources
                    .iter()
                    .filter_map(|s| depth.get(s))
                    .max()
                    .copied()
                    .unwrap_or(0);

                for group_ref in &node.groups {
                    if group_ref.negate {
                        negated.insert(group_ref.name.clone());
                        continue;
                    }
                    edges.push((sources.clone(), group_ref.name.clone()));
                    let entry = depth
                        .entry(group_ref.name.clone())
                        .or_insert(contrib_depth + 1);
                    *entry = (*entry).min(contrib_depth + 1);
                    active.insert(group_ref.name.clone());
                }
                for bundle in &node.bundles {
                    bundle_contribs.push((contrib_depth, bundle.clone(), sources.clone()));
                }
            }
            if !changed {
                break;
            }
        }

        // Negation wins over every inclusion chain
        let mut removed: BTreeSet<String> = negated.clone();
        let mut alive = reachable(&edges, &removed);

        let mut warnings = Vec::new();

        // Category exclusivity, enforced once over the merged membership
        let mut by_category: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for name in &alive {
            if let Some(category) = self.group(name).and_then(|d| d.category.as_deref()) {
                by_category.entry(category).or_default().push(name.as_str());
            }
        }
        let mut category_losers: Vec<String> = Vec::new();
        for (category, mut members) in by_category {
            if members.len() < 2 {
                continue;
            }
            members.sort_by_key(|name| (depth.get(*name).copied().unwrap_or(usize::MAX), *name));
            let winner = members[0];
            for loser in &members[1..] {
                warnings.push(format!(
                    "category {category}: dropping {loser} in favor of {winner}"
                ));
                category_losers.push(loser.to_string());
            }
        }
        if !category_losers.is_empty() {
            for message in &warnings {
                warn!(client, "{message}");
            }
            removed.extend(category_losers);
            alive = reachable(&edges, &removed);
        }

        // Bundles: contributions whose conjunction survived, ordered by
        // inclusion depth then name
        let mut bundles: Vec<(usize, String)> = bundle_contribs
            .into_iter()
            .filter(|(_, _, sources)| sources.iter().all(|s| alive.contains(s)))
            .map(|(d, name, _)| (d, name))
            .collect();
        bundles.sort();
        let mut seen = BTreeSet::new();
        let bundles: Vec<String> = bundles
            .into_iter()
            .filter(|(_, name)| seen.insert(name.clone()))
            .map(|(_, name)| name)
            .collect();

        let mut categories = BTreeMap::new();
        for name in &alive {
            if let Some(category) = self.group(name).and_then(|d| d.category.clone()) {
                categories.insert(category, name.clone());
            }
        }

        Expansion {
            groups: alive,
            categories,
            bundles,
            warnings,
        }
    }
}

/// Chaotic-iteration reachability over conjunction edges: an edge activates
/// its target only while every source group is itself alive.
fn reachable(edges: &[(BTreeSet<String>, String)], removed: &BTreeSet<String>) -> BTreeSet<String> {
    let mut alive: BTreeSet<String> = BTreeSet::new();
    loop {
        let mut changed = false;
        for (sources, target) in edges {
            if removed.contains(target) || alive.contains(target) {
                continue;
            }
            if sources.iter().all(|s| alive.contains(s)) {
                alive.insert(target.clone());
                changed = true;
            }
        }
        if !changed {
            return alive;
        }
    }
}
