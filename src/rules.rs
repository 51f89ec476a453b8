// src/rules.rs

//! Built-in Rules generator: prioritized rule documents
//!
//! Each `Rules/*.xml` document carries a priority and a set of rule
//! entries, optionally nested inside `<Group>`/`<Client>` conditionals.
//! A rule offers the concrete attributes for abstract entries whose kind
//! and name it matches; name matching is literal, or an anchored regular
//! expression when `rules.regex` is enabled.

use crate::error::{Error, Result};
use crate::metadata::ClientMetadata;
use crate::plugin::{EntryCandidate, Generator, Plugin};
use crate::xml::{load_with_includes, Element};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone)]
enum RuleCondition {
    Group { name: String, negate: bool },
    Client { name: String, negate: bool },
}

impl RuleCondition {
    fn holds(&self, metadata: &ClientMetadata) -> bool {
        match self {
            RuleCondition::Group { name, negate } => *negate != metadata.groups.contains(name),
            RuleCondition::Client { name, negate } => *negate != (metadata.hostname == *name),
        }
    }
}

struct Rule {
    kind: String,
    name: String,
    pattern: Option<Regex>,
    element: Element,
    conditions: Vec<RuleCondition>,
    /// Positive group conditions, for binding specificity
    scope: BTreeSet<String>,
    priority: i32,
    /// Document registration order
    registration: usize,
    origin: String,
}

/// Rules generator over all loaded rule documents
pub struct RulesPlugin {
    rules: Vec<Rule>,
    regex_enabled: bool,
}

impl RulesPlugin {
    /// Load every `Rules/*.xml` document, in filename order
    pub fn load(dir: &Path, regex_enabled: bool) -> Result<Self> {
        let mut plugin = Self {
            rules: Vec::new(),
            regex_enabled,
        };

        if dir.is_dir() {
            let mut paths: Vec<_> = std::fs::read_dir(dir)?
                .collect::<std::io::Result<Vec<_>>>()?
                .into_iter()
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "xml").unwrap_or(false))
                .collect();
            paths.sort();

            for (registration, path) in paths.iter().enumerate() {
                let root = load_with_includes(path)?;
                let priority: i32 = match root.attr("priority") {
                    Some(p) => p.parse().map_err(|_| Error::RepoLoad {
                        path: path.clone(),
                        reason: format!("malformed priority attribute {p:?}"),
                    })?,
                    None => 0,
                };
                let origin = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("rules")
                    .to_string();
                plugin.collect(&root, &[], priority, registration, &origin, path)?;
            }
        }

        debug!(rules = plugin.rules.len(), "rules loaded");
        Ok(plugin)
    }

    fn collect(
        &mut self,
        elem: &Element,
        conditions: &[RuleCondition],
        priority: i32,
        registration: usize,
        origin: &str,
        path: &Path,
    ) -> Result<()> {
        for child in &elem.children {
            match child.name.as_str() {
                "Group" => {
                    let mut nested = conditions.to_vec();
                    nested.push(RuleCondition::Group {
                        name: child.attr("name").unwrap_or_default().to_string(),
                        negate: child.bool_attr("negate"),
                    });
                    self.collect(child, &nested, priority, registration, origin, path)?;
                }
                "Client" => {
                    let mut nested = conditions.to_vec();
                    nested.push(RuleCondition::Client {
                        name: child.attr("name").unwrap_or_default().to_string(),
                        negate: child.bool_attr("negate"),
                    });
                    self.collect(child, &nested, priority, registration, origin, path)?;
                }
                _ => {
                    let Some(name) = child.attr("name") else {
                        continue;
                    };
                    let pattern = if self.regex_enabled {
                        Some(
                            Regex::new(&format!("^(?:{name})$")).map_err(|e| Error::RepoLoad {
                                path: path.to_path_buf(),
                                reason: format!("bad rule pattern {name:?}: {e}"),
                            })?,
                        )
                    } else {
                        None
                    };
                    let scope = conditions
                        .iter()
                        .filter_map(|c| match c {
                            RuleCondition::Group {
                                name,
                                negate: false,
                            } => Some(name.clone()),
                            _ => None,
                        })
                        .collect();
                    self.rules.push(Rule {
                        kind: child.name.clone(),
                        name: name.to_string(),
                        pattern,
                        element: child.clone(),
                        conditions: conditions.to_vec(),
                        scope,
                        priority,
                        registration,
                        origin: origin.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Plugin for RulesPlugin {
    fn name(&self) -> &str {
        "rules"
    }
}

impl Generator for RulesPlugin {
    fn candidates(&self, kind: &str, name: &str, metadata: &ClientMetadata) -> Vec<EntryCandidate> {
        let mut found = Vec::new();
        for (handle, rule) in self.rules.iter().enumerate() {
            if rule.kind != kind {
                continue;
            }
            let exact = rule.name == name;
            let matched = exact
                || rule
                    .pattern
                    .as_ref()
                    .map(|p| p.is_match(name))
                    .unwrap_or(false);
            if !matched || !rule.conditions.iter().all(|c| c.holds(metadata)) {
                continue;
            }
            found.push(EntryCandidate {
                handle,
                priority: rule.priority,
                exact,
                groups: rule.scope.clone(),
                registration: rule.registration,
                origin: rule.origin.clone(),
            });
        }
        found
    }

    fn bind_entry(
        &self,
        handle: usize,
        entry: &Element,
        _metadata: &ClientMetadata,
    ) -> Result<Element> {
        let rule = self
            .rules
            .get(handle)
            .ok_or_else(|| Error::plugin("rules", format!("stale rule handle {handle}")))?;

        let mut literal = entry.clone();
        for (key, value) in rule.element.attrs() {
            // The abstract entry's name survives; regex rules would
            // otherwise overwrite it with the pattern
            if key == "name" {
                continue;
            }
            literal.set_attr(key, value);
        }
        if literal.text.is_empty() {
            literal.text = rule.element.text.clone();
        }
        if literal.children.is_empty() {
            literal.children = rule.element.children.clone();
        }
        Ok(literal)
    }
}
