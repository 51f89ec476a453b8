// src/decision.rs

//! Decision lists: whitelist/blacklist filtering of the literal tree
//!
//! The filter runs after binding and before serialization, so generators
//! never observe decision-list state. Entries are matched by
//! `(kind, name)`; whitelist retains matches, blacklist removes them.

use crate::metadata::ClientMetadata;
use crate::options::DecisionMode;
use crate::plugin::{DecisionProvider, Plugin, PluginRegistry};
use crate::structures::match_children;
use crate::xml::{load_with_includes, Element};
use std::path::Path;
use tracing::debug;

/// Built-in decision source: `Decisions/whitelist.xml` and
/// `Decisions/blacklist.xml`, with the usual conditional support
pub struct DecisionsPlugin {
    whitelist: Option<Element>,
    blacklist: Option<Element>,
}

impl DecisionsPlugin {
    pub fn load(dir: &Path) -> crate::error::Result<Self> {
        let load_one = |name: &str| -> crate::error::Result<Option<Element>> {
            let path = dir.join(name);
            if path.is_file() {
                Ok(Some(load_with_includes(&path)?))
            } else {
                Ok(None)
            }
        };
        let plugin = Self {
            whitelist: load_one("whitelist.xml")?,
            blacklist: load_one("blacklist.xml")?,
        };
        debug!(
            whitelist = plugin.whitelist.is_some(),
            blacklist = plugin.blacklist.is_some(),
            "decisions loaded"
        );
        Ok(plugin)
    }

    fn extract(doc: &Element, metadata: &ClientMetadata) -> Vec<(String, String)> {
        match_children(doc, metadata)
            .iter()
            .filter(|e| e.name == "Decision")
            .filter_map(|e| {
                Some((
                    e.attr("type")?.to_string(),
                    e.attr("name")?.to_string(),
                ))
            })
            .collect()
    }
}

impl Plugin for DecisionsPlugin {
    fn name(&self) -> &str {
        "decisions"
    }
}

impl DecisionProvider for DecisionsPlugin {
    fn decisions(&self, mode: DecisionMode, metadata: &ClientMetadata) -> Vec<(String, String)> {
        let doc = match mode {
            DecisionMode::Whitelist => self.whitelist.as_ref(),
            DecisionMode::Blacklist => self.blacklist.as_ref(),
            DecisionMode::Off => None,
        };
        doc.map(|d| Self::extract(d, metadata)).unwrap_or_default()
    }
}

/// Collect the decision list for a mode from every provider
pub fn decision_list(
    registry: &PluginRegistry,
    mode: DecisionMode,
    metadata: &ClientMetadata,
) -> Vec<(String, String)> {
    let mut list: Vec<(String, String)> = registry
        .decisions
        .iter()
        .flat_map(|p| p.decisions(mode, metadata))
        .collect();
    list.sort();
    list.dedup();
    list
}

/// Apply a decision list to bound bundles in place.
///
/// Error entries are matched by their recorded kind and name, like any
/// other literal entry.
pub fn apply(mode: DecisionMode, list: &[(String, String)], bundles: &mut [Element]) {
    if mode == DecisionMode::Off {
        return;
    }
    for bundle in bundles.iter_mut() {
        bundle.children.retain(|entry| {
            let (kind, name) = entry_key(entry);
            let listed = list
                .iter()
                .any(|(k, n)| k == kind && n == name);
            match mode {
                DecisionMode::Whitelist => listed,
                DecisionMode::Blacklist => !listed,
                DecisionMode::Off => true,
            }
        });
    }
}

fn entry_key(entry: &Element) -> (&str, &str) {
    if entry.name == "error" {
        (
            entry.attr("kind").unwrap_or(""),
            entry.attr("name").unwrap_or(""),
        )
    } else {
        (entry.name.as_str(), entry.attr("name").unwrap_or(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn metadata(groups: &[&str]) -> ClientMetadata {
        ClientMetadata {
            hostname: "c1".to_string(),
            profile: "web".to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            categories: BTreeMap::new(),
            aliases: BTreeSet::new(),
            addresses: BTreeSet::new(),
            uuid: None,
            password: None,
            bundles: Vec::new(),
            connectors: BTreeMap::new(),
            version: None,
        }
    }

    fn bundle() -> Element {
        Element::new("Bundle")
            .with_attr("name", "base")
            .with_child(Element::new("Service").with_attr("name", "ntpd"))
            .with_child(Element::new("Service").with_attr("name", "sshd"))
            .with_child(Element::new("Path").with_attr("name", "/etc/ntp.conf"))
    }

    fn names(bundle: &Element) -> Vec<(String, String)> {
        bundle
            .children
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    e.attr("name").unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_blacklist_removes_exactly_listed() {
        let list = vec![("Service".to_string(), "ntpd".to_string())];
        let mut bundles = vec![bundle()];
        apply(DecisionMode::Blacklist, &list, &mut bundles);
        assert_eq!(
            names(&bundles[0]),
            vec![
                ("Service".to_string(), "sshd".to_string()),
                ("Path".to_string(), "/etc/ntp.conf".to_string())
            ]
        );
    }

    #[test]
    fn test_whitelist_retains_only_listed() {
        let list = vec![
            ("Service".to_string(), "sshd".to_string()),
            ("Path".to_string(), "/etc/ntp.conf".to_string()),
        ];
        let mut bundles = vec![bundle()];
        apply(DecisionMode::Whitelist, &list, &mut bundles);
        assert_eq!(
            names(&bundles[0]),
            vec![
                ("Service".to_string(), "sshd".to_string()),
                ("Path".to_string(), "/etc/ntp.conf".to_string())
            ]
        );
    }

    #[test]
    fn test_filter_idempotent() {
        let list = vec![("Service".to_string(), "ntpd".to_string())];

        let mut once = vec![bundle()];
        apply(DecisionMode::Blacklist, &list, &mut once);
        let mut twice = once.clone();
        apply(DecisionMode::Blacklist, &list, &mut twice);
        assert_eq!(once, twice);

        let wl = vec![("Service".to_string(), "sshd".to_string())];
        let mut wl_once = vec![bundle()];
        apply(DecisionMode::Whitelist, &wl, &mut wl_once);
        let mut wl_twice = wl_once.clone();
        apply(DecisionMode::Whitelist, &wl, &mut wl_twice);
        assert_eq!(wl_once, wl_twice);
    }

    #[test]
    fn test_decisions_document_with_conditionals() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("blacklist.xml"),
            r#"<Decisions>
                 <Decision type="Service" name="ntpd"/>
                 <Group name="dmz">
                   <Decision type="Service" name="sshd"/>
                 </Group>
               </Decisions>"#,
        )
        .unwrap();
        let plugin = DecisionsPlugin::load(dir.path()).unwrap();

        let plain = plugin.decisions(DecisionMode::Blacklist, &metadata(&[]));
        assert_eq!(plain, vec![("Service".to_string(), "ntpd".to_string())]);

        let dmz = plugin.decisions(DecisionMode::Blacklist, &metadata(&["dmz"]));
        assert_eq!(dmz.len(), 2);

        assert!(plugin
            .decisions(DecisionMode::Whitelist, &metadata(&[]))
            .is_empty());
    }
}
