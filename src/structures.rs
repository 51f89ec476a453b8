// src/structures.rs

//! Structure assembly: bundles into ordered abstract entry streams
//!
//! Bundle documents carry abstract entries, optionally nested inside
//! `<Group>`/`<Client>` conditionals. Assembly filters the conditionals
//! against the frozen metadata, renders templated documents at that same
//! point, and emits one `<Bundle>` element per declared bundle name in the
//! metadata's bundle order. A missing bundle becomes an in-place error
//! child, never a failed session.

use crate::core::Deadline;
use crate::error::{Error, Result};
use crate::metadata::ClientMetadata;
use crate::plugin::{BundleTemplate, Plugin, PluginRegistry, StructureSource};
use crate::xml::{load_with_includes, Element};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Does a `<Group>`/`<Client>` conditional element admit this client?
/// Non-conditional elements always pass.
pub fn include_element(elem: &Element, metadata: &ClientMetadata) -> bool {
    let negate = elem.bool_attr("negate");
    match elem.name.as_str() {
        "Group" => match elem.attr("name") {
            Some(name) => negate != metadata.groups.contains(name),
            None => false,
        },
        "Client" => match elem.attr("name") {
            Some(name) => negate != (name == metadata.hostname),
            None => false,
        },
        _ => true,
    }
}

/// Filter an element's children against metadata, hoisting the contents of
/// matching conditionals and dropping non-matching ones.
pub fn match_children(elem: &Element, metadata: &ClientMetadata) -> Vec<Element> {
    let mut matched = Vec::new();
    for child in &elem.children {
        if child.name == "Group" || child.name == "Client" {
            if include_element(child, metadata) {
                matched.extend(match_children(child, metadata));
            }
        } else {
            let mut kept = child.clone();
            kept.children = match_children(child, metadata);
            matched.push(kept);
        }
    }
    matched
}

/// Placeholder substitution: `%{hostname}`, `%{profile}`, `%{uuid}` in
/// attribute values and text
pub struct SubstitutionTemplate;

impl SubstitutionTemplate {
    fn substitute(value: &str, metadata: &ClientMetadata) -> String {
        value
            .replace("%{hostname}", &metadata.hostname)
            .replace("%{profile}", &metadata.profile)
            .replace(
                "%{uuid}",
                &metadata
                    .uuid
                    .map(|u| u.to_string())
                    .unwrap_or_default(),
            )
    }

    fn render_element(elem: &Element, metadata: &ClientMetadata) -> Element {
        let mut out = Element::new(elem.name.clone());
        for (key, value) in elem.attrs() {
            out.set_attr(key, Self::substitute(value, metadata));
        }
        out.text = Self::substitute(&elem.text, metadata);
        out.children = elem
            .children
            .iter()
            .map(|c| Self::render_element(c, metadata))
            .collect();
        out
    }
}

impl BundleTemplate for SubstitutionTemplate {
    fn render(&self, source: &Element, metadata: &ClientMetadata) -> Result<Element> {
        Ok(Self::render_element(source, metadata))
    }
}

struct BundleDoc {
    root: Element,
    templated: bool,
}

/// Built-in bundle source: one document per file under `Bundler/`
pub struct BundlerPlugin {
    bundles: HashMap<String, BundleDoc>,
    template: Arc<dyn BundleTemplate>,
}

impl BundlerPlugin {
    /// Load bundle documents from the repository's `Bundler/` directory
    pub fn load(dir: &Path) -> Result<Self> {
        let mut bundles = HashMap::new();
        if dir.is_dir() {
            let mut paths: Vec<_> = std::fs::read_dir(dir)?
                .collect::<std::io::Result<Vec<_>>>()?
                .into_iter()
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "xml").unwrap_or(false))
                .collect();
            paths.sort();

            for path in paths {
                let root = load_with_includes(&path)?;
                let name = root
                    .attr("name")
                    .map(str::to_string)
                    .or_else(|| {
                        path.file_stem()
                            .and_then(|s| s.to_str())
                            .map(str::to_string)
                    })
                    .ok_or_else(|| Error::RepoLoad {
                        path: path.clone(),
                        reason: "bundle has neither name attribute nor file stem".to_string(),
                    })?;
                let templated = root
                    .attr("template")
                    .map(|t| t == "substitute")
                    .unwrap_or(false);
                if bundles
                    .insert(name.clone(), BundleDoc { root, templated })
                    .is_some()
                {
                    warn!(bundle = name.as_str(), "duplicate bundle document; later file wins");
                }
            }
        }
        debug!(bundles = bundles.len(), "bundler loaded");
        Ok(Self {
            bundles,
            template: Arc::new(SubstitutionTemplate),
        })
    }

    fn render(&self, name: &str, doc: &BundleDoc, metadata: &ClientMetadata) -> Result<Element> {
        // Templates render against the frozen metadata, not at parse time
        let root = if doc.templated {
            self.template.render(&doc.root, metadata)?
        } else {
            doc.root.clone()
        };
        let mut bundle = Element::new("Bundle").with_attr("name", name);
        bundle.children = match_children(&root, metadata);
        Ok(bundle)
    }
}

impl Plugin for BundlerPlugin {
    fn name(&self) -> &str {
        "bundler"
    }
}

impl StructureSource for BundlerPlugin {
    fn build_bundle(&self, bundle: &str, metadata: &ClientMetadata) -> Option<Result<Element>> {
        let doc = self.bundles.get(bundle)?;
        Some(self.render(bundle, doc, metadata))
    }
}

/// Assemble all declared bundles for a client into abstract structures
pub fn assemble(
    registry: &PluginRegistry,
    metadata: &ClientMetadata,
    deadline: &Deadline,
) -> Result<Vec<Element>> {
    let mut structures = Vec::with_capacity(metadata.bundles.len());

    for bundle in &metadata.bundles {
        deadline.check()?;

        let built = registry
            .structures
            .iter()
            .find_map(|source| source.build_bundle(bundle, metadata));

        match built {
            Some(Ok(structure)) => structures.push(structure),
            Some(Err(err)) => {
                warn!(bundle = bundle.as_str(), error = %err, "bundle build failed");
                structures.push(
                    Element::new("Bundle").with_attr("name", bundle).with_child(
                        Element::new("error")
                            .with_attr("kind", "build")
                            .with_text(err.to_string()),
                    ),
                );
            }
            None => {
                warn!(bundle = bundle.as_str(), "bundle not found in any structure source");
                structures.push(
                    Element::new("Bundle")
                        .with_attr("name", bundle)
                        .with_child(Element::new("error").with_attr("kind", "missing")),
                );
            }
        }
    }

    for validator in &registry.structure_validators {
        validator
            .validate_structures(metadata, &mut structures)
            .map_err(|err| Error::Structure {
                bundle: "*".to_string(),
                reason: format!("validator {} rejected structures: {err}", validator.name()),
            })?;
    }

    Ok(structures)
}

/// Old-style service modes for clients that predate the
/// `(restart, install)` attribute pair
pub struct ServiceModeCompat;

impl ServiceModeCompat {
    /// Version at which clients started understanding restart/install
    const CUTOVER: [u64; 3] = [1, 3, 0];

    fn predates_cutover(version: Option<&str>) -> bool {
        let Some(version) = version else {
            // Unknown version: assume an old client
            return true;
        };
        let parts: Vec<u64> = version
            .split('.')
            .map(|p| {
                p.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect();
        let mut padded = [0u64; 3];
        for (slot, part) in padded.iter_mut().zip(parts) {
            *slot = part;
        }
        padded < Self::CUTOVER
    }

    fn mode_for(restart: &str, install: &str) -> Option<&'static str> {
        match (restart, install) {
            ("true", "true") => Some("default"),
            ("interactive", "true") => Some("interactive_only"),
            ("false", "false") => Some("manual"),
            _ => None,
        }
    }

    fn rewrite(elem: &mut Element, client: &str) {
        for child in &mut elem.children {
            if child.name == "Service" || child.name == "BoundService" {
                let restart = child.attr("restart").unwrap_or("true").to_ascii_lowercase();
                let install = child.attr("install").unwrap_or("true").to_ascii_lowercase();
                let mode = match Self::mode_for(&restart, &install) {
                    Some(mode) => mode,
                    None => {
                        debug!(
                            client,
                            service = child.attr("name").unwrap_or(""),
                            restart = restart.as_str(),
                            install = install.as_str(),
                            "no old-style mode for restart/install; using manual"
                        );
                        "manual"
                    }
                };
                child.set_attr("mode", mode);
            }
            Self::rewrite(child, client);
        }
    }
}

impl Plugin for ServiceModeCompat {
    fn name(&self) -> &str {
        "service-compat"
    }
}

impl crate::plugin::StructureValidator for ServiceModeCompat {
    fn validate_structures(
        &self,
        metadata: &ClientMetadata,
        structures: &mut Vec<Element>,
    ) -> Result<()> {
        if !Self::predates_cutover(metadata.version.as_deref()) {
            return Ok(());
        }
        for structure in structures.iter_mut() {
            Self::rewrite(structure, &metadata.hostname);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn metadata(groups: &[&str]) -> ClientMetadata {
        ClientMetadata {
            hostname: "c1.example.com".to_string(),
            profile: "web".to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            categories: BTreeMap::new(),
            aliases: BTreeSet::new(),
            addresses: BTreeSet::new(),
            uuid: None,
            password: None,
            bundles: vec!["nginx".to_string()],
            connectors: BTreeMap::new(),
            version: None,
        }
    }

    fn bundler(files: &[(&str, &str)]) -> BundlerPlugin {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        BundlerPlugin::load(dir.path()).unwrap()
    }

    #[test]
    fn test_conditional_filtering() {
        let plugin = bundler(&[(
            "nginx.xml",
            r#"<Bundle name="nginx">
                 <Path name="/etc/nginx/nginx.conf"/>
                 <Group name="tls">
                   <Path name="/etc/nginx/tls.conf"/>
                 </Group>
                 <Group name="tls" negate="true">
                   <Path name="/etc/nginx/plain.conf"/>
                 </Group>
                 <Client name="c1.example.com">
                   <Path name="/etc/nginx/host.conf"/>
                 </Client>
               </Bundle>"#,
        )]);

        let with_tls = plugin
            .build_bundle("nginx", &metadata(&["web", "tls"]))
            .unwrap()
            .unwrap();
        let names: Vec<_> = with_tls
            .children_named("Path")
            .filter_map(|p| p.attr("name"))
            .collect();
        assert_eq!(
            names,
            vec![
                "/etc/nginx/nginx.conf",
                "/etc/nginx/tls.conf",
                "/etc/nginx/host.conf"
            ]
        );

        let without_tls = plugin
            .build_bundle("nginx", &metadata(&["web"]))
            .unwrap()
            .unwrap();
        let names: Vec<_> = without_tls
            .children_named("Path")
            .filter_map(|p| p.attr("name"))
            .collect();
        assert_eq!(
            names,
            vec![
                "/etc/nginx/nginx.conf",
                "/etc/nginx/plain.conf",
                "/etc/nginx/host.conf"
            ]
        );
    }

    #[test]
    fn test_nested_conditionals_preserved_inside_entries() {
        // Conditionals inside a kept entry are filtered too
        let plugin = bundler(&[(
            "svc.xml",
            r#"<Bundle name="svc">
                 <BoundPath name="/etc/motd" type="file">
                   <Group name="nope">
                     <ignored/>
                   </Group>
                 </BoundPath>
               </Bundle>"#,
        )]);

        let built = plugin.build_bundle("svc", &metadata(&["web"])).unwrap().unwrap();
        let path = built.first_child("BoundPath").unwrap();
        assert!(path.children.is_empty());
    }

    #[test]
    fn test_template_substitution() {
        let plugin = bundler(&[(
            "motd.xml",
            r#"<Bundle name="motd" template="substitute">
                 <BoundPath name="/etc/motd">Welcome to %{hostname} (%{profile})</BoundPath>
               </Bundle>"#,
        )]);

        let built = plugin.build_bundle("motd", &metadata(&[])).unwrap().unwrap();
        let path = built.first_child("BoundPath").unwrap();
        assert_eq!(path.text, "Welcome to c1.example.com (web)");
    }

    #[test]
    fn test_missing_bundle_yields_error_child() {
        let registry = PluginRegistry {
            structures: vec![Arc::new(bundler(&[]))],
            ..Default::default()
        };
        let structures = assemble(&registry, &metadata(&["web"]), &Deadline::none()).unwrap();
        assert_eq!(structures.len(), 1);
        let bundle = &structures[0];
        assert_eq!(bundle.attr("name"), Some("nginx"));
        let error = bundle.first_child("error").unwrap();
        assert_eq!(error.attr("kind"), Some("missing"));
    }

    #[test]
    fn test_bundle_name_from_stem() {
        let plugin = bundler(&[("stemmed.xml", r#"<Bundle><Path name="/x"/></Bundle>"#)]);
        assert!(plugin.build_bundle("stemmed", &metadata(&[])).is_some());
    }

    #[test]
    fn test_service_compat_version_cutover() {
        assert!(ServiceModeCompat::predates_cutover(None));
        assert!(ServiceModeCompat::predates_cutover(Some("1.2.4")));
        assert!(!ServiceModeCompat::predates_cutover(Some("1.3.0")));
        assert!(!ServiceModeCompat::predates_cutover(Some("1.3.0rc2")));
        assert!(!ServiceModeCompat::predates_cutover(Some("2.0")));
    }

    #[test]
    fn test_service_compat_rewrites_old_clients() {
        use crate::plugin::StructureValidator;

        let mut meta = metadata(&[]);
        meta.version = Some("1.2.0".to_string());
        let mut structures = vec![Element::new("Bundle").with_attr("name", "ntp").with_child(
            Element::new("Service")
                .with_attr("name", "ntpd")
                .with_attr("restart", "false")
                .with_attr("install", "false"),
        )
        .with_child(
            Element::new("BoundService").with_attr("name", "sshd"),
        )];

        ServiceModeCompat
            .validate_structures(&meta, &mut structures)
            .unwrap();
        assert_eq!(
            structures[0].first_child("Service").unwrap().attr("mode"),
            Some("manual")
        );
        // restart/install default to true: old-style "default" mode
        assert_eq!(
            structures[0].first_child("BoundService").unwrap().attr("mode"),
            Some("default")
        );

        // A current client is left alone
        let mut meta_new = metadata(&[]);
        meta_new.version = Some("1.4.1".to_string());
        let mut untouched = vec![Element::new("Bundle")
            .with_child(Element::new("Service").with_attr("name", "ntpd"))];
        ServiceModeCompat
            .validate_structures(&meta_new, &mut untouched)
            .unwrap();
        assert!(untouched[0].first_child("Service").unwrap().attr("mode").is_none());
    }
}
