// src/xml/include.rs
//! Cross-document include expansion
//!
//! A repository document may pull in sibling documents with
//! `<xi:include href="..."/>` (any prefix; the local tag name `include` is
//! what matters). The include element is replaced by the referenced
//! document's root children, recursively. Missing files and include cycles
//! fail the load of the whole document.

use super::Element;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Load a document and expand includes relative to its location
pub fn load_with_includes(path: &Path) -> Result<Element> {
    let mut in_flight = Vec::new();
    load_inner(path, &mut in_flight)
}

fn load_inner(path: &Path, in_flight: &mut Vec<PathBuf>) -> Result<Element> {
    let canonical = path.canonicalize().map_err(|e| Error::RepoLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if in_flight.contains(&canonical) {
        return Err(Error::RepoLoad {
            path: path.to_path_buf(),
            reason: format!(
                "include cycle: {}",
                in_flight
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            ),
        });
    }

    in_flight.push(canonical.clone());
    let mut root = Element::parse_file(path)?;
    let base = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    expand_children(&mut root, &base, in_flight)?;
    in_flight.pop();

    Ok(root)
}

fn expand_children(elem: &mut Element, base: &Path, in_flight: &mut Vec<PathBuf>) -> Result<()> {
    let mut expanded = Vec::with_capacity(elem.children.len());

    for mut child in std::mem::take(&mut elem.children) {
        if child.local_name() == "include" {
            let href = child.attr("href").ok_or_else(|| Error::RepoLoad {
                path: base.to_path_buf(),
                reason: "include element without href".to_string(),
            })?;
            let target = base.join(href);
            let included = load_inner(&target, in_flight)?;
            expanded.extend(included.children);
        } else {
            expand_children(&mut child, base, in_flight)?;
            expanded.push(child);
        }
    }

    elem.children = expanded;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_include_expansion() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "extra.xml",
            r#"<Groups><Group name="db"/></Groups>"#,
        );
        let main = write(
            dir.path(),
            "groups.xml",
            r#"<Groups>
                 <Group name="web"/>
                 <xi:include href="extra.xml"/>
               </Groups>"#,
        );

        let doc = load_with_includes(&main).unwrap();
        let names: Vec<_> = doc
            .children_named("Group")
            .filter_map(|g| g.attr("name"))
            .collect();
        assert_eq!(names, vec!["web", "db"]);
    }

    #[test]
    fn test_nested_include() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "c.xml", r#"<Groups><Group name="leaf"/></Groups>"#);
        write(
            dir.path(),
            "b.xml",
            r#"<Groups><xi:include href="c.xml"/></Groups>"#,
        );
        let main = write(
            dir.path(),
            "a.xml",
            r#"<Groups><xi:include href="b.xml"/></Groups>"#,
        );

        let doc = load_with_includes(&main).unwrap();
        assert_eq!(
            doc.first_child("Group").unwrap().attr("name"),
            Some("leaf")
        );
    }

    #[test]
    fn test_include_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.xml",
            r#"<Groups><xi:include href="b.xml"/></Groups>"#,
        );
        write(
            dir.path(),
            "b.xml",
            r#"<Groups><xi:include href="a.xml"/></Groups>"#,
        );

        let err = load_with_includes(&dir.path().join("a.xml")).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_missing_include_fails() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(
            dir.path(),
            "a.xml",
            r#"<Groups><xi:include href="nope.xml"/></Groups>"#,
        );
        assert!(load_with_includes(&main).is_err());
    }
}
