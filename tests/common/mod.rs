// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

use std::path::Path;
use std::sync::Arc;
use tailor::core::Core;
use tailor::options::Options;
use tempfile::TempDir;

/// A throwaway repository on disk.
///
/// Keep the `TempDir` alive to prevent cleanup.
pub struct RepoFixture {
    pub dir: TempDir,
}

impl RepoFixture {
    /// Create the standard repository layout with an empty groups document
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["Metadata", "Bundler", "Rules", "Probes", "Decisions"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let fixture = Self { dir };
        fixture.write("Metadata/groups.xml", "<Groups/>");
        fixture
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write (or overwrite) a repository file
    pub fn write(&self, rel: &str, content: &str) {
        std::fs::write(self.root().join(rel), content).unwrap();
    }

    pub fn options(&self) -> Options {
        let mut options = Options {
            repository: self.root().to_path_buf(),
            ..Default::default()
        };
        options.metadata.database_path = self.root().join("state").join("tailor.db");
        options
    }

    /// Open a core over this repository with default options
    pub fn core(&self) -> Arc<Core> {
        Core::open(Arc::new(self.options())).unwrap()
    }

    /// Open a core with the options adjusted first
    pub fn core_with(&self, adjust: impl FnOnce(&mut Options)) -> Arc<Core> {
        let mut options = self.options();
        adjust(&mut options);
        Core::open(Arc::new(options)).unwrap()
    }
}

/// A minimal working web-server repository: one profile group, one bundle,
/// one rules document, one declared client.
pub fn web_repo() -> RepoFixture {
    let fixture = RepoFixture::new();
    fixture.write(
        "Metadata/groups.xml",
        r#"<Groups>
             <Group name="web" profile="true" public="true">
               <Bundle name="nginx"/>
             </Group>
           </Groups>"#,
    );
    fixture.write(
        "Metadata/clients.xml",
        r#"<Clients>
             <Client name="c1.example.com" profile="web" address="192.0.2.10"/>
           </Clients>"#,
    );
    fixture.write(
        "Bundler/nginx.xml",
        r#"<Bundle name="nginx">
             <Service name="nginx"/>
             <Path name="/etc/nginx/nginx.conf"/>
           </Bundle>"#,
    );
    fixture.write(
        "Rules/web.xml",
        r#"<Rules priority="10">
             <Service name="nginx" type="systemd" status="on"/>
             <Path name="/etc/nginx/nginx.conf" type="file" owner="root" group="root" mode="0644"/>
           </Rules>"#,
    );
    fixture
}
