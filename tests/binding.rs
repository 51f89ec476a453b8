// tests/binding.rs

//! End-to-end synthesis scenarios: profile-only clients, priority ties,
//! bound-entry passthrough, decision filtering, and determinism.

mod common;

use common::{web_repo, RepoFixture};
use tailor::core::Deadline;
use tailor::options::DecisionMode;
use tailor::xml::Element;

#[test]
fn test_profile_only_client_gets_one_bundle() {
    let fixture = web_repo();
    let core = fixture.core();

    let doc = core
        .build_config("c1.example.com", &Deadline::none())
        .unwrap();
    assert_eq!(doc.name, "Configuration");

    let bundles: Vec<_> = doc.children_named("Bundle").collect();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].attr("name"), Some("nginx"));

    let service = bundles[0].first_child("Service").unwrap();
    assert_eq!(service.attr("type"), Some("systemd"));
    assert_eq!(service.attr("status"), Some("on"));

    let path = bundles[0].first_child("Path").unwrap();
    assert_eq!(path.attr("owner"), Some("root"));
    assert_eq!(path.attr("mode"), Some("0644"));
}

#[test]
fn test_missing_bundle_error_shape() {
    let fixture = RepoFixture::new();
    fixture.write(
        "Metadata/groups.xml",
        r#"<Groups>
             <Group name="web" profile="true" public="true">
               <Bundle name="absent"/>
             </Group>
           </Groups>"#,
    );
    fixture.write(
        "Metadata/clients.xml",
        r#"<Clients><Client name="c1" profile="web"/></Clients>"#,
    );
    let core = fixture.core();

    let doc = core.build_config("c1", &Deadline::none()).unwrap();
    let bundle = doc.first_child("Bundle").unwrap();
    assert_eq!(bundle.attr("name"), Some("absent"));
    let error = bundle.first_child("error").unwrap();
    assert_eq!(error.attr("kind"), Some("missing"));
}

#[test]
fn test_unbindable_entry_becomes_error_entry() {
    let fixture = RepoFixture::new();
    fixture.write(
        "Metadata/groups.xml",
        r#"<Groups>
             <Group name="web" profile="true" public="true">
               <Bundle name="lonely"/>
             </Group>
           </Groups>"#,
    );
    fixture.write(
        "Metadata/clients.xml",
        r#"<Clients><Client name="c1" profile="web"/></Clients>"#,
    );
    fixture.write(
        "Bundler/lonely.xml",
        r#"<Bundle name="lonely"><Service name="unruled"/></Bundle>"#,
    );
    let core = fixture.core();

    let doc = core.build_config("c1", &Deadline::none()).unwrap();
    let bundle = doc.first_child("Bundle").unwrap();
    let error = bundle.first_child("error").unwrap();
    assert_eq!(error.attr("kind"), Some("Service"));
    assert_eq!(error.attr("name"), Some("unruled"));
    assert_eq!(error.attr("failure"), Some("no matching rule"));
}

#[test]
fn test_bound_entries_bypass_binder() {
    let fixture = RepoFixture::new();
    fixture.write(
        "Metadata/groups.xml",
        r#"<Groups>
             <Group name="web" profile="true" public="true">
               <Bundle name="motd"/>
             </Group>
           </Groups>"#,
    );
    fixture.write(
        "Metadata/clients.xml",
        r#"<Clients><Client name="c1" profile="web"/></Clients>"#,
    );
    fixture.write(
        "Bundler/motd.xml",
        r#"<Bundle name="motd">
             <BoundPath name="/etc/motd" type="file" owner="root">hello</BoundPath>
           </Bundle>"#,
    );
    let core = fixture.core();

    let doc = core.build_config("c1", &Deadline::none()).unwrap();
    let bundle = doc.first_child("Bundle").unwrap();
    // No Rules document exists, yet the bound entry binds to itself
    let path = bundle.first_child("Path").unwrap();
    assert_eq!(path.attr("owner"), Some("root"));
    assert_eq!(path.text, "hello");
    assert!(bundle.first_child("error").is_none());
}

#[test]
fn test_equal_priority_tie_second_file_wins() {
    let fixture = web_repo();
    fixture.write(
        "Rules/za-conflict.xml",
        r#"<Rules priority="10">
             <Service name="nginx" type="systemd" status="off"/>
           </Rules>"#,
    );
    let core = fixture.core();

    let doc = core
        .build_config("c1.example.com", &Deadline::none())
        .unwrap();
    let service = doc
        .first_child("Bundle")
        .unwrap()
        .first_child("Service")
        .unwrap();
    // web.xml sorts before za-conflict.xml; the later registration wins
    assert_eq!(service.attr("status"), Some("off"));
}

#[test]
fn test_decision_blacklist_omits_exactly_listed_entry() {
    let fixture = web_repo();
    fixture.write(
        "Decisions/blacklist.xml",
        r#"<Decisions><Decision type="Service" name="nginx"/></Decisions>"#,
    );
    let core = fixture.core_with(|options| {
        options.server.decision = DecisionMode::Blacklist;
    });

    let doc = core
        .build_config("c1.example.com", &Deadline::none())
        .unwrap();
    let bundle = doc.first_child("Bundle").unwrap();
    assert!(bundle.first_child("Service").is_none());
    // Every other entry is untouched
    assert!(bundle.first_child("Path").is_some());
}

#[test]
fn test_get_config_deterministic_after_canonicalization() {
    let fixture = web_repo();
    fixture.write(
        "Bundler/nginx.xml",
        r#"<Bundle name="nginx">
             <Group name="missing-group">
               <Service name="never"/>
             </Group>
             <Service name="nginx"/>
             <Path name="/etc/nginx/nginx.conf"/>
           </Bundle>"#,
    );
    let core = fixture.core();

    let first = core
        .build_config("c1.example.com", &Deadline::none())
        .unwrap()
        .to_document();
    let second = core
        .build_config("c1.example.com", &Deadline::none())
        .unwrap()
        .to_document();
    assert_eq!(first, second);

    // Parse and re-serialize: canonical form is a fixed point
    let reparsed = Element::parse(&first).unwrap().to_document();
    assert_eq!(first, reparsed);
}

#[test]
fn test_template_renders_against_frozen_metadata() {
    let fixture = RepoFixture::new();
    fixture.write(
        "Metadata/groups.xml",
        r#"<Groups>
             <Group name="web" profile="true" public="true">
               <Bundle name="motd"/>
             </Group>
           </Groups>"#,
    );
    fixture.write(
        "Metadata/clients.xml",
        r#"<Clients><Client name="host7.example.com" profile="web"/></Clients>"#,
    );
    fixture.write(
        "Bundler/motd.xml",
        r#"<Bundle name="motd" template="substitute">
             <BoundPath name="/etc/motd">host %{hostname} profile %{profile}</BoundPath>
           </Bundle>"#,
    );
    let core = fixture.core();

    let doc = core
        .build_config("host7.example.com", &Deadline::none())
        .unwrap();
    let path = doc.first_child("Bundle").unwrap().first_child("Path").unwrap();
    assert_eq!(path.text, "host host7.example.com profile web");
}
