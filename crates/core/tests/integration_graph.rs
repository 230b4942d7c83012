//! Template-to-graph compilation scenarios

use std::path::Path;
use warpgate_core::graph;
use warpgate_core::template::TemplateConfig;

fn template(json: &str) -> TemplateConfig {
    serde_json::from_str(json).unwrap()
}

#[test]
fn full_template_marshals_deterministically() {
    let config = template(
        r#"{
            "name": "attack-box",
            "version": "1.0.0",
            "architectures": ["amd64", "arm64"],
            "labels": {"org.opencontainers.image.source": "https://github.com/cowdogmoo/warpgate"},
            "buildArgs": {"FLAVOR": "full"},
            "base": {
                "image": "ubuntu:22.04",
                "env": {"DEBIAN_FRONTEND": "noninteractive"},
                "changes": ["ENV APP_HOME=/opt/app", "WORKDIR /opt/app"]
            },
            "provisioners": [
                {"type": "shell", "commands": ["apt-get update", "apt-get install -y curl git"]},
                {"type": "file", "source": "/ctx/files/motd", "destination": "/etc/motd", "mode": "0644"},
                {"type": "script", "scripts": ["/ctx/scripts/harden.sh"]}
            ],
            "postChanges": ["ENV PATH $PATH:/opt/app/bin", "ENTRYPOINT [\"/bin/bash\"]", "EXPOSE 22"]
        }"#,
    );

    let a = graph::compile(&config, Path::new("/ctx"), "Alice <a@x>").unwrap();
    let b = graph::compile(&config, Path::new("/ctx"), "Alice <a@x>").unwrap();
    assert_eq!(a.marshal(), b.marshal());

    let rendered = a.marshal();
    assert!(rendered.contains("FROM --platform=linux/amd64 ubuntu:22.04"));
    assert!(rendered.contains("ENV DEBIAN_FRONTEND=\"noninteractive\""));
    assert!(rendered.contains("ENV FLAVOR=\"full\""));
    assert!(rendered.contains("WORKDIR /opt/app"));
    assert!(rendered
        .contains("--mount=type=cache,id=apt-cache,target=/var/cache/apt,sharing=shared"));
    assert!(rendered.contains("COPY [\"files/motd\", \"/etc/motd\"]"));
    assert!(rendered.contains("RUN chmod 0644 /etc/motd"));
    assert!(rendered.contains("COPY [\"scripts/harden.sh\", \"/tmp/harden.sh\"]"));
    assert!(rendered.contains("RUN chmod +x /tmp/harden.sh && /tmp/harden.sh"));
    assert!(rendered.contains("ENTRYPOINT [\"/bin/bash\"]"));
    assert!(rendered.contains("EXPOSE 22"));
    assert!(rendered.contains(
        "LABEL \"org.opencontainers.image.authors\"=\"Alice <a@x>\""
    ));

    // PATH expansion picked up the seeded default.
    assert!(rendered.contains(":/opt/app/bin"));
    assert!(!rendered.contains("$PATH"));
}

#[test]
fn arch_override_changes_base_per_architecture() {
    let config = template(
        r#"{
            "name": "box",
            "version": "1",
            "architectures": ["amd64", "arm64"],
            "base": {"image": "ubuntu:22.04"},
            "archOverrides": {
                "arm64": {"base": {"image": "arm64v8/ubuntu:22.04"}}
            }
        }"#,
    );

    let mut arm = config.for_architecture("arm64");
    arm.base.platform = Some("linux/arm64".to_string());
    let graph = graph::compile(&arm, Path::new("/ctx"), "").unwrap();
    assert_eq!(graph.base.image, "arm64v8/ubuntu:22.04");
    assert!(graph
        .marshal()
        .contains("FROM --platform=linux/arm64 arm64v8/ubuntu:22.04"));
}

#[test]
fn env_directive_chain_spans_change_lists() {
    // base.changes run before provisioners; postChanges after. ENV values
    // set early are visible to late expansion.
    let config = template(
        r#"{
            "name": "box",
            "version": "1",
            "architectures": ["amd64"],
            "base": {"image": "alpine", "changes": ["ENV ROOT=/srv"]},
            "postChanges": ["ENV DATA $ROOT/data", "ENV MISSING $NOPE"]
        }"#,
    );
    let rendered = graph::compile(&config, Path::new("/ctx"), "")
        .unwrap()
        .marshal();
    assert!(rendered.contains("ENV DATA=\"/srv/data\""));
    // Unknown variables survive literally.
    assert!(rendered.contains("ENV MISSING=\"$NOPE\""));
}
