use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use rstest::rstest;
use tempfile::TempDir;
use tether_core::{
    Dependency, DependencyValue, KeyPair, ServiceInstance, TemplateConfig, Values,
};
use tether_renderer::{RenderError, RenderOutcome, Template};

fn snapshot() -> Arc<Values> {
    let mut values = Values::new();
    values.insert(
        Dependency::key("app/name"),
        DependencyValue::Key(Some("billing".into())),
    );
    values.insert(
        Dependency::key_prefix("app/limits/"),
        DependencyValue::KeyPrefix(vec![
            KeyPair {
                key: "cpu".into(),
                value: "2".into(),
            },
            KeyPair {
                key: "mem".into(),
                value: "512M".into(),
            },
        ]),
    );
    values.insert(
        Dependency::service("web", Some("canary")),
        DependencyValue::Service(vec![ServiceInstance {
            id: "web-1".into(),
            name: "web".into(),
            node: "node-1".into(),
            address: "10.0.0.1".into(),
            port: 8080,
            tags: vec!["canary".into()],
        }]),
    );
    Arc::new(values)
}

fn ready(outcome: RenderOutcome) -> (String, BTreeSet<Dependency>) {
    match outcome {
        RenderOutcome::Ready {
            contents,
            dependencies,
        } => (contents, dependencies),
        other => panic!("expected Ready, got {other:?}"),
    }
}

#[test]
fn compiles_from_source_file() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("app.conf.tera");
    std::fs::write(
        &source,
        r#"name = {{ key(path="app/name") }}
{% for kv in keys(prefix="app/limits/") -%}
{{ kv.key }} = {{ kv.value }}
{% endfor -%}
{% for s in service(name="web", tag="canary") -%}
upstream {{ s.address }}:{{ s.port }}
{% endfor -%}"#,
    )
    .unwrap();

    let config = TemplateConfig {
        source: Some(source),
        destination: dir.path().join("app.conf"),
        ..TemplateConfig::default()
    };
    let template = Template::compile(&config).unwrap();
    assert_eq!(template.name(), config.id());

    let (contents, dependencies) = ready(template.render(snapshot()).unwrap());
    assert_eq!(
        contents,
        "name = billing\ncpu = 2\nmem = 512M\nupstream 10.0.0.1:8080\n"
    );
    assert_eq!(
        dependencies,
        BTreeSet::from([
            Dependency::key("app/name"),
            Dependency::key_prefix("app/limits/"),
            Dependency::service("web", Some("canary")),
        ])
    );
}

#[test]
fn missing_source_file_is_io_error() {
    let config = TemplateConfig {
        source: Some(PathBuf::from("/nonexistent/tether/template.tera")),
        destination: PathBuf::from("out"),
        ..TemplateConfig::default()
    };
    let err = Template::compile(&config).unwrap_err();
    assert!(matches!(err, RenderError::Io { .. }), "got: {err}");
}

#[test]
fn inline_contents_take_precedence() {
    let config = TemplateConfig {
        contents: Some("inline".into()),
        destination: PathBuf::from("out"),
        ..TemplateConfig::default()
    };
    let template = Template::compile(&config).unwrap();
    let (contents, _) = ready(template.render(Arc::new(Values::new())).unwrap());
    assert_eq!(contents, "inline");
}

#[test]
fn one_pass_discovers_every_reachable_dependency() {
    let template = Template::from_contents(
        "t",
        r#"{{ key(path="a") }}{{ key(path="b") }}{% for s in service(name="db") %}{{ s.id }}{% endfor %}"#,
    )
    .unwrap();
    match template.render(Arc::new(Values::new())).unwrap() {
        RenderOutcome::NotReady {
            dependencies,
            missing,
        } => {
            assert_eq!(dependencies, missing);
            assert_eq!(dependencies.len(), 3);
        }
        other => panic!("expected NotReady, got {other:?}"),
    }
}

#[rstest]
#[case::present(r#"{{ key_or_default(path="app/name", default="x") }}"#, "billing")]
#[case::absent_from_store(r#"{{ key_or_default(path="app/other", default="x") }}"#, "x")]
fn key_or_default(#[case] source: &str, #[case] expected: &str) {
    let mut values = (*snapshot()).clone();
    values.insert(Dependency::key("app/other"), DependencyValue::Key(None));
    let template = Template::from_contents("t", source).unwrap();
    let (contents, _) = ready(template.render(Arc::new(values)).unwrap());
    assert_eq!(contents, expected);
}

#[test]
fn env_function_reads_process_environment() {
    std::env::set_var("TETHER_RENDER_TEST_VAR", "from-env");
    let template =
        Template::from_contents("t", r#"{{ env(name="TETHER_RENDER_TEST_VAR") }}"#).unwrap();
    let (contents, dependencies) = ready(template.render(Arc::new(Values::new())).unwrap());
    assert_eq!(contents, "from-env");
    assert!(dependencies.is_empty());
}
