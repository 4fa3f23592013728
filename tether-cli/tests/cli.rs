use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tether() -> Command {
    let mut cmd = Command::cargo_bin("tether").expect("tether binary");
    cmd.env_remove("CONSUL_HTTP_ADDR")
        .env_remove("CONSUL_HTTP_TOKEN")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn help_lists_flags() {
    tether()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--consul-addr"))
        .stdout(predicate::str::contains("--template"));
}

#[test]
fn version_prints_package_version() {
    tether()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn extra_arguments_exit_13() {
    tether()
        .args(["--once", "foo"])
        .assert()
        .code(13)
        .stderr(predicate::str::contains("extra args"));
}

#[test]
fn unknown_flag_exits_13() {
    tether().arg("--bogus").assert().code(13);
}

#[test]
fn bad_wait_is_a_config_error() {
    tether()
        .args(["--template", "in:out", "--wait", "soon"])
        .assert()
        .code(15)
        .stderr(predicate::str::contains("invalid duration"));
}

#[test]
fn missing_template_source_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let spec = format!(
        "{}:{}",
        dir.path().join("absent.tmpl").display(),
        dir.path().join("out").display()
    );
    tether()
        .args(["--once", "--dry", "--template", &spec])
        .assert()
        .code(15);
}

#[test]
fn once_dry_prints_static_template_and_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("motd.tmpl");
    let destination = dir.path().join("motd");
    std::fs::write(&source, "hello from tether").unwrap();

    tether()
        .args([
            "--once",
            "--dry",
            "--template",
            &format!("{}:{}", source.display(), destination.display()),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("> {}", destination.display())))
        .stdout(predicate::str::contains("hello from tether"));

    assert!(!destination.exists(), "dry mode must not write");
}

#[test]
fn config_file_templates_render_with_flag_overrides() {
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("app.conf");
    let config = dir.path().join("tether.yaml");
    std::fs::write(
        &config,
        format!(
            "consul:\n  address: 127.0.0.1:1\ntemplates:\n  - contents: \"port = 8080\"\n    destination: {}\n",
            destination.display()
        ),
    )
    .unwrap();

    tether()
        .args(["--config", config.to_str().unwrap(), "--once"])
        .assert()
        .success();

    assert_eq!(std::fs::read_to_string(&destination).unwrap(), "port = 8080");
}
