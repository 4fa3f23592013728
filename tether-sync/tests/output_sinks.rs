use std::fs;
use std::path::Path;

use tempfile::TempDir;
use tether_sync::{DrySink, FileSink, OutputSink, SyncError, WriteRequest, WriteResult};

fn write(sink: &mut dyn OutputSink, destination: &Path, contents: &str) -> WriteResult {
    sink.write(&WriteRequest {
        destination,
        contents,
        perms: None,
        backup: false,
    })
    .unwrap()
}

#[test]
fn file_sink_rewrites_only_on_change() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("app.conf");
    let mut sink: Box<dyn OutputSink> = Box::new(FileSink::new());

    assert!(write(sink.as_mut(), &path, "v1").changed());
    assert!(!write(sink.as_mut(), &path, "v1").changed());
    assert!(write(sink.as_mut(), &path, "v2").changed());
    assert_eq!(fs::read_to_string(&path).unwrap(), "v2");
}

#[test]
fn sinks_track_destinations_independently() {
    let tmp = TempDir::new().unwrap();
    let a = tmp.path().join("a.conf");
    let b = tmp.path().join("b.conf");
    let mut sink = DrySink::new(Vec::new());

    assert!(matches!(
        write(&mut sink, &a, "same"),
        WriteResult::WouldWrite { .. }
    ));
    assert!(matches!(
        write(&mut sink, &b, "same"),
        WriteResult::WouldWrite { .. }
    ));

    let echoed = String::from_utf8(sink.into_inner()).unwrap();
    assert!(echoed.contains(&format!("> {}", a.display())));
    assert!(echoed.contains(&format!("> {}", b.display())));
}

#[test]
#[cfg(unix)]
fn failed_write_leaves_original_and_cleans_tmp() {
    use std::os::unix::fs::PermissionsExt;

    let root = TempDir::new().unwrap();
    let readonly_dir = root.path().join("readonly");
    fs::create_dir_all(&readonly_dir).unwrap();
    let path = readonly_dir.join("app.conf");
    fs::write(&path, "original").unwrap();

    fs::set_permissions(&readonly_dir, fs::Permissions::from_mode(0o555)).unwrap();

    let result = FileSink::new().write(&WriteRequest {
        destination: &path,
        contents: "new content",
        perms: None,
        backup: false,
    });

    fs::set_permissions(&readonly_dir, fs::Permissions::from_mode(0o755)).unwrap();

    // Root bypasses directory permissions; only assert when the write failed.
    if let Err(err) = result {
        assert!(matches!(err, SyncError::Io { .. }), "got: {err}");
        assert_eq!(fs::read_to_string(&path).unwrap(), "original");
        assert!(!readonly_dir.join("app.conf.tether.tmp").exists());
    }
}
