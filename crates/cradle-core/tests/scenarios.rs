//! End-to-end scenarios through the public engine API.

use cradle_core::{diff, Collaborators, CoreError, Engine};
use cradle_runtime::mock::{mock_site_packages_rel, MockTooling, MockVcs};
use cradle_schema::{CradleConfig, InstallSource, Installation, NodeDelta};
use cradle_store::{CancelToken, InstallLayout, NoProgress, ProgressEvent};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

fn seed_master(layout: &InstallLayout) {
    let site = layout.master_env_dir().join(mock_site_packages_rel());
    fs::create_dir_all(&site).unwrap();
    fs::write(site.join("a.py"), "a").unwrap();
    fs::write(site.join("b.py"), "b").unwrap();
    fs::write(site.join("c.py"), "c").unwrap();
}

fn engine_with(root: &Path, tooling: MockTooling, vcs: Arc<MockVcs>) -> Engine {
    let collaborators = Collaborators {
        tooling: Arc::new(tooling),
        vcs,
        ..Collaborators::mock()
    };
    Engine::with_collaborators(root, CradleConfig::default(), collaborators)
}

#[test]
fn failed_environment_creation_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let layout = InstallLayout::new(dir.path());
    seed_master(&layout);
    // A directory already sitting where c.py must go makes the third copy fail.
    let tooling = MockTooling::new().poison_site_packages("c.py");
    let engine = engine_with(dir.path(), tooling, Arc::new(MockVcs::new()));

    let err = engine
        .envs()
        .create("test", &NoProgress, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, CoreError::Store(_)), "unexpected error: {err}");
    assert!(!layout.env_path("test").exists());
    assert!(engine.envs().list().unwrap().is_empty());
}

#[test]
fn environment_copy_reports_every_file() {
    let dir = tempfile::tempdir().unwrap();
    let layout = InstallLayout::new(dir.path());
    seed_master(&layout);
    let engine = engine_with(dir.path(), MockTooling::new(), Arc::new(MockVcs::new()));
    let events = Mutex::new(Vec::new());
    let sink = |e: ProgressEvent| events.lock().unwrap().push(e);

    engine
        .envs()
        .create("test", &sink, &CancelToken::new())
        .unwrap();

    let site = layout.env_path("test").join(mock_site_packages_rel());
    for f in ["a.py", "b.py", "c.py"] {
        assert!(site.join(f).is_file(), "{f} missing");
    }
    let events = events.into_inner().unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.percent, 100);
    assert!(last.status.contains("3/3"), "{}", last.status);
    let percents: Vec<i32> = events
        .iter()
        .filter(|e| !e.is_indeterminate())
        .map(|e| e.percent)
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn disabled_node_is_diffed_and_restored() {
    let dir = tempfile::tempdir().unwrap();
    let layout = InstallLayout::new(dir.path());
    seed_master(&layout);
    fs::create_dir_all(layout.env_path("default")).unwrap();
    let node = layout.custom_nodes_dir().join("X");
    fs::create_dir_all(&node).unwrap();
    fs::write(node.join("__init__.py"), "").unwrap();

    let engine = engine_with(dir.path(), MockTooling::new(), Arc::new(MockVcs::new()));
    let summary = engine
        .snapshots()
        .save("default", "with X", &CancelToken::new())
        .unwrap();
    assert_eq!(summary.node_count, 1);

    // The user disables X after the snapshot; restoring turns it back on.
    fs::create_dir_all(layout.disabled_nodes_dir()).unwrap();
    fs::rename(&node, layout.disabled_nodes_dir().join("X")).unwrap();

    let (snapshot, delta) = engine.diff_against(&summary.filename).unwrap();
    assert!(delta.added.is_empty());
    assert!(delta.removed.is_empty());
    assert_eq!(delta.changed.len(), 1);
    assert_eq!(delta.changed[0].id.as_str(), "X");
    assert_eq!(delta.changed[0].enabled_delta(), Some((true, false)));
    assert!(delta.changed[0]
        .deltas
        .iter()
        .any(|d| matches!(d, NodeDelta::Enabled { .. })));
    assert_eq!(diff(&snapshot.nodes, &engine.scan().unwrap()), delta);

    let outcome = engine
        .restore_from_snapshot(&summary.filename, &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(outcome.report.enabled.len(), 1);
    assert!(node.is_dir());
    assert!(!layout.disabled_nodes_dir().join("X").exists());
}

#[test]
fn node_enabled_since_snapshot_is_disabled_again() {
    let dir = tempfile::tempdir().unwrap();
    let layout = InstallLayout::new(dir.path());
    seed_master(&layout);
    fs::create_dir_all(layout.env_path("default")).unwrap();
    fs::create_dir_all(layout.disabled_nodes_dir().join("X")).unwrap();

    let engine = engine_with(dir.path(), MockTooling::new(), Arc::new(MockVcs::new()));
    let summary = engine
        .snapshots()
        .save("default", "X off", &CancelToken::new())
        .unwrap();
    fs::rename(
        layout.disabled_nodes_dir().join("X"),
        layout.custom_nodes_dir().join("X"),
    )
    .unwrap();

    let outcome = engine
        .restore_from_snapshot(&summary.filename, &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(outcome.report.disabled.len(), 1);
    assert_eq!(outcome.report.disabled[0].as_str(), "X");
    assert!(!layout.custom_nodes_dir().join("X").exists());
}

#[test]
fn restore_checks_out_snapshot_commit_after_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let layout = InstallLayout::new(dir.path());
    seed_master(&layout);
    fs::create_dir_all(layout.env_path("default")).unwrap();
    let repo = layout.custom_nodes_dir().join("impact-pack");
    fs::create_dir_all(&repo).unwrap();

    let vcs = Arc::new(MockVcs::new());
    // Shallow clone: the pinned commit only exists upstream.
    vcs.add_repo(&repo, "pinned", &[]).unwrap();
    let engine = engine_with(dir.path(), MockTooling::new(), Arc::clone(&vcs));
    let summary = engine
        .snapshots()
        .save("default", "pinned", &CancelToken::new())
        .unwrap();

    // Simulate a re-clone at a newer commit that lacks the pinned one.
    fs::remove_dir_all(&repo).unwrap();
    fs::create_dir_all(&repo).unwrap();
    vcs.add_repo(&repo, "newer", &["pinned"]).unwrap();

    let outcome = engine
        .restore_from_snapshot(&summary.filename, &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(outcome.report.checked_out.len(), 1);
    let checked = &outcome.report.checked_out[0];
    assert_eq!(checked.commit, "pinned");
    assert!(checked.fetched);
    assert!(vcs.calls().contains(&"fetch impact-pack".to_owned()));
}

#[test]
fn engine_rejects_local_actions_on_remote_installations() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(dir.path(), MockTooling::new(), Arc::new(MockVcs::new()));
    let installation = Installation::new(
        "remote",
        dir.path(),
        InstallSource::Remote {
            url: "http://10.0.0.5:8188".to_owned(),
        },
    );
    let err = cradle_core::handle_action(
        &engine,
        &installation,
        &cradle_schema::InstallAction::Snapshot {
            label: "x".to_owned(),
        },
        &NoProgress,
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::Unsupported { .. }));
}
