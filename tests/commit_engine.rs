//! Commit engine end-to-end: apply, backup, rollback, and the journal
//! state machine, exercised against a scratch root via `root_prefix`.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use atomic_shell::commit::CommitEngine;
use atomic_shell::journal::{self, Journal, State};
use atomic_shell::types::{EngineError, NodeType, Operation};
use time::OffsetDateTime;

struct Fixture {
    _td: tempfile::TempDir,
    root: PathBuf,
    stage: PathBuf,
    journal_path: PathBuf,
    backup_dir: PathBuf,
    run_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let td = tempfile::tempdir().unwrap();
        let root = td.path().join("root");
        let stage = td.path().join("stage");
        let backup_dir = td.path().join("backups");
        let run_dir = td.path().join("run");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&stage).unwrap();
        fs::create_dir_all(&run_dir).unwrap();
        let journal_path = td.path().join("journal/run.json");
        Self { _td: td, root, stage, journal_path, backup_dir, run_dir }
    }

    fn engine(&self) -> CommitEngine {
        CommitEngine::new(self.root.clone())
    }

    fn journal(&self, ops: Vec<Operation>) -> Journal {
        Journal {
            run_id: "run".to_string(),
            state: State::Committing,
            ops,
            applied_index: -1,
            backup_refs: BTreeMap::new(),
            txn_start: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            run_dir: self.run_dir.clone(),
            backup_dir: self.backup_dir.clone(),
            keep_artifacts: false,
        }
    }

    fn stage_file(&self, rel: &str, contents: &[u8], mode: u32) -> PathBuf {
        let path = self.stage.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn live(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

#[test]
fn apply_commits_a_new_file_and_reaches_committed() {
    let fx = Fixture::new();
    let source = fx.stage_file("target.txt", b"committed\n", 0o644);
    let op = Operation::upsert(PathBuf::from("/tmp/t/target.txt"), source, NodeType::File);

    let mut j = fx.journal(vec![op]);
    fx.engine().apply(&fx.journal_path, &mut j).unwrap();

    assert_eq!(j.state, State::Committed);
    assert_eq!(j.applied_index, 0);
    let live = fx.live("tmp/t/target.txt");
    assert_eq!(fs::read(&live).unwrap(), b"committed\n");
    // The target did not exist before; its backup ref is a tombstone.
    let backup = &j.backup_refs[Path::new("/tmp/t/target.txt")];
    assert!(!backup.exists);
    // The persisted record agrees.
    let on_disk = journal::load(&fx.journal_path).unwrap();
    assert_eq!(on_disk.state, State::Committed);
    assert_eq!(on_disk.applied_index, 0);
}

#[test]
fn apply_replaces_file_content_atomically_and_preserves_staged_mode() {
    let fx = Fixture::new();
    let live = fx.live("etc/app.conf");
    fs::create_dir_all(live.parent().unwrap()).unwrap();
    fs::write(&live, b"old").unwrap();

    let source = fx.stage_file("app.conf", b"new", 0o640);
    let op = Operation::upsert(PathBuf::from("/etc/app.conf"), source, NodeType::File);
    let mut j = fx.journal(vec![op]);
    fx.engine().apply(&fx.journal_path, &mut j).unwrap();

    assert_eq!(fs::read(&live).unwrap(), b"new");
    assert_eq!(fs::metadata(&live).unwrap().permissions().mode() & 0o777, 0o640);
    // No staging litter next to the target.
    assert!(!fx.live("etc/app.conf.atomic.tmp").exists());
    // The pre-image was captured before mutation.
    let backup = &j.backup_refs[Path::new("/etc/app.conf")];
    assert!(backup.exists);
    assert_eq!(fs::read(&backup.path).unwrap(), b"old");
}

#[test]
fn delete_removes_target_and_tolerates_absence() {
    let fx = Fixture::new();
    let live = fx.live("tmp/t/delete-me.txt");
    fs::create_dir_all(live.parent().unwrap()).unwrap();
    fs::write(&live, b"bye").unwrap();

    let mut j = fx.journal(vec![
        Operation::delete(PathBuf::from("/tmp/t/delete-me.txt")),
        Operation::delete(PathBuf::from("/tmp/t/never-existed.txt")),
    ]);
    fx.engine().apply(&fx.journal_path, &mut j).unwrap();

    assert_eq!(j.state, State::Committed);
    assert!(!live.exists());
    assert!(!j.backup_refs[Path::new("/tmp/t/never-existed.txt")].exists);
}

#[test]
fn opaque_directory_erases_prior_contents_before_repopulating() {
    let fx = Fixture::new();
    let live_dir = fx.live("etc/app");
    fs::create_dir_all(&live_dir).unwrap();
    fs::write(live_dir.join("stale.conf"), b"stale").unwrap();

    fx.stage_file("app/fresh.conf", b"fresh", 0o644);
    let mut op = Operation::upsert(
        PathBuf::from("/etc/app"),
        fx.stage.join("app"),
        NodeType::Directory,
    );
    op.opaque = true;

    let mut j = fx.journal(vec![op]);
    fx.engine().apply(&fx.journal_path, &mut j).unwrap();

    assert!(!live_dir.join("stale.conf").exists());
    assert_eq!(fs::read(live_dir.join("fresh.conf")).unwrap(), b"fresh");
}

#[test]
fn plain_directory_upsert_merges_into_existing_contents() {
    let fx = Fixture::new();
    let live_dir = fx.live("srv/data");
    fs::create_dir_all(&live_dir).unwrap();
    fs::write(live_dir.join("kept.txt"), b"kept").unwrap();

    fx.stage_file("data/added.txt", b"added", 0o644);
    let op = Operation::upsert(
        PathBuf::from("/srv/data"),
        fx.stage.join("data"),
        NodeType::Directory,
    );
    let mut j = fx.journal(vec![op]);
    fx.engine().apply(&fx.journal_path, &mut j).unwrap();

    assert_eq!(fs::read(live_dir.join("kept.txt")).unwrap(), b"kept");
    assert_eq!(fs::read(live_dir.join("added.txt")).unwrap(), b"added");
}

#[test]
fn symlink_upsert_replaces_existing_node() {
    let fx = Fixture::new();
    let live = fx.live("usr/local/bin/tool");
    fs::create_dir_all(live.parent().unwrap()).unwrap();
    fs::write(&live, b"a binary").unwrap();

    let staged = fx.stage.join("tool");
    std::os::unix::fs::symlink("/opt/tool-2.0/bin/tool", &staged).unwrap();
    let op = Operation::upsert(PathBuf::from("/usr/local/bin/tool"), staged, NodeType::Symlink);

    let mut j = fx.journal(vec![op]);
    fx.engine().apply(&fx.journal_path, &mut j).unwrap();

    assert_eq!(
        fs::read_link(&live).unwrap(),
        PathBuf::from("/opt/tool-2.0/bin/tool")
    );
}

#[test]
fn failed_op_rolls_back_every_earlier_mutation() {
    let fx = Fixture::new();
    // Pre-existing file with distinctive mode and content.
    let live_a = fx.live("tmp/t/a");
    fs::create_dir_all(live_a.parent().unwrap()).unwrap();
    fs::write(&live_a, b"old").unwrap();
    fs::set_permissions(&live_a, fs::Permissions::from_mode(0o640)).unwrap();

    let good = Operation::upsert(
        PathBuf::from("/tmp/t/a"),
        fx.stage_file("a", b"new contents", 0o600),
        NodeType::File,
    );
    // Later op whose staging source is missing: apply fails mid-commit.
    let bad = Operation::upsert(
        PathBuf::from("/tmp/t/b"),
        fx.stage.join("does-not-exist"),
        NodeType::File,
    );

    let mut j = fx.journal(vec![good, bad]);
    let err = fx.engine().apply(&fx.journal_path, &mut j).unwrap_err();
    match err {
        EngineError::Commit { rolled_back, .. } => assert!(rolled_back),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(j.state, State::RolledBack);
    // The mutated file is byte-identical to its pre-image, mode included.
    assert_eq!(fs::read(&live_a).unwrap(), b"old");
    assert_eq!(fs::metadata(&live_a).unwrap().permissions().mode() & 0o777, 0o640);
    // The failed op's target never existed and must not exist now.
    assert!(!fx.live("tmp/t/b").exists());
}

#[test]
fn rollback_removes_targets_created_during_commit() {
    let fx = Fixture::new();
    let created = Operation::upsert(
        PathBuf::from("/opt/new/file.txt"),
        fx.stage_file("file.txt", b"fresh", 0o644),
        NodeType::File,
    );
    let bad = Operation::upsert(
        PathBuf::from("/opt/other"),
        fx.stage.join("missing"),
        NodeType::File,
    );
    let mut j = fx.journal(vec![created, bad]);
    let _ = fx.engine().apply(&fx.journal_path, &mut j).unwrap_err();

    assert_eq!(j.state, State::RolledBack);
    assert!(!fx.live("opt/new/file.txt").exists(), "tombstone restore must remove the file");
}

#[test]
fn resume_continues_from_applied_index() {
    let fx = Fixture::new();
    let first = Operation::upsert(
        PathBuf::from("/data/one"),
        fx.stage_file("one", b"1", 0o644),
        NodeType::File,
    );
    let second = Operation::upsert(
        PathBuf::from("/data/two"),
        fx.stage_file("two", b"2", 0o644),
        NodeType::File,
    );

    // Simulate a prior partial commit: op 0 applied and recorded.
    let mut j = fx.journal(vec![first, second]);
    fs::create_dir_all(fx.live("data")).unwrap();
    fs::write(fx.live("data/one"), b"1").unwrap();
    j.applied_index = 0;
    j.backup_refs
        .insert(PathBuf::from("/data/one"), Default::default());
    journal::save(&fx.journal_path, &j).unwrap();

    fx.engine().apply(&fx.journal_path, &mut j).unwrap();
    assert_eq!(j.state, State::Committed);
    assert_eq!(j.applied_index, 1);
    assert_eq!(fs::read(fx.live("data/two")).unwrap(), b"2");
}

#[test]
fn crash_between_apply_and_index_persist_reapplies_without_retaking_backup() {
    // Crash model: op 0 was applied and its backup ref persisted, but the
    // process died before applied_index advanced. Resume must re-run the op
    // idempotently and must not overwrite the recorded pre-image.
    let fx = Fixture::new();
    let live = fx.live("cfg/x");
    fs::create_dir_all(live.parent().unwrap()).unwrap();
    fs::write(&live, b"original").unwrap();

    let op = Operation::upsert(
        PathBuf::from("/cfg/x"),
        fx.stage_file("x", b"staged", 0o644),
        NodeType::File,
    );
    let mut j = fx.journal(vec![op]);

    // First pass: backup captured, op applied, crash before index persist.
    let backup_path = fx.backup_dir.join("cfg/x");
    fs::create_dir_all(backup_path.parent().unwrap()).unwrap();
    fs::copy(&live, &backup_path).unwrap();
    j.backup_refs.insert(
        PathBuf::from("/cfg/x"),
        atomic_shell::types::BackupRef { exists: true, path: backup_path.clone() },
    );
    fs::write(&live, b"staged").unwrap();
    journal::save(&fx.journal_path, &j).unwrap();
    assert_eq!(j.applied_index, -1);

    fx.engine().apply(&fx.journal_path, &mut j).unwrap();
    assert_eq!(j.state, State::Committed);
    assert_eq!(j.applied_index, 0);
    assert_eq!(fs::read(&live).unwrap(), b"staged");
    // The pre-image survived the re-run untouched.
    assert_eq!(fs::read(&backup_path).unwrap(), b"original");
    assert_eq!(j.backup_refs.len(), 1);
}
