use super::*;
use crate::entry::{EntryMetadata, OutputSource};
use kiln_core::Digest;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    store_root: PathBuf,
    work: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store_root = dir.path().join("cache");
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        Self {
            _dir: dir,
            store_root,
            work,
        }
    }

    fn open(&self) -> LocalCas {
        LocalCas::open(&self.store_root, EvictionKind::Lru).unwrap()
    }

    fn output(&self, name: &str, content: &[u8]) -> OutputSource {
        let path = self.work.join(name);
        fs::write(&path, content).unwrap();
        OutputSource {
            local_path: path,
            logical_path: format!("$OUT/{name}"),
        }
    }

    fn draft(&self, outputs: &[(&str, &[u8])]) -> EntryDraft {
        EntryDraft {
            outputs: outputs
                .iter()
                .map(|(name, content)| self.output(name, content))
                .collect(),
            metadata: EntryMetadata {
                rule: "cc".into(),
                task: "compile".into(),
                diagnostics: "warning: something".into(),
                discovered_inputs: vec!["$SRC/a.h".into()],
                base_key: None,
            },
        }
    }
}

fn key(name: &str) -> CacheKey {
    CacheKey::base(&Digest::of(name.as_bytes()))
}

fn make_writable(path: &Path) {
    let mut perms = fs::metadata(path).unwrap().permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(path, perms).unwrap();
}

#[tokio::test]
async fn store_then_lookup_round_trips_outputs() {
    let fx = Fixture::new();
    let cas = fx.open();
    let k = key("a");

    let outcome = cas
        .store(&k, fx.draft(&[("a.o", b"object"), ("a.d", b"deps")]))
        .await
        .unwrap();
    assert_eq!(outcome, StoreOutcome::Stored);

    let entry = cas.lookup(&k).await.unwrap().expect("hit");
    assert_eq!(entry.key, k);
    assert_eq!(entry.outputs.len(), 2);
    assert_eq!(entry.outputs[0].path, "$OUT/a.o");
    assert_eq!(entry.metadata.diagnostics, "warning: something");

    let dest = fx.work.join("restored");
    let destinations = vec![dest.join("a.o"), dest.join("a.d")];
    let written = cas
        .materialize(&entry, &destinations, MaterializeMode::Copy)
        .await
        .unwrap();
    assert_eq!(written.bytes(), 10);
    assert_eq!(fs::read(&destinations[0]).unwrap(), b"object");
    assert_eq!(fs::read(&destinations[1]).unwrap(), b"deps");

    // materialized copies stay writable even though blobs are read-only
    fs::write(&destinations[0], b"rebuilt").unwrap();
}

#[tokio::test]
async fn lookup_of_unknown_key_is_a_miss() {
    let fx = Fixture::new();
    let cas = fx.open();
    assert!(cas.lookup(&key("nothing")).await.unwrap().is_none());
}

#[tokio::test]
async fn storing_identical_payload_twice_is_a_no_op() {
    let fx = Fixture::new();
    let cas = fx.open();
    let k = key("a");

    cas.store(&k, fx.draft(&[("a.o", b"same")])).await.unwrap();
    let mut again = fx.draft(&[("a.o", b"same")]);
    again.metadata.diagnostics = "different diagnostics".into();
    assert_eq!(
        cas.store(&k, again).await.unwrap(),
        StoreOutcome::AlreadyPresent
    );
    assert_eq!(cas.usage().await.unwrap().entries, 1);

    let entry = cas.lookup(&k).await.unwrap().unwrap();
    assert_eq!(entry.metadata.diagnostics, "warning: something");
}

#[tokio::test]
async fn storing_different_payload_under_same_key_is_a_collision() {
    let fx = Fixture::new();
    let cas = fx.open();
    let k = key("a");

    cas.store(&k, fx.draft(&[("a.o", b"first")])).await.unwrap();
    let err = cas
        .store(&k, fx.draft(&[("a.o", b"second")]))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::KeyCollision { .. }));
    assert!(err.is_fatal());

    let entry = cas.lookup(&k).await.unwrap().unwrap();
    let dest = fx.work.join("check.o");
    cas.materialize(&entry, &[dest.clone()], MaterializeMode::Copy)
        .await
        .unwrap();
    assert_eq!(fs::read(dest).unwrap(), b"first");
}

#[tokio::test]
async fn missing_output_is_not_cacheable() {
    let fx = Fixture::new();
    let cas = fx.open();
    let draft = EntryDraft {
        outputs: vec![OutputSource {
            local_path: fx.work.join("never-written.o"),
            logical_path: "$OUT/never-written.o".into(),
        }],
        metadata: EntryMetadata::default(),
    };
    let err = cas.store(&key("a"), draft).await.unwrap_err();
    assert!(matches!(err, CacheError::NotCacheable { .. }));
    assert_eq!(cas.usage().await.unwrap().entries, 0);
    assert_eq!(fs::read_dir(fx.store_root.join("tmp")).unwrap().count(), 0);
}

#[tokio::test]
async fn identical_outputs_share_one_blob() {
    let fx = Fixture::new();
    let cas = fx.open();
    cas.store(&key("a"), fx.draft(&[("a.o", b"shared")])).await.unwrap();
    cas.store(&key("b"), fx.draft(&[("b.o", b"shared")])).await.unwrap();

    let usage = cas.usage().await.unwrap();
    assert_eq!(usage.entries, 2);
    assert_eq!(usage.blobs, 1);
    assert_eq!(usage.total_bytes.bytes(), 6);
}

#[tokio::test]
async fn index_survives_reopen() {
    let fx = Fixture::new();
    {
        let cas = fx.open();
        cas.store(&key("a"), fx.draft(&[("a.o", b"persisted")]))
            .await
            .unwrap();
        cas.record_dependency_set(&key("base"), vec!["$SRC/a.h".into()])
            .await
            .unwrap();
        cas.flush().await.unwrap();
    }
    let cas = fx.open();
    assert!(cas.startup_recovery().is_none());
    assert!(cas.lookup(&key("a")).await.unwrap().is_some());
    assert_eq!(
        cas.dependency_sets(&key("base")).await.unwrap(),
        vec![vec!["$SRC/a.h".to_string()]]
    );
}

#[tokio::test]
async fn second_open_of_same_root_is_refused() {
    let fx = Fixture::new();
    let _first = fx.open();
    let err = LocalCas::open(&fx.store_root, EvictionKind::Lru).unwrap_err();
    assert!(matches!(err, CacheError::StoreUnavailable { .. }));
}

#[tokio::test]
async fn truncated_blob_turns_lookup_into_error_and_drops_the_entry() {
    let fx = Fixture::new();
    let cas = fx.open();
    let k = key("a");
    cas.store(&k, fx.draft(&[("a.o", b"intact bytes")])).await.unwrap();

    let blob = fx
        .store_root
        .join("objects")
        .join(Digest::of(b"intact bytes").shard())
        .join(Digest::of(b"intact bytes").to_hex());
    make_writable(&blob);
    fs::write(&blob, b"short").unwrap();

    assert!(cas.lookup(&k).await.is_err());
    assert!(cas.lookup(&k).await.unwrap().is_none());
}

#[tokio::test]
async fn validate_is_skipped_when_nothing_changed() {
    let fx = Fixture::new();
    let cas = fx.open();
    cas.store(&key("a"), fx.draft(&[("a.o", b"x")])).await.unwrap();

    let first = cas.validate().await.unwrap();
    assert!(!first.skipped);
    assert!(first.is_healthy());
    assert_eq!(first.checked_entries, 1);

    let second = cas.validate().await.unwrap();
    assert!(second.skipped);

    cas.store(&key("b"), fx.draft(&[("b.o", b"y")])).await.unwrap();
    assert!(!cas.validate().await.unwrap().skipped);
}

#[tokio::test]
async fn validate_reports_corrupt_blob_and_recover_drops_entry() {
    let fx = Fixture::new();
    let cas = fx.open();
    cas.store(&key("good"), fx.draft(&[("good.o", b"good")])).await.unwrap();
    cas.store(&key("bad"), fx.draft(&[("bad.o", b"bad!")])).await.unwrap();

    let digest = Digest::of(b"bad!");
    let blob = fx
        .store_root
        .join("objects")
        .join(digest.shard())
        .join(digest.to_hex());
    make_writable(&blob);
    // same length, different bytes: only a rehash catches it
    fs::write(&blob, b"BAD!").unwrap();

    let report = cas.validate().await.unwrap();
    assert!(!report.is_healthy());
    assert_eq!(report.corrupt_blobs, vec![digest.to_hex()]);

    let recovered = cas.recover().await.unwrap();
    assert_eq!(recovered.recovered_entries, 1);
    assert_eq!(recovered.dropped_entries, vec![key("bad").to_string()]);

    assert!(cas.lookup(&key("bad")).await.unwrap().is_none());
    assert!(cas.lookup(&key("good")).await.unwrap().is_some());
    assert!(cas.validate().await.unwrap().is_healthy());
}

#[tokio::test]
async fn unreadable_index_is_rebuilt_on_open() {
    let fx = Fixture::new();
    {
        let cas = fx.open();
        cas.store(&key("a"), fx.draft(&[("a.o", b"kept")])).await.unwrap();
        cas.flush().await.unwrap();
    }
    fs::write(fx.store_root.join("index.json"), b"{ truncated").unwrap();
    fs::write(fx.store_root.join("tmp").join("partial"), b"half").unwrap();

    let cas = fx.open();
    let report = cas.startup_recovery().expect("rebuilt on open");
    assert_eq!(report.recovered_entries, 1);
    assert_eq!(report.removed_partials, 1);
    assert!(cas.lookup(&key("a")).await.unwrap().is_some());
}

#[tokio::test]
async fn incompatible_index_version_is_rebuilt_on_open() {
    let fx = Fixture::new();
    {
        let cas = fx.open();
        cas.store(&key("a"), fx.draft(&[("a.o", b"kept")])).await.unwrap();
        cas.flush().await.unwrap();
    }
    let path = fx.store_root.join("index.json");
    let mut raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    raw["format_version"] = serde_json::json!(kiln_core::CACHE_FORMAT_VERSION + 1);
    fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

    let cas = fx.open();
    assert!(cas.startup_recovery().is_some());
    assert!(cas.lookup(&key("a")).await.unwrap().is_some());
}

#[tokio::test]
async fn prune_evicts_least_recently_used_until_under_limit() {
    let fx = Fixture::new();
    let cas = fx.open();
    cas.store(&key("old"), fx.draft(&[("old.o", &[1u8; 100])])).await.unwrap();
    cas.store(&key("mid"), fx.draft(&[("mid.o", &[2u8; 100])])).await.unwrap();
    cas.store(&key("new"), fx.draft(&[("new.o", &[3u8; 100])])).await.unwrap();
    // touching "old" makes "mid" the least recently used
    cas.lookup(&key("old")).await.unwrap().unwrap();

    let report = cas.prune(ByteCount::new(250)).await.unwrap();
    assert_eq!(report.evicted, vec![key("mid").to_string()]);
    assert_eq!(report.final_size.bytes(), 200);
    assert_eq!(report.reclaimed_bytes.bytes(), 100);
    assert!(cas.lookup(&key("mid")).await.unwrap().is_none());
    assert!(cas.lookup(&key("old")).await.unwrap().is_some());
}

#[tokio::test]
async fn prune_never_evicts_entries_used_in_the_active_epoch() {
    let fx = Fixture::new();
    let cas = fx.open();
    cas.store(&key("stale"), fx.draft(&[("stale.o", &[1u8; 100])])).await.unwrap();
    cas.store(&key("pinned"), fx.draft(&[("pinned.o", &[2u8; 100])])).await.unwrap();

    cas.begin_epoch().await.unwrap();
    cas.store(&key("fresh"), fx.draft(&[("fresh.o", &[3u8; 100])])).await.unwrap();
    cas.pin(&key("pinned")).await.unwrap();

    let report = cas.prune(ByteCount::ZERO).await.unwrap();
    assert_eq!(report.evicted, vec![key("stale").to_string()]);
    assert_eq!(report.skipped_pinned, 2);
    assert!(cas.lookup(&key("pinned")).await.unwrap().is_some());
    assert!(cas.lookup(&key("fresh")).await.unwrap().is_some());

    cas.end_epoch().await.unwrap();
    let after = cas.prune(ByteCount::ZERO).await.unwrap();
    assert_eq!(after.evicted.len(), 2);
    assert_eq!(cas.usage().await.unwrap().total_bytes, ByteCount::ZERO);
}

#[tokio::test]
async fn prune_keeps_blobs_still_referenced_by_surviving_entries() {
    let fx = Fixture::new();
    let cas = fx.open();
    cas.store(&key("a"), fx.draft(&[("a.o", b"shared"), ("a.x", b"only-a")]))
        .await
        .unwrap();
    cas.store(&key("b"), fx.draft(&[("b.o", b"shared")])).await.unwrap();
    cas.lookup(&key("b")).await.unwrap().unwrap();

    let report = cas.prune(ByteCount::new(6)).await.unwrap();
    assert_eq!(report.evicted, vec![key("a").to_string()]);
    assert_eq!(report.removed_blobs, 1);

    let entry = cas.lookup(&key("b")).await.unwrap().unwrap();
    let dest = fx.work.join("b-restored.o");
    cas.materialize(&entry, &[dest.clone()], MaterializeMode::Copy)
        .await
        .unwrap();
    assert_eq!(fs::read(dest).unwrap(), b"shared");
}

#[tokio::test]
async fn prune_removes_orphan_blobs() {
    let fx = Fixture::new();
    let cas = fx.open();
    let orphan_digest = Digest::of(b"orphan");
    let orphan = fx
        .store_root
        .join("objects")
        .join(orphan_digest.shard())
        .join(orphan_digest.to_hex());
    fs::create_dir_all(orphan.parent().unwrap()).unwrap();
    fs::write(&orphan, b"orphan").unwrap();

    let report = cas.prune(ByteCount::new(1_000_000)).await.unwrap();
    assert_eq!(report.removed_blobs, 1);
    assert!(report.evicted.is_empty());
    assert!(!orphan.exists());
}

#[tokio::test]
async fn hardlink_materialization_shares_the_blob() {
    let fx = Fixture::new();
    let cas = fx.open();
    cas.store(&key("a"), fx.draft(&[("a.o", b"linked")])).await.unwrap();
    let entry = cas.lookup(&key("a")).await.unwrap().unwrap();

    let dest = fx.work.join("linked.o");
    cas.materialize(&entry, &[dest.clone()], MaterializeMode::Hardlink)
        .await
        .unwrap();
    assert_eq!(fs::read(&dest).unwrap(), b"linked");
}

#[tokio::test]
async fn materialize_rejects_mismatched_destinations() {
    let fx = Fixture::new();
    let cas = fx.open();
    cas.store(&key("a"), fx.draft(&[("a.o", b"1"), ("b.o", b"2")]))
        .await
        .unwrap();
    let entry = cas.lookup(&key("a")).await.unwrap().unwrap();
    assert!(cas
        .materialize(&entry, &[fx.work.join("only-one")], MaterializeMode::Copy)
        .await
        .is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn executable_bit_is_preserved() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    let cas = fx.open();
    let source = fx.output("tool", b"#!/bin/sh\n");
    fs::set_permissions(&source.local_path, fs::Permissions::from_mode(0o755)).unwrap();
    cas.store(
        &key("tool"),
        EntryDraft {
            outputs: vec![source],
            metadata: EntryMetadata::default(),
        },
    )
    .await
    .unwrap();

    let entry = cas.lookup(&key("tool")).await.unwrap().unwrap();
    assert!(entry.outputs[0].executable);
    let dest = fx.work.join("restored-tool");
    cas.materialize(&entry, &[dest.clone()], MaterializeMode::Copy)
        .await
        .unwrap();
    assert_ne!(fs::metadata(dest).unwrap().permissions().mode() & 0o111, 0);
}

#[tokio::test]
async fn prune_and_recover_forget_dependency_sets_without_entries() {
    let fx = Fixture::new();
    let cas = fx.open();
    let live = key("live-base");
    let stale = key("stale-base");

    let mut draft = fx.draft(&[("a.o", b"object")]);
    draft.metadata.base_key = Some(live);
    cas.store(&key("a"), draft).await.unwrap();
    cas.record_dependency_set(&live, vec!["$SRC/a.h".into()]).await.unwrap();
    // an older edit of the same source whose entry is long gone
    cas.record_dependency_set(&stale, vec!["$SRC/old.h".into()]).await.unwrap();

    let report = cas.prune(ByteCount::new(1 << 20)).await.unwrap();
    assert!(report.evicted.is_empty());
    assert_eq!(report.dropped_dependency_sets, 1);
    assert!(cas.dependency_sets(&stale).await.unwrap().is_empty());
    assert_eq!(
        cas.dependency_sets(&live).await.unwrap(),
        vec![vec!["$SRC/a.h".to_string()]]
    );

    cas.record_dependency_set(&stale, vec!["$SRC/old.h".into()]).await.unwrap();
    cas.recover().await.unwrap();
    assert!(cas.dependency_sets(&stale).await.unwrap().is_empty());
    assert_eq!(cas.dependency_sets(&live).await.unwrap().len(), 1);

    // evicting the only entry releases its base key too
    let report = cas.prune(ByteCount::ZERO).await.unwrap();
    assert_eq!(report.evicted.len(), 1);
    assert_eq!(report.dropped_dependency_sets, 1);
    assert!(cas.dependency_sets(&live).await.unwrap().is_empty());
}
