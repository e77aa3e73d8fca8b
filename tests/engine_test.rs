//! End-to-end engine tests against the in-memory store: round-trips,
//! skip logic, retry and resume behaviour, bulk tallies, and removal.

use sfs3::bulk::{BulkOptions, BulkOrchestrator};
use sfs3::crypto::CryptoContext;
use sfs3::filter::PathFilter;
use sfs3::meta::MetaLayer;
use sfs3::pipeline::{Pipeline, PipelineOptions, VecSink};
use sfs3::skip::SkipLogic;
use sfs3::store::{GetFault, MemoryStore, ObjectStore};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

fn pipeline_with(store: Arc<MemoryStore>, part_size: u64) -> Pipeline {
    let meta = MetaLayer::new(store.clone(), "");
    let opts = PipelineOptions {
        part_size,
        backoff_start: Duration::from_millis(1),
        ..PipelineOptions::default()
    };
    Pipeline::new(store, meta, opts, CryptoContext::default())
}

fn pipeline(store: Arc<MemoryStore>) -> Pipeline {
    pipeline_with(store, 100 * 1024 * 1024)
}

fn orchestrator(pipe: &Pipeline, policy: SkipLogic) -> BulkOrchestrator {
    BulkOrchestrator::new(
        pipe.clone(),
        BulkOptions {
            policy,
            ..BulkOptions::default()
        },
    )
}

fn write_file(dir: &Path, rel: &str, content: &[u8], mtime_secs: u64) -> std::path::PathBuf {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime_secs))
        .unwrap();
    path
}

fn mtime_of(path: &Path) -> u64 {
    std::fs::metadata(path)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[tokio::test]
async fn test_put_writes_content_mtime_header_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let local = write_file(dir.path(), "local.txt", b"The value of key-1", 1380896764);

    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store.clone());
    pipe.put_file(&local, "key-1", None).await.unwrap();

    assert_eq!(&store.raw("data/key-1").unwrap()[..], b"The value of key-1");
    let head = store.head("data/key-1").await.unwrap();
    assert_eq!(
        head.user_meta.get("mtime").map(String::as_str),
        Some("2013-10-04T14:26:04Z")
    );
    assert_eq!(
        &store.raw("meta/key-1/md5sum").unwrap()[..],
        b"e28cbeebcc243df62a59d90ddfe4b3e8\n"
    );
    // unencrypted: no cryptokey sidecar
    assert!(!store.contains("meta/key-1/cryptokey"));
}

#[tokio::test]
async fn test_get_restores_content_and_mtime() {
    let store = Arc::new(MemoryStore::new());
    store.insert(
        "data/key-1",
        b"The value of key-1",
        HashMap::from([("mtime".to_string(), "2013-10-04T17:40:59Z".to_string())]),
    );
    store.insert(
        "meta/key-1/md5sum",
        b"e28cbeebcc243df62a59d90ddfe4b3e8\n",
        HashMap::new(),
    );

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let pipe = pipeline(store);
    pipe.get_to_file("key-1", &out, None).await.unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), b"The value of key-1");
    assert_eq!(mtime_of(&out), 1380908459);
}

#[tokio::test]
async fn test_get_missing_object_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store);
    let mut sink = VecSink::default();
    let err = sfs3::pipeline::download::get_to_sink(&pipe, "absent", &mut sink, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_corrupted_body_retries_then_succeeds() {
    let store = Arc::new(MemoryStore::new());
    store.insert("data/key-2", b"mixed Case body", HashMap::new());
    let sidecar = format!("{}\n", md5_hex(b"mixed Case body"));
    store.insert("meta/key-2/md5sum", sidecar.as_bytes(), HashMap::new());
    store.push_get_fault("data/key-2", GetFault::CorruptUppercase);

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let pipe = pipeline(store.clone());
    pipe.get_to_file("key-2", &out, None).await.unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), b"mixed Case body");
    assert_eq!(store.recorded_gets("data/key-2").len(), 2);
}

#[tokio::test]
async fn test_md5_mismatch_exhausts_retry_budget() {
    let store = Arc::new(MemoryStore::new());
    store.insert("data/key", b"payload", HashMap::new());
    store.insert(
        "meta/key/md5sum",
        b"00000000000000000000000000000000\n",
        HashMap::new(),
    );

    let pipe = pipeline(store.clone());
    let mut sink = VecSink::default();
    let err = sfs3::pipeline::download::get_to_sink(&pipe, "key", &mut sink, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("md5 mismatch"));
    // initial attempt plus the full retry budget
    assert_eq!(
        store.recorded_gets("data/key").len() as u32,
        1 + pipe.opts.retries
    );
}

#[tokio::test]
async fn test_stall_resumes_with_range_and_if_match() {
    let body: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let store = Arc::new(MemoryStore::new());
    store.insert("data/big", &body, HashMap::new());
    let sidecar = format!("{}\n", md5_hex(&body));
    store.insert("meta/big/md5sum", sidecar.as_bytes(), HashMap::new());
    store.push_get_fault("data/big", GetFault::StallAfter(100_000));

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("big");
    let pipe = pipeline(store.clone());
    pipe.get_to_file("big", &out, None).await.unwrap();

    // pre-stall and post-stall bytes concatenate to the whole object
    assert_eq!(std::fs::read(&out).unwrap(), body);

    let gets = store.recorded_gets("data/big");
    assert_eq!(gets.len(), 2);
    assert_eq!(gets[0].range_start, None);
    assert_eq!(gets[1].range_start, Some(100_000));
    let etag = store.head("data/big").await.unwrap().etag;
    assert_eq!(gets[1].if_match, etag);
}

#[tokio::test]
async fn test_transient_500_is_retried() {
    let store = Arc::new(MemoryStore::new());
    store.insert("data/key", b"payload", HashMap::new());
    let sidecar = format!("{}\n", md5_hex(b"payload"));
    store.insert("meta/key/md5sum", sidecar.as_bytes(), HashMap::new());
    store.push_get_fault("data/key", GetFault::Http500);

    let pipe = pipeline(store.clone());
    let mut sink = VecSink::default();
    sfs3::pipeline::download::get_to_sink(&pipe, "key", &mut sink, None)
        .await
        .unwrap();
    assert_eq!(sink.data, b"payload");
}

#[tokio::test]
async fn test_transient_500_on_sidecar_get_is_retried() {
    let store = Arc::new(MemoryStore::new());
    store.insert("data/key", b"payload", HashMap::new());
    let sidecar = format!("{}\n", md5_hex(b"payload"));
    store.insert("meta/key/md5sum", sidecar.as_bytes(), HashMap::new());
    store.push_get_fault("meta/key/md5sum", GetFault::Http500);

    let pipe = pipeline(store.clone());
    let mut sink = VecSink::default();
    sfs3::pipeline::download::get_to_sink(&pipe, "key", &mut sink, None)
        .await
        .unwrap();
    assert_eq!(sink.data, b"payload");
    assert_eq!(store.recorded_gets("meta/key/md5sum").len(), 2);
}

#[tokio::test]
async fn test_zero_byte_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let local = write_file(dir.path(), "empty", b"", 1380896764);

    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store.clone());
    pipe.put_file(&local, "empty", None).await.unwrap();

    assert_eq!(store.raw("data/empty").unwrap().len(), 0);
    assert_eq!(
        &store.raw("meta/empty/md5sum").unwrap()[..],
        b"d41d8cd98f00b204e9800998ecf8427e\n"
    );

    let out = dir.path().join("out");
    pipe.get_to_file("empty", &out, None).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap().len(), 0);
}

#[tokio::test]
async fn test_one_byte_over_part_size_uploads_two_parts() {
    let dir = tempfile::tempdir().unwrap();
    let local = write_file(dir.path(), "f", &[9u8; 5], 1380896764);

    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline_with(store.clone(), 4);
    pipe.put_file(&local, "f", None).await.unwrap();

    // the memory store mirrors the S3 multipart ETag shape
    let etag = store.head("data/f").await.unwrap().etag.unwrap();
    assert!(etag.ends_with("-2\""), "etag was {}", etag);
    assert_eq!(&store.raw("data/f").unwrap()[..], &[9u8; 5]);
}

#[tokio::test]
async fn test_repeated_slashes_normalise_in_keys() {
    let dir = tempfile::tempdir().unwrap();
    let local = write_file(dir.path(), "f", b"x", 1380896764);

    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store.clone());
    pipe.put_file(&local, "a//b", None).await.unwrap();
    assert!(store.contains("data/a/b"));
    assert!(store.contains("meta/a/b/md5sum"));
}

#[tokio::test]
async fn test_push_all_transfers_everything() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "A/1", b"one", 1380896764);
    write_file(dir.path(), "A/2", b"two", 1380896764);
    write_file(dir.path(), "B/3", b"three", 1380896764);

    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store.clone());
    let summary = orchestrator(&pipe, SkipLogic::All)
        .push(dir.path(), "tree", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed_files, 3);
    assert_eq!(summary.skipped_files, 0);
    assert_eq!(summary.aborted_files, 0);
    for rel in ["A/1", "A/2", "B/3"] {
        assert!(store.contains(&format!("data/tree/{}", rel)));
        assert!(store.contains(&format!("meta/tree/{}/md5sum", rel)));
    }
}

#[tokio::test]
async fn test_push_twice_with_stat_skips_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "A/1", b"one", 1380896764);
    write_file(dir.path(), "A/2", b"two", 1380896764);

    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store.clone());

    let first = orchestrator(&pipe, SkipLogic::Stat)
        .push(dir.path(), "tree", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.completed_files, 2);
    assert_eq!(first.skipped_files, 0);

    let second = orchestrator(&pipe, SkipLogic::Stat)
        .push(dir.path(), "tree", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.skipped_files, 2);
    // a skipped file still counts as completed
    assert_eq!(second.completed_files, 2);
}

#[tokio::test]
async fn test_pull_stat_downloads_only_changed_file() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "A/1", b"one", 1380896764);
    write_file(dir.path(), "A/2", b"two", 1380896764);
    write_file(dir.path(), "B/3", b"three", 1380896764);

    // seed the remote from an identical tree
    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store.clone());
    orchestrator(&pipe, SkipLogic::All)
        .push(dir.path(), "tree", &CancellationToken::new())
        .await
        .unwrap();

    // desync one local mtime
    let changed = dir.path().join("A/2");
    std::fs::OpenOptions::new()
        .write(true)
        .open(&changed)
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_secs(1380900000))
        .unwrap();

    let summary = orchestrator(&pipe, SkipLogic::Stat)
        .pull("tree", dir.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.skipped_files, 2);
    assert_eq!(summary.completed_files, 3);
    assert_eq!(store.recorded_gets("data/tree/A/2").len(), 1);
    assert_eq!(store.recorded_gets("data/tree/A/1").len(), 0);
    assert_eq!(store.recorded_gets("data/tree/B/3").len(), 0);
    // the pulled file took the remote mtime
    assert_eq!(mtime_of(&changed), 1380896764);
}

#[tokio::test]
async fn test_push_filter_only_and_exclude() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "A/1", b"one", 1380896764);
    write_file(dir.path(), "A/2.tmp", b"tmp", 1380896764);
    write_file(dir.path(), "B/3", b"three", 1380896764);

    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store.clone());
    let opts = BulkOptions {
        policy: SkipLogic::All,
        filter: PathFilter::new(&["A/**".to_string()], &["**.tmp".to_string()]),
        ..BulkOptions::default()
    };
    let summary = BulkOrchestrator::new(pipe.clone(), opts)
        .push(dir.path(), "tree", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed_files, 1);
    assert!(store.contains("data/tree/A/1"));
    assert!(!store.contains("data/tree/A/2.tmp"));
    assert!(!store.contains("data/tree/B/3"));
}

#[tokio::test]
async fn test_remove_leaves_no_orphans() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "A/1", b"one", 1380896764);
    write_file(dir.path(), "B/3", b"three", 1380896764);

    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store.clone());
    let orch = orchestrator(&pipe, SkipLogic::All);
    orch.push(dir.path(), "tree", &CancellationToken::new())
        .await
        .unwrap();

    for (rel, _) in orch.enumerate_remote("tree").await.unwrap() {
        pipe.remove(&format!("tree/{}", rel)).await.unwrap();
    }

    let data = store.list("data/tree/", None).await.unwrap();
    assert!(data.objects.is_empty());
    let meta = store.list("meta/tree/", None).await.unwrap();
    assert!(meta.objects.is_empty());

    // every content delete was paired with its sidecar delete
    let deletes = store.recorded_deletes();
    assert!(deletes.contains(&"data/tree/A/1".to_string()));
    assert!(deletes.contains(&"meta/tree/A/1/md5sum".to_string()));
}

#[tokio::test]
async fn test_abort_gate_trips_after_five_consecutive_failures() {
    let dir = tempfile::tempdir().unwrap();
    // remote objects exist but every md5sum sidecar is wrong: downloads
    // fail after their retry budget
    let store = Arc::new(MemoryStore::new());
    for i in 0..8 {
        let key = format!("data/tree/f{}", i);
        store.insert(&key, b"payload", HashMap::new());
        store.insert(
            &format!("meta/tree/f{}/md5sum", i),
            b"00000000000000000000000000000000\n",
            HashMap::new(),
        );
    }

    let meta = MetaLayer::new(store.clone(), "");
    let opts = PipelineOptions {
        retries: 0,
        backoff_start: Duration::from_millis(1),
        ..PipelineOptions::default()
    };
    let pipe = Pipeline::new(store.clone(), meta, opts, CryptoContext::default());
    let bulk_opts = BulkOptions {
        policy: SkipLogic::All,
        concurrent: 1,
        ..BulkOptions::default()
    };
    let err = BulkOrchestrator::new(pipe, bulk_opts)
        .pull("tree", dir.path(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("md5 mismatch"));
}

#[tokio::test]
async fn test_compare_reports_first_divergence_kind() {
    let dir = tempfile::tempdir().unwrap();
    let local = write_file(dir.path(), "f", b"same content", 1380896764);

    let store = Arc::new(MemoryStore::new());
    let pipe = pipeline(store.clone());
    pipe.put_file(&local, "f", None).await.unwrap();

    // identical
    assert_eq!(pipe.compare_file("f", &local).await.unwrap(), None);

    // size differs
    let shorter = write_file(dir.path(), "g", b"same", 1380896764);
    assert!(matches!(
        pipe.compare_file("f", &shorter).await.unwrap(),
        Some(sfs3::pipeline::Divergence::Size { .. })
    ));

    // mtime differs, size equal
    let retimed = write_file(dir.path(), "h", b"same content", 1400000000);
    assert!(matches!(
        pipe.compare_file("f", &retimed).await.unwrap(),
        Some(sfs3::pipeline::Divergence::Mtime)
    ));

    // bytes differ, size and mtime equal
    let edited = write_file(dir.path(), "i", b"same CONtent", 1380896764);
    assert!(matches!(
        pipe.compare_file("f", &edited).await.unwrap(),
        Some(sfs3::pipeline::Divergence::Bytes { offset: 5 })
    ));
}

#[tokio::test]
async fn test_md5_verify_detects_sidecar_mismatch() {
    let store = Arc::new(MemoryStore::new());
    store.insert("data/good", b"alpha", HashMap::new());
    let good_sidecar = format!("{}\n", md5_hex(b"alpha"));
    store.insert("meta/good/md5sum", good_sidecar.as_bytes(), HashMap::new());
    store.insert("data/bad", b"beta", HashMap::new());
    store.insert(
        "meta/bad/md5sum",
        b"00000000000000000000000000000000\n",
        HashMap::new(),
    );

    let meta = MetaLayer::new(store.clone(), "");
    let opts = PipelineOptions {
        retries: 0,
        backoff_start: Duration::from_millis(1),
        ..PipelineOptions::default()
    };
    let pipe = Pipeline::new(store, meta, opts, CryptoContext::default());

    pipe.verify_md5("good").await.unwrap();
    let err = pipe.verify_md5("bad").await.unwrap_err();
    assert!(err.to_string().contains("md5 mismatch"));
}

fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data))
}
