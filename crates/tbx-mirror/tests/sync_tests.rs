// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end sync behaviour against a mocked object store.

use tbx_mirror::{MANIFEST_FILE, Manifest, MirrorClient, SyncOptions, sync};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn options(prefix: &str, enable_upload: bool) -> SyncOptions {
    SyncOptions {
        prefix: prefix.to_string(),
        enable_upload,
        download_concurrency: 2,
        upload_concurrency: 2,
    }
}

fn client(server: &MockServer) -> MirrorClient {
    MirrorClient::new(server.uri(), "bkt", Some("tok".into()), None)
}

fn list_response(items: &[(&str, &str)]) -> serde_json::Value {
    serde_json::json!({
        "items": items
            .iter()
            .map(|(name, generation)| serde_json::json!({"name": name, "generation": generation}))
            .collect::<Vec<_>>()
    })
}

async fn mount_list(server: &MockServer, items: &[(&str, &str)]) {
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bkt/o"))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_response(items)))
        .mount(server)
        .await;
}

#[tokio::test]
async fn downloads_new_objects_and_records_manifest() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();

    mount_list(&server, &[("pre/a.txt", "11"), ("pre/sub/b.txt", "22")]).await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bkt/o/pre%2Fa.txt"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"alpha".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bkt/o/pre%2Fsub%2Fb.txt"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"beta".to_vec()))
        .mount(&server)
        .await;

    let report = sync(&client(&server), work.path(), &options("pre/", false))
        .await
        .unwrap();

    assert_eq!(report.listed, 2);
    assert_eq!(report.downloaded, 2);
    assert_eq!(
        std::fs::read(work.path().join("a.txt")).unwrap(),
        b"alpha"
    );
    assert_eq!(
        std::fs::read(work.path().join("sub/b.txt")).unwrap(),
        b"beta"
    );

    let manifest = Manifest::load(work.path()).unwrap();
    assert_eq!(manifest.get("pre/a.txt").unwrap().remote_gen, "11");
    assert_eq!(manifest.get("pre/sub/b.txt").unwrap().remote_gen, "22");
}

#[tokio::test]
async fn second_sync_is_idempotent() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();

    mount_list(&server, &[("pre/a.txt", "11")]).await;
    // Exactly one download across both passes.
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bkt/o/pre%2Fa.txt"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"alpha".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let c = client(&server);
    let opts = options("pre/", true);
    let first = sync(&c, work.path(), &opts).await.unwrap();
    assert_eq!(first.downloaded, 1);

    let second = sync(&c, work.path(), &opts).await.unwrap();
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.conflicts, 0);
}

#[tokio::test]
async fn new_local_file_uploads_only_if_absent() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();
    std::fs::write(work.path().join("fresh.txt"), b"new data").unwrap();

    mount_list(&server, &[]).await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/bkt/o"))
        .and(query_param("uploadType", "media"))
        .and(query_param("name", "pre/fresh.txt"))
        .and(query_param("ifGenerationMatch", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "pre/fresh.txt",
            "generation": "77"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync(&client(&server), work.path(), &options("pre/", true))
        .await
        .unwrap();

    assert_eq!(report.uploaded, 1);
    let manifest = Manifest::load(work.path()).unwrap();
    assert_eq!(manifest.get("pre/fresh.txt").unwrap().remote_gen, "77");
}

#[tokio::test]
async fn changed_remote_generation_redownloads_instead_of_uploading() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();

    // First sync establishes the manifest at generation 11.
    mount_list(&server, &[("pre/a.txt", "11")]).await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bkt/o/pre%2Fa.txt"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"alpha".to_vec()))
        .mount(&server)
        .await;
    let c = client(&server);
    sync(&c, work.path(), &options("pre/", false)).await.unwrap();

    // Local edit + remote generation moved to 12 under someone else's pen.
    std::fs::write(work.path().join("a.txt"), b"local edit").unwrap();
    server.reset().await;
    mount_list(&server, &[("pre/a.txt", "12")]).await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bkt/o/pre%2Fa.txt"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"their edit".to_vec()))
        .mount(&server)
        .await;

    let report = sync(&c, work.path(), &options("pre/", true)).await.unwrap();

    // The new generation downloads (clobbering is the download pass's
    // documented behaviour); the upload pass must not push over it blindly,
    // so no upload call was ever mocked and the pass reports cleanly.
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.uploaded, 0);
    assert_eq!(
        std::fs::read(work.path().join("a.txt")).unwrap(),
        b"their edit"
    );
}

#[tokio::test]
async fn lost_upload_race_counts_as_conflict() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();
    std::fs::write(work.path().join("a.txt"), b"local edit").unwrap();

    // Manifest agrees with the listing at generation 11, but the store
    // moved on between listing and PUT: the precondition fails.
    let mut manifest = Manifest::default();
    manifest.insert(
        "pre/a.txt",
        tbx_mirror::ManifestEntry {
            remote_gen: "11".into(),
            local_mtime: 0,
            local_size: 0,
        },
    );
    manifest.save(work.path()).unwrap();

    mount_list(&server, &[("pre/a.txt", "11")]).await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/bkt/o"))
        .and(query_param("name", "pre/a.txt"))
        .and(query_param("ifGenerationMatch", "11"))
        .respond_with(ResponseTemplate::new(412))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync(&client(&server), work.path(), &options("pre/", true))
        .await
        .unwrap();

    assert_eq!(report.uploaded, 0);
    assert_eq!(report.conflicts, 1);
}

#[tokio::test]
async fn untracked_local_file_with_remote_twin_is_never_uploaded() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();

    // Local b.txt exists but the manifest has never seen the remote twin:
    // could be a first sync, could be a conflict. The remote copy wins the
    // download pass, and the upload pass must not push over it — no upload
    // mock is mounted, so any attempt fails the sync.
    std::fs::write(work.path().join("b.txt"), b"untracked local").unwrap();
    mount_list(&server, &[("pre/b.txt", "44")]).await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bkt/o/pre%2Fb.txt"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"theirs".to_vec()))
        .mount(&server)
        .await;

    let report = sync(&client(&server), work.path(), &options("pre/", true))
        .await
        .unwrap();

    assert_eq!(report.downloaded, 1);
    assert_eq!(report.uploaded, 0);
    assert_eq!(std::fs::read(work.path().join("b.txt")).unwrap(), b"theirs");
}

#[tokio::test]
async fn permission_denied_counts_as_conflict() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();
    std::fs::write(work.path().join("locked.txt"), b"data").unwrap();

    mount_list(&server, &[]).await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/bkt/o"))
        .and(query_param("name", "pre/locked.txt"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync(&client(&server), work.path(), &options("pre/", true))
        .await
        .unwrap();

    assert_eq!(report.uploaded, 0);
    assert_eq!(report.conflicts, 1);
}

#[tokio::test]
async fn historic_double_slash_keys_keep_their_spelling() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();
    std::fs::write(work.path().join("a.txt"), b"edited").unwrap();

    // A manifest written by an older deployment recorded the object under
    // `pre//a.txt`. Uploads must keep using that name, not mint `pre/a.txt`.
    let mut manifest = Manifest::default();
    manifest.insert(
        "pre//a.txt",
        tbx_mirror::ManifestEntry {
            remote_gen: "5".into(),
            local_mtime: 0,
            local_size: 0,
        },
    );
    manifest.save(work.path()).unwrap();

    mount_list(&server, &[("pre//a.txt", "5")]).await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/bkt/o"))
        .and(query_param("name", "pre//a.txt"))
        .and(query_param("ifGenerationMatch", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "pre//a.txt",
            "generation": "6"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync(&client(&server), work.path(), &options("pre/", true))
        .await
        .unwrap();

    assert_eq!(report.uploaded, 1);
    let manifest = Manifest::load(work.path()).unwrap();
    assert_eq!(manifest.get("pre//a.txt").unwrap().remote_gen, "6");
}

#[tokio::test]
async fn manifest_file_itself_is_never_uploaded() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();

    // Seed a manifest so the file exists on disk, plus one real file.
    Manifest::default().save(work.path()).unwrap();
    assert!(work.path().join(MANIFEST_FILE).exists());
    std::fs::write(work.path().join("real.txt"), b"x").unwrap();

    mount_list(&server, &[]).await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/bkt/o"))
        .and(query_param("name", "pre/real.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "pre/real.txt",
            "generation": "1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync(&client(&server), work.path(), &options("pre/", true))
        .await
        .unwrap();
    assert_eq!(report.uploaded, 1);
}

#[tokio::test]
async fn list_follows_pagination() {
    let server = MockServer::start().await;
    let work = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bkt/o"))
        .and(query_param("pageToken", "t2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_response(&[("pre/b.txt", "2")])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/bkt/o"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{"name": "pre/a.txt", "generation": "1"}],
            "nextPageToken": "t2"
        })))
        .mount(&server)
        .await;

    for name in ["pre%2Fa.txt", "pre%2Fb.txt"] {
        Mock::given(method("GET"))
            .and(path(format!("/storage/v1/b/bkt/o/{name}")))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;
    }

    let report = sync(&client(&server), work.path(), &options("pre/", false))
        .await
        .unwrap();
    assert_eq!(report.listed, 2);
    assert_eq!(report.downloaded, 2);
}
