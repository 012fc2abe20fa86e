//! Integration tests for imgkeep

/// Smallest valid 1x1 PNG
const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    /// Command isolated from the user's config and cache
    fn imgkeep(home: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("imgkeep");
        cmd.env("IMGKEEP_CONFIG", home.join("config.toml"))
            .env("IMGKEEP_CACHE_DIR", home.join("cache"))
            .env("CI", "1");
        cmd
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Markdown documents"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("imgkeep"));
    }

    #[test]
    fn config_path_honors_env() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path())
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_defaults() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("full_scan = \"structural\""));
    }

    #[test]
    fn config_init_refuses_overwrite() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path())
            .args(["config", "init"])
            .assert()
            .success();
        assert!(home.path().join("config.toml").exists());

        imgkeep(home.path())
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"))
            .stderr(predicate::str::contains("--force"));

        imgkeep(home.path())
            .args(["config", "init", "--force"])
            .assert()
            .success();
    }

    #[test]
    fn invalid_config_is_reported() {
        let home = TempDir::new().unwrap();
        std::fs::write(home.path().join("config.toml"), "[cache\nbroken").unwrap();
        imgkeep(home.path())
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn list_empty_cache() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path())
            .args(["list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn sync_document_without_remote_images() {
        let home = TempDir::new().unwrap();
        let doc = home.path().join("notes.md");
        std::fs::write(&doc, "# Notes\n\n![local](./diagram.png)\n").unwrap();

        imgkeep(home.path())
            .args(["sync", "--format", "json"])
            .arg(&doc)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"invalid\": 0"))
            .stdout(predicate::str::contains("\"succeeded\": 0"));

        assert!(home.path().join("cache").is_dir());
    }

    #[test]
    fn sync_missing_document_fails() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path())
            .args(["sync", "--format", "plain"])
            .arg(home.path().join("absent.md"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("could not be synced"));
    }

    #[test]
    fn forget_unknown_document_fails() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path())
            .args(["forget", "nowhere.md"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Retainer not found"));
    }

    #[test]
    fn gc_and_verify_on_empty_cache() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path()).arg("gc").assert().success();
        imgkeep(home.path())
            .arg("verify")
            .assert()
            .success()
            .stdout(predicate::str::contains("consistent"));
    }

    #[test]
    fn verify_removes_stray_files() {
        let home = TempDir::new().unwrap();
        let cache = home.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("stray.bin"), b"junk").unwrap();

        imgkeep(home.path())
            .arg("verify")
            .assert()
            .success()
            .stdout(predicate::str::contains("stray.bin"));
        assert!(!cache.join("stray.bin").exists());
    }

    #[test]
    fn clear_with_yes_on_empty_cache() {
        let home = TempDir::new().unwrap();
        imgkeep(home.path())
            .args(["clear", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already empty"));
    }
}

mod library_tests {
    use super::PNG_1X1;
    use imgkeep::cache::{
        CacheRequest, CacheStore, FetchResponse, FsStorage, ScriptedFetcher, StoreOptions,
    };
    use imgkeep::document::MarkdownView;
    use imgkeep::sync::{Reconciler, SerialQueue, SyncEvent, SyncOptions};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn png(fetcher: &ScriptedFetcher, url: &str) {
        fetcher.respond(
            url,
            FetchResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "image/png".to_string())],
                body: PNG_1X1.to_vec(),
            },
        );
    }

    async fn open(dir: &Path, fetcher: Arc<ScriptedFetcher>) -> Arc<CacheStore> {
        Arc::new(
            CacheStore::create(StoreOptions::new(dir), Arc::new(FsStorage::new()), fetcher)
                .await
                .unwrap(),
        )
    }

    fn reconciler(store: &Arc<CacheStore>) -> Reconciler {
        Reconciler::new(
            Arc::clone(store),
            Arc::new(SerialQueue::new()),
            SyncOptions::default(),
        )
    }

    fn blob_count(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".png"))
            .count()
    }

    #[tokio::test]
    async fn shared_image_lives_until_last_document_forgets_it() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/shared.png");
        let store = open(dir.path(), Arc::clone(&fetcher)).await;
        let sync = reconciler(&store);

        let text = "![a](https://img.test/shared.png)\n";
        let first = Arc::new(MarkdownView::new("/notes/a.md", text));
        let second = Arc::new(MarkdownView::new("/notes/b.md", text));
        sync.handle(first, SyncEvent::Opened).await.unwrap();
        sync.handle(second, SyncEvent::Opened).await.unwrap();

        assert_eq!(fetcher.calls("https://img.test/shared.png"), 1);
        assert_eq!(blob_count(dir.path()), 1);

        store.remove_retainer("/notes/a.md").await.unwrap();
        assert_eq!(blob_count(dir.path()), 1);

        let outcome = store.remove_retainer("/notes/b.md").await.unwrap();
        assert_eq!(outcome.deleted.len(), 1);
        assert_eq!(blob_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn edit_releases_dropped_image() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/one.png");
        png(&fetcher, "https://img.test/two.png");
        let store = open(dir.path(), fetcher).await;
        let sync = reconciler(&store);

        let view = Arc::new(MarkdownView::new(
            "/notes/a.md",
            "![](https://img.test/one.png) ![](https://img.test/two.png)",
        ));
        let report = sync.handle(view.clone(), SyncEvent::Opened).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(blob_count(dir.path()), 2);

        view.set_text("![](https://img.test/two.png)");
        let report = sync
            .handle(view, SyncEvent::DocumentChanged { structural: true })
            .await
            .unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(blob_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn metadata_survives_restart() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/kept.png");

        {
            let store = open(dir.path(), Arc::clone(&fetcher)).await;
            let sync = reconciler(&store);
            let view = Arc::new(MarkdownView::new("/notes/a.md", "![](https://img.test/kept.png)"));
            sync.handle(view, SyncEvent::Opened).await.unwrap();
            store.close().await.unwrap();
        }

        let store = open(dir.path(), Arc::clone(&fetcher)).await;
        let lookup = store
            .lookup(&CacheRequest::new("https://img.test/kept.png", "/notes/a.md"), false)
            .await
            .unwrap();
        assert!(lookup.is_usable());

        let sync = reconciler(&store);
        let view = Arc::new(MarkdownView::new("/notes/a.md", "![](https://img.test/kept.png)"));
        let report = sync.handle(view, SyncEvent::Opened).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(fetcher.calls("https://img.test/kept.png"), 1);
    }

    #[tokio::test]
    async fn renamed_document_keeps_its_images() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/r.png");
        let store = open(dir.path(), fetcher).await;
        let sync = reconciler(&store);

        let view = Arc::new(MarkdownView::new("/notes/old.md", "![](https://img.test/r.png)"));
        sync.handle(view.clone(), SyncEvent::Opened).await.unwrap();

        view.rename("/notes/new.md");
        sync.handle(
            view,
            SyncEvent::DocumentRenamed {
                from: "/notes/old.md".to_string(),
                to: "/notes/new.md".to_string(),
            },
        )
        .await
        .unwrap();

        let root = store.snapshot().await;
        assert!(!root.retainers.contains_key("/notes/old.md"));
        assert_eq!(root.retainers["/notes/new.md"].refs.len(), 1);
        assert_eq!(blob_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn clear_then_verify_leaves_clean_directory() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/c.png");
        let store = open(dir.path(), fetcher).await;
        let sync = reconciler(&store);

        let view = Arc::new(MarkdownView::new("/notes/a.md", "![](https://img.test/c.png)"));
        sync.handle(view, SyncEvent::Opened).await.unwrap();

        store.clear_all().await.unwrap();
        assert_eq!(blob_count(dir.path()), 0);
        assert!(store.verify().await.unwrap().is_clean());
        assert!(store.snapshot().await.retainers.is_empty());
    }
}
