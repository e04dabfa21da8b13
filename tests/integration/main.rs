//! Integration tests for docpack

mod library_tests {
    use docpack::archive::{ArchiveConfig, ArchiveEntry, ArchiveRequest};
    use docpack::builder::{ArchiveBuilder, ArchiveResult, BuilderSettings};
    use docpack::cache::ContentCache;
    use docpack::error::{DocpackError, FailureKind};
    use docpack::monitor::{
        FixedSampler, PressureLevel, PressureThresholds, ResourceMonitor, ResourceSampler,
        ResourceUsage,
    };
    use std::io::{self, Cursor, Read};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;

    /// Compressible text-like content, distinct per seed
    fn document(seed: u8, len: usize) -> Vec<u8> {
        const TEXT: &[u8] = b"Lorem ipsum dolor sit amet, consectetur adipiscing elit. ";
        (0..len)
            .map(|i| TEXT[(i + usize::from(seed) * 7) % TEXT.len()])
            .collect()
    }

    fn settings() -> BuilderSettings {
        BuilderSettings {
            streaming_threshold_bytes: MB as u64,
            chunk_size_bytes: 64 * KB,
            ..BuilderSettings::default()
        }
    }

    async fn builder_at(temp: &TempDir, level: PressureLevel) -> ArchiveBuilder {
        let cache = ContentCache::open(temp.path().join("cache")).await.unwrap();
        ArchiveBuilder::new(cache, settings()).with_monitor(ResourceMonitor::new(
            FixedSampler::at(level),
            PressureThresholds::default(),
        ))
    }

    async fn builder(temp: &TempDir) -> ArchiveBuilder {
        builder_at(temp, PressureLevel::Low).await
    }

    fn request(entries: Vec<ArchiveEntry>, config: ArchiveConfig) -> ArchiveRequest {
        ArchiveRequest::new(entries, config).unwrap()
    }

    fn three_documents() -> ArchiveRequest {
        request(
            vec![
                ArchiveEntry::from_bytes("letters/cover.txt", document(1, 2 * KB)),
                ArchiveEntry::from_bytes("reports/q3.pdf", document(2, 50 * KB)),
                ArchiveEntry::from_bytes("scans/contract.tiff", document(3, 5 * MB)),
            ],
            ArchiveConfig::default(),
        )
    }

    async fn entry_names(result: &ArchiveResult) -> Vec<String> {
        let bytes = result.data.read_all().await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn three_entry_build_then_hit() {
        let temp = TempDir::new().unwrap();
        let builder = builder(&temp).await;

        let built = builder.build_or_fetch(three_documents()).await.unwrap();
        assert!(!built.metrics.cache_hit);
        assert_eq!(built.metrics.entries_written, 3);
        assert_eq!(built.metrics.buffered_entries, 2);
        assert_eq!(built.metrics.chunked_entries, 1);
        assert_eq!(
            entry_names(&built).await,
            vec!["letters/cover.txt", "reports/q3.pdf", "scans/contract.tiff"]
        );

        let hit = builder.build_or_fetch(three_documents()).await.unwrap();
        assert!(hit.metrics.cache_hit);
        assert_eq!(hit.metrics.entries_written, 0);
        assert_eq!(hit.key, built.key);
        assert_eq!(hit.integrity_hash, built.integrity_hash);
        assert_eq!(
            hit.data.read_all().await.unwrap(),
            built.data.read_all().await.unwrap()
        );

        let snapshot = builder.snapshot_metrics();
        assert_eq!(snapshot.builds_started, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
    }

    #[tokio::test]
    async fn identical_inputs_give_identical_archives() {
        let first_dir = TempDir::new().unwrap();
        let second_dir = TempDir::new().unwrap();

        let first = builder(&first_dir)
            .await
            .build_or_fetch(three_documents())
            .await
            .unwrap();
        let second = builder(&second_dir)
            .await
            .build_or_fetch(three_documents())
            .await
            .unwrap();

        assert!(!second.metrics.cache_hit);
        assert_eq!(first.key, second.key);
        assert_eq!(first.integrity_hash, second.integrity_hash);
        assert_eq!(
            first.data.read_all().await.unwrap(),
            second.data.read_all().await.unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_build() {
        let temp = TempDir::new().unwrap();
        let builder = builder(&temp).await;
        let make_request = || {
            request(
                vec![ArchiveEntry::from_bytes(
                    "archive/ledger.csv",
                    document(9, 10 * MB),
                )],
                ArchiveConfig {
                    compression_level: 1,
                    ..ArchiveConfig::default()
                },
            )
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let builder = builder.clone();
                let request = make_request();
                tokio::spawn(async move { builder.build_or_fetch(request).await })
            })
            .collect();

        let mut hashes = Vec::new();
        for handle in handles {
            hashes.push(handle.await.unwrap().unwrap().integrity_hash);
        }
        hashes.dedup();
        assert_eq!(hashes.len(), 1);

        let snapshot = builder.snapshot_metrics();
        assert_eq!(snapshot.builds_started, 1);
        assert_eq!(snapshot.builds_succeeded, 1);
        assert_eq!(builder.cache().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn high_pressure_streams_more_entries() {
        let request = || {
            request(
                vec![ArchiveEntry::from_bytes("scan.tiff", document(4, 600 * KB))],
                ArchiveConfig::default(),
            )
        };

        let relaxed_dir = TempDir::new().unwrap();
        let relaxed = builder_at(&relaxed_dir, PressureLevel::Low)
            .await
            .build_or_fetch(request())
            .await
            .unwrap();
        assert_eq!(relaxed.metrics.chunked_entries, 0);

        let loaded_dir = TempDir::new().unwrap();
        let loaded = builder_at(&loaded_dir, PressureLevel::High)
            .await
            .build_or_fetch(request())
            .await
            .unwrap();
        assert_eq!(loaded.metrics.chunked_entries, 1);

        assert_eq!(relaxed.key, loaded.key);
        assert_eq!(entry_names(&loaded).await, vec!["scan.tiff"]);
    }

    #[tokio::test]
    async fn corrupted_cache_entry_is_rebuilt() {
        let temp = TempDir::new().unwrap();
        let builder = builder(&temp).await;

        let built = builder.build_or_fetch(three_documents()).await.unwrap();
        let archive_path = builder.cache().archive_path(&built.key);
        std::fs::write(&archive_path, b"definitely not a zip").unwrap();

        let rebuilt = builder.build_or_fetch(three_documents()).await.unwrap();
        assert!(!rebuilt.metrics.cache_hit);
        assert_eq!(rebuilt.integrity_hash, built.integrity_hash);
        assert_eq!(builder.snapshot_metrics().builds_started, 2);

        let hit = builder.build_or_fetch(three_documents()).await.unwrap();
        assert!(hit.metrics.cache_hit);
    }

    #[tokio::test]
    async fn size_violation_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let builder = builder(&temp).await;
        let config = ArchiveConfig {
            max_entry_bytes: 100 * KB as u64,
            ..ArchiveConfig::default()
        };

        let err = builder
            .build_or_fetch(request(
                vec![
                    ArchiveEntry::from_bytes("small.txt", document(1, KB)),
                    ArchiveEntry::from_bytes("huge.bin", document(2, 2 * MB)),
                ],
                config,
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, DocpackError::EntrySizeExceeded { .. }));
        assert_eq!(err.kind(), FailureKind::SizeViolation);
        assert!(!err.is_retryable());
        assert!(builder.cache().list().await.unwrap().is_empty());

        let staged: Vec<_> = std::fs::read_dir(builder.cache().staging_dir())
            .unwrap()
            .collect();
        assert!(staged.is_empty());

        let snapshot = builder.snapshot_metrics();
        assert_eq!(snapshot.failures_of(FailureKind::SizeViolation), 1);
    }

    #[tokio::test]
    async fn total_size_violation_fails_build() {
        let temp = TempDir::new().unwrap();
        let builder = builder(&temp).await;
        let config = ArchiveConfig {
            max_total_bytes: 3 * KB as u64,
            ..ArchiveConfig::default()
        };

        let err = builder
            .build_or_fetch(request(
                vec![
                    ArchiveEntry::from_bytes("a.txt", document(1, 2 * KB)),
                    ArchiveEntry::from_bytes("b.txt", document(2, 2 * KB)),
                ],
                config,
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, DocpackError::TotalSizeExceeded { .. }));
        assert!(builder.cache().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn skip_mode_keeps_remaining_entries() {
        let temp = TempDir::new().unwrap();
        let builder = builder(&temp).await;
        let config = ArchiveConfig {
            max_entry_bytes: 100 * KB as u64,
            skip_oversized_entries: true,
            ..ArchiveConfig::default()
        };

        let result = builder
            .build_or_fetch(request(
                vec![
                    ArchiveEntry::from_bytes("small.txt", document(1, KB)),
                    ArchiveEntry::from_bytes("huge.bin", document(2, 2 * MB)),
                    ArchiveEntry::from_bytes("notes.md", document(3, KB)),
                ],
                config,
            ))
            .await
            .unwrap();

        assert_eq!(entry_names(&result).await, vec!["small.txt", "notes.md"]);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("huge.bin"));
        assert_eq!(builder.snapshot_metrics().entries_skipped, 1);
    }

    struct SlowSampler(Duration);

    impl ResourceSampler for SlowSampler {
        fn sample(&self) -> io::Result<ResourceUsage> {
            std::thread::sleep(self.0);
            Ok(ResourceUsage {
                memory_percent: 10.0,
                cpu_percent: 10.0,
            })
        }
    }

    #[tokio::test]
    async fn timed_out_build_fails_and_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let cache = ContentCache::open(temp.path().join("cache")).await.unwrap();
        let builder = ArchiveBuilder::new(
            cache,
            BuilderSettings {
                build_timeout: Some(Duration::from_millis(50)),
                ..settings()
            },
        )
        .with_monitor(ResourceMonitor::new(
            SlowSampler(Duration::from_millis(300)),
            PressureThresholds::default(),
        ));

        let err = builder.build_or_fetch(three_documents()).await.unwrap_err();
        assert!(matches!(err, DocpackError::Timeout(_)));
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(err.is_retryable());
        assert!(builder.cache().list().await.unwrap().is_empty());
        assert_eq!(
            builder.snapshot_metrics().failures_of(FailureKind::Timeout),
            1
        );
    }

    #[tokio::test]
    async fn file_backed_entries_match_byte_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("minutes.txt");
        std::fs::write(&path, document(5, 20 * KB)).unwrap();

        let builder = builder(&temp).await;
        let from_file = builder
            .build_or_fetch(request(
                vec![ArchiveEntry::from_path("minutes.txt", &path).unwrap()],
                ArchiveConfig::default(),
            ))
            .await
            .unwrap();
        let from_bytes = builder
            .build_or_fetch(request(
                vec![ArchiveEntry::from_bytes("minutes.txt", document(5, 20 * KB))],
                ArchiveConfig::default(),
            ))
            .await
            .unwrap();

        assert!(from_bytes.metrics.cache_hit);
        assert_eq!(from_file.key, from_bytes.key);
    }

    /// Overwrites a file the first time the build samples pressure,
    /// after the key has been computed from the old content
    struct RewritingSampler {
        target: Mutex<Option<(PathBuf, &'static [u8])>>,
    }

    impl ResourceSampler for RewritingSampler {
        fn sample(&self) -> io::Result<ResourceUsage> {
            if let Some((path, content)) = self.target.lock().unwrap().take() {
                std::fs::write(path, content)?;
            }
            Ok(ResourceUsage {
                memory_percent: 10.0,
                cpu_percent: 10.0,
            })
        }
    }

    #[tokio::test]
    async fn entry_changed_during_build_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.txt");
        std::fs::write(&path, b"original content").unwrap();

        let cache = ContentCache::open(temp.path().join("cache")).await.unwrap();
        let builder = ArchiveBuilder::new(cache, settings()).with_monitor(ResourceMonitor::new(
            RewritingSampler {
                target: Mutex::new(Some((path.clone(), &b"TAMPERED CONTENT"[..]))),
            },
            PressureThresholds::default(),
        ));
        let make_request = || {
            request(
                vec![ArchiveEntry::from_path("doc.txt", &path).unwrap()],
                ArchiveConfig::default(),
            )
        };

        let err = builder.build_or_fetch(make_request()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::IntegrityFailure);
        assert!(builder.cache().list().await.unwrap().is_empty());

        std::fs::write(&path, b"original content").unwrap();
        let rebuilt = builder.build_or_fetch(make_request()).await.unwrap();
        assert!(!rebuilt.metrics.cache_hit);

        let bytes = rebuilt.data.read_all().await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut content = Vec::new();
        archive
            .by_name("doc.txt")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"original content");
    }
}

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn docpack() -> Command {
        cargo_bin_cmd!("docpack")
    }

    /// Temp dir with a config file whose cache lives inside it
    struct Workspace {
        dir: TempDir,
        config: PathBuf,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = dir.path().join("config.toml");
            let cache_dir = dir.path().join("cache");
            std::fs::write(
                &config,
                format!("[cache]\ndir = '{}'\n", cache_dir.display()),
            )
            .unwrap();
            Self { dir, config }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn cmd(&self) -> Command {
            let mut cmd = docpack();
            cmd.arg("--config").arg(&self.config);
            cmd
        }

        fn write_docs(&self) -> PathBuf {
            let docs = self.path().join("docs");
            std::fs::create_dir_all(docs.join("appendix")).unwrap();
            std::fs::write(docs.join("summary.txt"), "quarterly summary").unwrap();
            std::fs::write(docs.join("appendix").join("table.csv"), "a,b\n1,2\n").unwrap();
            docs
        }
    }

    #[test]
    fn help_displays() {
        docpack()
            .arg("--help")
            .assert()
            .success()
            .stdout(
                predicate::str::contains("Content-addressed archive packaging")
                    .or(predicate::str::contains("content-addressed document archives")),
            );
    }

    #[test]
    fn version_displays() {
        docpack()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("docpack"));
    }

    #[test]
    fn config_path_honors_flag() {
        let ws = Workspace::new();
        ws.cmd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let ws = Workspace::new();
        ws.cmd()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[archive]"))
            .stdout(predicate::str::contains("compression_level = 6"));
    }

    #[test]
    fn config_init_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("nested").join("config.toml");

        docpack()
            .arg("--config")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(config.exists());

        docpack()
            .arg("--config")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, "[archive]\ncompression_level = 42\n").unwrap();

        docpack()
            .arg("--config")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("compression_level"));
    }

    #[test]
    fn build_writes_archive_then_hits_cache() {
        let ws = Workspace::new();
        let docs = ws.write_docs();
        let out = ws.path().join("out.zip");

        ws.cmd()
            .arg("build")
            .arg(&docs)
            .arg("-o")
            .arg(&out)
            .assert()
            .success()
            .stdout(predicate::str::contains("Archive written"));

        let bytes = std::fs::read(&out).unwrap();
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert_eq!(archive.len(), 2);
        assert!(names.contains(&"docs/summary.txt"));
        assert!(names.contains(&"docs/appendix/table.csv"));

        ws.cmd()
            .arg("build")
            .arg(&docs)
            .arg("-o")
            .arg(ws.path().join("again.zip"))
            .arg("--json")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"cache_hit\": true"));
    }

    #[test]
    fn build_json_reports_key() {
        let ws = Workspace::new();
        let docs = ws.write_docs();

        ws.cmd()
            .arg("build")
            .arg(&docs)
            .arg("-o")
            .arg(ws.path().join("out.zip"))
            .args(["--json", "--flatten", "--level", "0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"integrity_hash\""))
            .stdout(predicate::str::contains("\"cache_hit\": false"));
    }

    #[test]
    fn build_missing_input_fails() {
        let ws = Workspace::new();
        ws.cmd()
            .arg("build")
            .arg(ws.path().join("missing.pdf"))
            .arg("-o")
            .arg(ws.path().join("out.zip"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Path not found"));
    }

    #[test]
    fn build_oversized_entry_shows_hint() {
        let ws = Workspace::new();
        std::fs::write(
            &ws.config,
            format!(
                "[archive]\nmax_entry_bytes = 4\n\n[cache]\ndir = '{}'\n",
                ws.path().join("cache").display()
            ),
        )
        .unwrap();
        let docs = ws.write_docs();

        ws.cmd()
            .arg("build")
            .arg(&docs)
            .arg("-o")
            .arg(ws.path().join("out.zip"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn cache_list_clear_cycle() {
        let ws = Workspace::new();
        let docs = ws.write_docs();

        ws.cmd()
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cached archives"));

        ws.cmd()
            .arg("build")
            .arg(&docs)
            .arg("-o")
            .arg(ws.path().join("out.zip"))
            .assert()
            .success();

        ws.cmd()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_match("^[0-9a-f]{64}\n$").unwrap());

        ws.cmd()
            .args(["cache", "gc", "--days", "1", "--max-mb", "0", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to remove"));

        ws.cmd()
            .args(["cache", "clear", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleared 1 archive(s)"));

        ws.cmd()
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }
}
