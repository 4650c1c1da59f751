//! Integration tests for duck-cache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Command isolated from the user's config and data directories
    fn duck(dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("duck-cache");
        cmd.env("DUCK_CONFIG", dir.path().join("config.toml"))
            .env("DUCK_STORAGE", dir.path().join("storage"));
        cmd
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        duck(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("content-addressed build cache"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        duck(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("duck-cache"));
    }

    #[test]
    fn config_path() {
        let dir = TempDir::new().unwrap();
        duck(&dir)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        duck(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("memory_timeout_secs = 600"));
    }

    #[test]
    fn config_init_writes_file() {
        let dir = TempDir::new().unwrap();
        duck(&dir).args(["config", "init"]).assert().success();
        assert!(dir.path().join("config.toml").exists());

        duck(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--force"));
    }

    #[test]
    fn invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[cache\n").unwrap();

        duck(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn key_then_show() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("song.duck");
        std::fs::write(&file, "DAC dac;\n").unwrap();

        let output = duck(&dir).arg("key").arg(&file).output().unwrap();
        assert!(output.status.success());
        let key = String::from_utf8(output.stdout).unwrap().trim().to_string();
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));

        duck(&dir)
            .args(["show", &key])
            .assert()
            .success()
            .stdout("DAC dac;\n");
    }

    #[test]
    fn show_invalid_key() {
        let dir = TempDir::new().unwrap();
        duck(&dir)
            .args(["show", "../../etc/passwd"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid cache key"))
            .stderr(predicate::str::contains("40 lowercase hex"));
    }

    #[test]
    fn show_unknown_key() {
        let dir = TempDir::new().unwrap();
        duck(&dir)
            .args(["show", &"0".repeat(40)])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Source not found"));
    }

    #[test]
    fn render_requires_input() {
        let dir = TempDir::new().unwrap();
        duck(&dir).arg("render").assert().failure();
    }

    #[test]
    fn render_with_missing_compiler() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("song.duck");
        std::fs::write(&file, "DAC dac;\n").unwrap();

        duck(&dir)
            .env("DUCK_COMPILER", "/nonexistent/duck")
            .arg("render")
            .arg(&file)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to spawn /nonexistent/duck"));
    }
}

mod cache_tests {
    use async_trait::async_trait;
    use duck_cache::cache::{Cache, CacheOptions};
    use duck_cache::eviction::{EvictionPolicy, EvictionState, ManualScheduler};
    use duck_cache::process::{PipelineOutput, ToolError, ToolOutput, ToolResult};
    use duck_cache::slot::SlotStatus;
    use duck_cache::store::{ArtifactKind, ArtifactStore};
    use duck_cache::toolchain::Toolchain;
    use duck_cache::{compute_key, DuckError, ErrorKind, Stage};
    use futures_util::future::join_all;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    const MEMORY: Duration = Duration::from_secs(10);
    const DISK: Duration = Duration::from_secs(100);

    /// Source containing this marker fails to compile with a located error
    const SYNTAX_ERROR: &str = "@@";

    fn ok() -> ToolOutput {
        ToolOutput {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    /// In-process stand-in for the compiler, encoder and waveform renderer
    #[derive(Default)]
    struct FakeToolchain {
        checks: AtomicUsize,
        compiles: AtomicUsize,
        encodes: AtomicUsize,
        waveforms: AtomicUsize,
        /// Number of upcoming checks that crash without diagnostics
        crash_checks: AtomicUsize,
        /// Number of upcoming compiles that crash without diagnostics
        crash_compiles: AtomicUsize,
        /// Compiling hits the deadline while set
        hang_compile: AtomicBool,
        /// Compiler binary cannot be started while set
        missing_compiler: AtomicBool,
        /// Encoding hits the deadline while set
        hang_encode: AtomicBool,
        /// Encoder exits nonzero while set
        fail_encode: AtomicBool,
        /// Encoder binary cannot be started while set
        missing_encoder: AtomicBool,
        /// Waveform renderer exits nonzero while set
        fail_waveform: AtomicBool,
        /// Compiles wait here when present
        gate: Option<Semaphore>,
        delay: Duration,
        executables: Mutex<Vec<PathBuf>>,
    }

    impl FakeToolchain {
        fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Default::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn count(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }

        /// Consume one scheduled crash, if any remain
        fn take(crashes: &AtomicUsize) -> bool {
            crashes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn crashed() -> ToolOutput {
            ToolOutput {
                exit_code: None,
                signal: Some(11),
                stderr: "Segmentation fault\n".to_string(),
                ..Default::default()
            }
        }

        fn not_found(program: &str) -> ToolError {
            ToolError::Spawn {
                program: program.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }
        }

        fn syntax_error(source: &Path) -> Option<ToolOutput> {
            let text = std::fs::read_to_string(source).unwrap();
            let column = text.find(SYNTAX_ERROR)? + 1;
            Some(ToolOutput {
                exit_code: Some(1),
                stderr: format!(
                    "{}(1,{}): error: unexpected '@'\n",
                    source.display(),
                    column
                ),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl Toolchain for FakeToolchain {
        async fn check(&self, source: &Path) -> ToolResult<ToolOutput> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.missing_compiler.load(Ordering::SeqCst) {
                return Err(Self::not_found("/nonexistent/duck"));
            }
            if Self::take(&self.crash_checks) {
                return Ok(Self::crashed());
            }
            Ok(Self::syntax_error(source).unwrap_or_else(ok))
        }

        async fn compile(&self, source: &Path, executable: &Path) -> ToolResult<ToolOutput> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
            tokio::time::sleep(self.delay).await;

            if self.missing_compiler.load(Ordering::SeqCst) {
                return Err(Self::not_found("/nonexistent/duck"));
            }
            if self.hang_compile.load(Ordering::SeqCst) {
                return Err(ToolError::TimedOut {
                    deadline: Duration::from_secs(60),
                });
            }
            if Self::take(&self.crash_compiles) {
                return Ok(Self::crashed());
            }
            if let Some(failed) = Self::syntax_error(source) {
                return Ok(failed);
            }

            std::fs::write(executable, b"#!/bin/sh\n").unwrap();
            self.executables.lock().unwrap().push(executable.to_path_buf());
            Ok(ok())
        }

        async fn encode_audio(
            &self,
            executable: &Path,
            audio: &Path,
            deadline: Duration,
        ) -> ToolResult<PipelineOutput> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            assert!(executable.exists(), "executable removed before encoding");
            if self.missing_encoder.load(Ordering::SeqCst) {
                return Err(Self::not_found("/nonexistent/flac"));
            }
            if self.hang_encode.load(Ordering::SeqCst) {
                return Err(ToolError::TimedOut { deadline });
            }
            if self.fail_encode.load(Ordering::SeqCst) {
                return Ok(PipelineOutput {
                    producer: ok(),
                    consumer: ToolOutput {
                        exit_code: Some(2),
                        stderr: "flac: ERROR: input has no samples\n".to_string(),
                        ..Default::default()
                    },
                });
            }

            std::fs::write(audio, b"fLaC").unwrap();
            Ok(PipelineOutput {
                producer: ok(),
                consumer: ok(),
            })
        }

        async fn render_waveform(
            &self,
            audio: &Path,
            image: &Path,
            _deadline: Duration,
        ) -> ToolResult<ToolOutput> {
            self.waveforms.fetch_add(1, Ordering::SeqCst);
            assert_eq!(std::fs::read(audio).unwrap(), b"fLaC");
            if self.fail_waveform.load(Ordering::SeqCst) {
                return Ok(ToolOutput {
                    exit_code: Some(1),
                    stderr: "sox FAIL: unsupported option\n".to_string(),
                    ..Default::default()
                });
            }
            std::fs::write(image, b"\x89PNG").unwrap();
            Ok(ok())
        }

        fn name(&self) -> &'static str {
            "Fake"
        }
    }

    struct Harness {
        dir: TempDir,
        cache: Cache,
        scheduler: ManualScheduler,
        tools: Arc<FakeToolchain>,
    }

    impl Harness {
        fn scratch_files(&self) -> usize {
            std::fs::read_dir(self.dir.path().join("scratch"))
                .unwrap()
                .count()
        }
    }

    async fn harness_with(tools: FakeToolchain, retain_without_artifacts: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(
            dir.path().join("storage"),
            dir.path().join("renders"),
            dir.path().join("scratch"),
            "flac",
        );
        store.ensure_dirs().await.unwrap();

        let options = CacheOptions {
            policy: EvictionPolicy {
                memory_timeout: MEMORY,
                disk_timeout: DISK,
                retain_without_artifacts,
            },
            process_timeout: Duration::from_secs(4),
            max_concurrent_jobs: 4,
        };

        let tools = Arc::new(tools);
        let scheduler = ManualScheduler::new();
        let cache = Cache::new(
            store,
            tools.clone(),
            Arc::new(scheduler.clone()),
            options,
        );

        Harness {
            dir,
            cache,
            scheduler,
            tools,
        }
    }

    async fn harness(tools: FakeToolchain) -> Harness {
        harness_with(tools, false).await
    }

    #[tokio::test]
    async fn same_source_same_key() {
        let h = harness(FakeToolchain::default()).await;

        let first = h.cache.submit(b"DAC dac;").await.unwrap();
        let second = h.cache.submit(b"DAC dac;").await.unwrap();
        let other = h.cache.submit(b"DAC dac; ").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, compute_key(b"DAC dac;"));
        assert_ne!(first, other);
        assert_eq!(h.cache.len(), 2);
    }

    #[tokio::test]
    async fn dac_renders_once() {
        let h = harness(FakeToolchain::default()).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let audio = h.cache.audio(&key).await.unwrap();
        assert_eq!(
            audio,
            h.dir.path().join("renders").join(format!("{}.flac", key))
        );
        assert_eq!(std::fs::read(&audio).unwrap(), b"fLaC");

        let again = h.cache.audio(&key).await.unwrap();
        assert_eq!(audio, again);
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 1);
        assert_eq!(FakeToolchain::count(&h.tools.encodes), 1);
        assert_eq!(h.scratch_files(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_compile() {
        let h = harness(FakeToolchain::slow(Duration::from_millis(50))).await;
        let key = h.cache.submit(b"SinOsc s => dac;").await.unwrap();

        let results = join_all((0..16).map(|_| h.cache.audio(&key))).await;

        let paths: Vec<PathBuf> = results.into_iter().map(Result::unwrap).collect();
        assert!(paths.iter().all(|p| *p == paths[0]));
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 1);
        assert_eq!(FakeToolchain::count(&h.tools.encodes), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_share_one_entry() {
        let h = harness(FakeToolchain::default()).await;

        let keys = join_all((0..8).map(|_| h.cache.submit(b"DAC dac;"))).await;

        let keys: Vec<_> = keys.into_iter().map(Result::unwrap).collect();
        assert!(keys.iter().all(|k| *k == keys[0]));
        assert_eq!(h.cache.len(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_memoized() {
        let h = harness(FakeToolchain::default()).await;
        h.tools.crash_compiles.store(1, Ordering::SeqCst);
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let err = h.cache.audio(&key).await.unwrap_err();
        assert!(matches!(err, DuckError::InternalCompiler { exit_code: None, .. }));
        assert_eq!(
            h.cache.snapshot(&key).unwrap().audio,
            SlotStatus::Absent
        );

        h.cache.audio(&key).await.unwrap();
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 2);
        assert_eq!(h.scratch_files(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_failure() {
        let h = harness(FakeToolchain::slow(Duration::from_millis(50))).await;
        h.tools.crash_compiles.store(1, Ordering::SeqCst);
        let key = h.cache.submit(b"SinOsc s => dac;").await.unwrap();

        let results = join_all((0..8).map(|_| h.cache.audio(&key))).await;

        for result in results {
            let err = result.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InternalCompilerError, "{:?}", err);
        }
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 1);
        assert_eq!(FakeToolchain::count(&h.tools.encodes), 0);
        assert_eq!(h.cache.snapshot(&key).unwrap().audio, SlotStatus::Absent);
    }

    #[tokio::test]
    async fn failed_audio_skips_image() {
        let h = harness(FakeToolchain::default()).await;
        h.tools.crash_compiles.store(1, Ordering::SeqCst);
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let err = h.cache.image(&key).await.unwrap_err();
        assert!(matches!(err, DuckError::InternalCompiler { stage: Stage::Audio, .. }));
        assert_eq!(FakeToolchain::count(&h.tools.waveforms), 0);
        let snapshot = h.cache.snapshot(&key).unwrap();
        assert_eq!(snapshot.audio, SlotStatus::Absent);
        assert_eq!(snapshot.image, SlotStatus::Absent);

        h.cache.image(&key).await.unwrap();
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 2);
        assert_eq!(FakeToolchain::count(&h.tools.waveforms), 1);
    }

    #[tokio::test]
    async fn encoder_failure_is_reported_and_retried() {
        let h = harness(FakeToolchain::default()).await;
        h.tools.fail_encode.store(true, Ordering::SeqCst);
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        match h.cache.audio(&key).await.unwrap_err() {
            DuckError::EncodingFailure {
                stage: Stage::Audio,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(exit_code, Some(2));
                assert!(stderr.contains("input has no samples"));
            }
            other => panic!("expected encoding failure, got {:?}", other),
        }
        assert_eq!(h.cache.snapshot(&key).unwrap().audio, SlotStatus::Absent);
        assert_eq!(h.scratch_files(), 0);
        assert!(!h.cache.store().render_path(&key, ArtifactKind::Audio).exists());

        h.tools.fail_encode.store(false, Ordering::SeqCst);
        h.cache.audio(&key).await.unwrap();
        assert_eq!(FakeToolchain::count(&h.tools.encodes), 2);
    }

    #[tokio::test]
    async fn waveform_failure_is_reported_and_retried() {
        let h = harness(FakeToolchain::default()).await;
        h.tools.fail_waveform.store(true, Ordering::SeqCst);
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let err = h.cache.image(&key).await.unwrap_err();
        assert!(matches!(
            err,
            DuckError::EncodingFailure {
                stage: Stage::Image,
                exit_code: Some(1),
                ..
            }
        ));
        let snapshot = h.cache.snapshot(&key).unwrap();
        assert_eq!(snapshot.image, SlotStatus::Absent);
        assert_eq!(snapshot.audio, SlotStatus::Resolved);
        assert!(!h.cache.store().render_path(&key, ArtifactKind::Image).exists());

        h.tools.fail_waveform.store(false, Ordering::SeqCst);
        h.cache.image(&key).await.unwrap();
        assert_eq!(FakeToolchain::count(&h.tools.waveforms), 2);
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 1);
    }

    #[tokio::test]
    async fn check_crash_is_not_memoized() {
        let h = harness(FakeToolchain::default()).await;
        h.tools.crash_checks.store(1, Ordering::SeqCst);
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let err = h.cache.check(&key).await.unwrap_err();
        assert!(matches!(err, DuckError::InternalCompiler { stage: Stage::Check, .. }));
        assert_eq!(h.cache.snapshot(&key).unwrap().diagnostics, SlotStatus::Absent);

        assert!(h.cache.check(&key).await.unwrap().is_clean());
        assert_eq!(FakeToolchain::count(&h.tools.checks), 2);
    }

    #[tokio::test]
    async fn compile_timeout_is_internal_compiler_error() {
        let h = harness(FakeToolchain::default()).await;
        h.tools.hang_compile.store(true, Ordering::SeqCst);
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let err = h.cache.audio(&key).await.unwrap_err();
        assert!(matches!(err, DuckError::InternalCompiler { exit_code: None, .. }));
        assert_eq!(err.kind(), ErrorKind::InternalCompilerError);
        assert_eq!(h.scratch_files(), 0);

        h.tools.hang_compile.store(false, Ordering::SeqCst);
        h.cache.audio(&key).await.unwrap();
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 2);
    }

    #[tokio::test]
    async fn spawn_failures_classified_by_tool() {
        let h = harness(FakeToolchain::default()).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        h.tools.missing_compiler.store(true, Ordering::SeqCst);
        let err = h.cache.check(&key).await.unwrap_err();
        assert!(matches!(err, DuckError::Spawn { stage: Stage::Check, .. }));
        assert_eq!(err.kind(), ErrorKind::InternalCompilerError);
        let err = h.cache.audio(&key).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalCompilerError);

        h.tools.missing_compiler.store(false, Ordering::SeqCst);
        h.tools.missing_encoder.store(true, Ordering::SeqCst);
        let err = h.cache.audio(&key).await.unwrap_err();
        assert!(matches!(err, DuckError::Spawn { stage: Stage::Audio, .. }));
        assert_eq!(err.kind(), ErrorKind::EncodingFailure);
        assert_eq!(h.cache.snapshot(&key).unwrap().audio, SlotStatus::Absent);
    }

    #[tokio::test]
    async fn syntax_error_is_diagnostic() {
        let h = harness(FakeToolchain::default()).await;
        let key = h.cache.submit(b"DAC @@ dac;").await.unwrap();

        let diagnostics = h.cache.check(&key).await.unwrap();
        assert_eq!(diagnostics.hash, key.to_string());
        assert_eq!(
            diagnostics.errors.as_deref(),
            Some("(1,5): error: unexpected '@'")
        );

        match h.cache.audio(&key).await.unwrap_err() {
            DuckError::Diagnostic { message, .. } => {
                assert_eq!(message, "(1,5): error: unexpected '@'")
            }
            other => panic!("expected diagnostic, got {:?}", other),
        }

        assert!(h.tools.executables.lock().unwrap().is_empty());
        assert_eq!(h.scratch_files(), 0);
        assert!(!h.cache.store().render_path(&key, ArtifactKind::Audio).exists());
    }

    #[tokio::test]
    async fn check_is_memoized() {
        let h = harness(FakeToolchain::default()).await;

        let first = h.cache.check_source(b"DAC dac;").await.unwrap();
        let second = h.cache.check_source(b"DAC dac;").await.unwrap();

        assert!(first.is_clean());
        assert_eq!(first, second);
        assert_eq!(FakeToolchain::count(&h.tools.checks), 1);
    }

    #[tokio::test]
    async fn encoding_timeout_is_reported_and_retried() {
        let h = harness(FakeToolchain::default()).await;
        h.tools.hang_encode.store(true, Ordering::SeqCst);
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let err = h.cache.audio(&key).await.unwrap_err();
        assert!(
            matches!(err, DuckError::EncodingTimeout { deadline, .. } if deadline == Duration::from_secs(4))
        );
        assert_eq!(h.scratch_files(), 0);
        let leftovers = std::fs::read_dir(h.dir.path().join("renders")).unwrap().count();
        assert_eq!(leftovers, 0);

        h.tools.hang_encode.store(false, Ordering::SeqCst);
        h.cache.audio(&key).await.unwrap();
        assert_eq!(FakeToolchain::count(&h.tools.encodes), 2);
    }

    #[tokio::test]
    async fn image_renders_audio_first() {
        let h = harness(FakeToolchain::default()).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let image = h.cache.image(&key).await.unwrap();
        assert!(image.to_string_lossy().ends_with(&format!("{}.png", key)));
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 1);
        assert_eq!(FakeToolchain::count(&h.tools.waveforms), 1);

        h.cache.audio(&key).await.unwrap();
        h.cache.image(&key).await.unwrap();
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 1);
        assert_eq!(FakeToolchain::count(&h.tools.waveforms), 1);
    }

    #[tokio::test]
    async fn invalid_keys_rejected() {
        let h = harness(FakeToolchain::default()).await;

        let upper = "A".repeat(40);
        let non_hex = "g".repeat(40);
        for candidate in ["", "abc", "../../../../etc/passwd", upper.as_str(), non_hex.as_str()] {
            let err = h.cache.lookup(candidate).unwrap_err();
            assert!(matches!(err, DuckError::InvalidKey(_)), "{:?}", candidate);
        }
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn missing_source_is_not_memoized() {
        let h = harness(FakeToolchain::default()).await;
        let key = compute_key(b"DAC dac;");
        let key = h.cache.lookup(key.as_str()).unwrap();

        let err = h.cache.source(&key).await.unwrap_err();
        assert!(matches!(err, DuckError::NotFound { .. }));

        std::fs::write(h.cache.store().source_path(&key), b"DAC dac;").unwrap();
        assert_eq!(h.cache.read_source(&key).await.unwrap(), "DAC dac;");
        h.cache.audio(&key).await.unwrap();
    }

    #[tokio::test]
    async fn access_resets_memory_timer() {
        let h = harness(FakeToolchain::default()).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();
        let audio = h.cache.audio(&key).await.unwrap();

        h.scheduler.advance(Duration::from_secs(9));
        h.cache.audio(&key).await.unwrap();
        h.scheduler.advance(Duration::from_secs(9));
        assert_eq!(h.cache.snapshot(&key).unwrap().state, EvictionState::Active);

        h.scheduler.advance(Duration::from_secs(2));
        let snapshot = h.cache.snapshot(&key).unwrap();
        assert_eq!(snapshot.state, EvictionState::MemoryEvicted);
        assert_eq!(snapshot.audio, SlotStatus::Absent);
        assert_eq!(snapshot.source, SlotStatus::Absent);
        assert!(audio.exists());
    }

    #[tokio::test]
    async fn two_tier_eviction_removes_renders() {
        let h = harness(FakeToolchain::default()).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();
        let image = h.cache.image(&key).await.unwrap();
        let audio = h.cache.store().render_path(&key, ArtifactKind::Audio);
        let source = h.cache.store().source_path(&key);

        h.scheduler.advance(MEMORY);
        assert_eq!(
            h.cache.snapshot(&key).unwrap().state,
            EvictionState::MemoryEvicted
        );

        h.scheduler.advance(DISK - Duration::from_secs(1));
        assert!(h.cache.contains(&key));
        assert!(audio.exists() && image.exists());

        h.scheduler.advance(Duration::from_secs(1));
        assert!(!h.cache.contains(&key));
        assert!(!audio.exists());
        assert!(!image.exists());
        assert!(source.exists());
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn renders_reload_after_memory_eviction() {
        let h = harness(FakeToolchain::default()).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();
        let image = h.cache.image(&key).await.unwrap();

        h.scheduler.advance(MEMORY);
        assert_eq!(
            h.cache.snapshot(&key).unwrap().state,
            EvictionState::MemoryEvicted
        );

        assert_eq!(h.cache.image(&key).await.unwrap(), image);
        h.cache.audio(&key).await.unwrap();
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 1);
        assert_eq!(FakeToolchain::count(&h.tools.waveforms), 1);

        let snapshot = h.cache.snapshot(&key).unwrap();
        assert_eq!(snapshot.state, EvictionState::Active);

        // Access cancelled the disk timer
        h.scheduler.advance(DISK);
        assert!(image.exists());
    }

    #[tokio::test]
    async fn entry_without_renders_removed_at_memory_timeout() {
        let h = harness(FakeToolchain::default()).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        h.scheduler.advance(MEMORY);
        assert!(!h.cache.contains(&key));
        assert!(h.cache.store().source_path(&key).exists());

        // Source survives, so the key is still usable
        h.cache.audio(&key).await.unwrap();
        assert!(h.cache.contains(&key));
    }

    #[tokio::test]
    async fn retained_entry_waits_for_disk_timer() {
        let h = harness_with(FakeToolchain::default(), true).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        h.scheduler.advance(MEMORY);
        assert_eq!(
            h.cache.snapshot(&key).unwrap().state,
            EvictionState::MemoryEvicted
        );

        h.scheduler.advance(DISK);
        assert!(!h.cache.contains(&key));
    }

    #[tokio::test]
    async fn in_flight_entry_stays_in_memory() {
        let h = harness(FakeToolchain::gated()).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let cache = h.cache.clone();
        let task_key = key.clone();
        let render = tokio::spawn(async move { cache.audio(&task_key).await });
        while FakeToolchain::count(&h.tools.compiles) == 0 {
            tokio::task::yield_now().await;
        }

        h.scheduler.advance(MEMORY);
        let snapshot = h.cache.snapshot(&key).unwrap();
        assert_eq!(snapshot.state, EvictionState::Active);
        assert_eq!(snapshot.audio, SlotStatus::Pending);

        h.tools.gate.as_ref().unwrap().add_permits(1);
        render.await.unwrap().unwrap();
        assert_eq!(h.cache.snapshot(&key).unwrap().audio, SlotStatus::Resolved);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_cancel_render() {
        let h = harness(FakeToolchain::gated()).await;
        let key = h.cache.submit(b"DAC dac;").await.unwrap();

        let cache = h.cache.clone();
        let task_key = key.clone();
        let abandoned = tokio::spawn(async move { cache.audio(&task_key).await });
        while FakeToolchain::count(&h.tools.compiles) == 0 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();

        h.tools.gate.as_ref().unwrap().add_permits(1);
        h.cache.audio(&key).await.unwrap();
        assert_eq!(FakeToolchain::count(&h.tools.compiles), 1);
    }
}
