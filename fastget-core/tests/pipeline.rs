//! End-to-end orchestrator scenarios with a scripted adapter, an in-process
//! license server and a counter script standing in for the external
//! downloader.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use fastget_core::cdm::{CdmEngine, CdmGateway, CdmResult, CdmSession, ContentKey};
use fastget_core::plan::{plan_titles, PlanOutcome, SelectOptions};
use fastget_core::service::{
    ManifestKind, MediaInfo, Playlist, RunContext, ServiceAdapter, ServiceError, ServiceResult,
    UrlKind,
};
use fastget_core::{
    DownloadCache, Episode, GlobalConfig, LicenseFraming, Movie, MovieGroup, Orchestrator,
    RunOptions, Series, Title,
};

const PSSH: &str = "AAAAMnBzc2gAAAAA7e+LqXnWSs6jyCfc1R0h7QAAABISEBI0VniQEjRWeJASNFZ4kBI=";

fn sample_series() -> Series {
    let mut episodes = Vec::new();
    for number in 1..=3 {
        episodes.push(Episode {
            id: format!("ep-{number}"),
            service: "FAKE".into(),
            title: "The Name".into(),
            season: 1,
            number,
            name: format!("Part {number}"),
            year: Some(2021),
            drm: Some(true),
            ..Episode::default()
        });
    }
    Series::new(episodes)
}

struct FakeAdapter {
    drm: bool,
    license_url: Option<String>,
    series: Series,
}

#[async_trait]
impl ServiceAdapter for FakeAdapter {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn parse_url(&self, url: &str) -> ServiceResult<UrlKind> {
        if url.starts_with("https://fake.example/") {
            Ok(UrlKind::Catalog)
        } else {
            Err(ServiceError::BadUrl(url.to_string()))
        }
    }

    async fn get_series(&self, _ctx: &RunContext, _url: &str) -> ServiceResult<Series> {
        Ok(self.series.clone())
    }

    async fn get_episode_from_url(
        &self,
        _ctx: &RunContext,
        _url: &str,
    ) -> ServiceResult<(Episode, String)> {
        let episode = self.series.episodes()[0].clone();
        Ok((episode, "the-name".to_string()))
    }

    async fn get_movies(&self, _ctx: &RunContext, _url: &str) -> ServiceResult<MovieGroup> {
        Ok(MovieGroup::new(vec![Movie {
            id: "movie-1".into(),
            service: "FAKE".into(),
            title: "The Film".into(),
            year: Some(1999),
            ..Movie::default()
        }]))
    }

    async fn get_playlist(&self, _ctx: &RunContext, _title: &Title) -> ServiceResult<Playlist> {
        Ok(Playlist {
            manifest_url: "https://fake.example/main.mpd".to_string(),
            kind: ManifestKind::Dash,
            license_url: self.license_url.clone(),
            framing: Some(LicenseFraming::Raw),
            subtitle_url: None,
            drm: self.drm,
        })
    }

    async fn get_mediainfo(
        &self,
        _ctx: &RunContext,
        playlist: &Playlist,
        _quality: Option<u64>,
    ) -> ServiceResult<MediaInfo> {
        Ok(MediaInfo {
            height: 1080,
            pssh: playlist.drm.then(|| PSSH.to_string()),
            audio: "AAC2.0".to_string(),
            manifest_path: None,
        })
    }
}

#[derive(Default)]
struct EngineProbe {
    sessions: AtomicUsize,
    psshs: Mutex<Vec<String>>,
}

struct FakeEngine {
    probe: Arc<EngineProbe>,
    keys: Vec<ContentKey>,
}

struct FakeSession {
    probe: Arc<EngineProbe>,
    keys: Vec<ContentKey>,
}

#[async_trait]
impl CdmEngine for FakeEngine {
    async fn open_session(&self) -> CdmResult<Box<dyn CdmSession>> {
        self.probe.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            probe: self.probe.clone(),
            keys: self.keys.clone(),
        }))
    }
}

#[async_trait]
impl CdmSession for FakeSession {
    async fn challenge(&mut self, pssh_b64: &str) -> CdmResult<Vec<u8>> {
        self.probe.psshs.lock().unwrap().push(pssh_b64.to_string());
        Ok(b"challenge-bytes".to_vec())
    }

    async fn keys(&mut self, _license: &[u8]) -> CdmResult<Vec<ContentKey>> {
        Ok(self.keys.clone())
    }
}

fn content_keys() -> Vec<ContentKey> {
    vec![ContentKey {
        kid: "00112233445566778899aabbccddeeff".into(),
        key: "ffeeddccbbaa99887766554433221100".into(),
    }]
}

/// Serves one HTTP request, capturing the raw request bytes.
async fn license_server_once(
    response_body: Vec<u8>,
) -> (String, tokio::sync::oneshot::Receiver<Vec<u8>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if request_complete(&request) {
                break;
            }
        }
        let _ = tx.send(request);
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            response_body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(&response_body).await.unwrap();
        let _ = socket.shutdown().await;
    });
    (format!("http://{addr}/license"), rx)
}

fn request_complete(raw: &[u8]) -> bool {
    let Some(header_end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let headers = String::from_utf8_lossy(&raw[..header_end]).to_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    raw.len() >= header_end + 4 + content_length
}

/// Writes an executable stub downloader that appends one line per
/// invocation to `counter` and exits with `exit_code`.
#[cfg(unix)]
fn stub_downloader(dir: &Path, counter: &Path, exit_code: i32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(format!("stub-downloader-{exit_code}"));
    let script = format!(
        "#!/bin/sh\necho run >> {}\nexit {exit_code}\n",
        counter.display()
    );
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn invocations(counter: &Path) -> usize {
    std::fs::read_to_string(counter)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

struct Fixture {
    _root: tempfile::TempDir,
    base: PathBuf,
    counter: PathBuf,
    config: GlobalConfig,
}

#[cfg(unix)]
fn fixture(exit_code: i32) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let base = root.path().to_path_buf();
    let counter = base.join("counter.txt");
    let downloader = stub_downloader(&base, &counter, exit_code);
    let config = GlobalConfig {
        downloads_dir: base.join("downloads"),
        temp_dir: base.join("tmp"),
        downloader: downloader.display().to_string(),
        ..GlobalConfig::default()
    };
    Fixture {
        _root: root,
        base,
        counter,
        config,
    }
}

fn run_context(fixture: &Fixture) -> RunContext {
    RunContext::new("fastget-tests/1.0", None, fixture.base.join("tmp")).unwrap()
}

fn gateway(probe: Arc<EngineProbe>) -> CdmGateway {
    CdmGateway::new(
        Arc::new(FakeEngine {
            probe,
            keys: content_keys(),
        }),
        reqwest::Client::new(),
    )
}

fn planned_titles(series: &Series, expression: &str) -> Vec<Title> {
    let outcome = plan_titles(
        series,
        &MovieGroup::default(),
        &SelectOptions {
            episode: Some(expression.to_string()),
            ..SelectOptions::default()
        },
    )
    .unwrap();
    match outcome {
        PlanOutcome::Titles(titles) => titles,
        PlanOutcome::Listing(_) => panic!("expected titles"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn catalog_then_episode_resolves_one_title() {
    let fixture = fixture(0);
    let ctx = run_context(&fixture);
    let adapter = FakeAdapter {
        drm: false,
        license_url: None,
        series: sample_series(),
    };
    let series = adapter
        .get_series(&ctx, "https://fake.example/shows/the-name")
        .await
        .unwrap();
    assert!(!series.is_empty());

    let titles = planned_titles(&series, "S01E01");
    assert_eq!(titles.len(), 1);
    assert!(titles[0].display_name().contains("S01E01"));
}

#[cfg(unix)]
#[tokio::test]
async fn non_drm_flow_never_touches_the_cdm() {
    let fixture = fixture(0);
    let ctx = run_context(&fixture);
    let adapter = Arc::new(FakeAdapter {
        drm: false,
        license_url: None,
        series: sample_series(),
    });
    let titles = planned_titles(&adapter.series, "S01E01");

    let probe = Arc::new(EngineProbe::default());
    let cache = DownloadCache::load(fixture.base.join("cache.json")).unwrap();
    let mut orchestrator = Orchestrator::new(
        adapter,
        ctx,
        Some(gateway(probe.clone())),
        cache,
        fixture.config.clone(),
        RunOptions::default(),
    );
    let report = orchestrator.run(&titles).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(probe.sessions.load(Ordering::SeqCst), 0);
    assert_eq!(invocations(&fixture.counter), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn drm_round_trip_exchanges_the_challenge() {
    let fixture = fixture(0);
    let ctx = run_context(&fixture);
    let (license_url, request_rx) = license_server_once(b"license-bytes".to_vec()).await;
    let adapter = Arc::new(FakeAdapter {
        drm: true,
        license_url: Some(license_url),
        series: sample_series(),
    });
    let titles = planned_titles(&adapter.series, "S01E01");

    let probe = Arc::new(EngineProbe::default());
    let cache = DownloadCache::load(fixture.base.join("cache.json")).unwrap();
    let mut orchestrator = Orchestrator::new(
        adapter,
        ctx,
        Some(gateway(probe.clone())),
        cache,
        fixture.config.clone(),
        RunOptions::default(),
    );
    let report = orchestrator.run(&titles).await.unwrap();
    assert_eq!(report.completed, 1);

    // One fresh session, challenged with the manifest's PSSH.
    assert_eq!(probe.sessions.load(Ordering::SeqCst), 1);
    assert_eq!(probe.psshs.lock().unwrap().as_slice(), &[PSSH.to_string()]);

    // The raw framing posts the challenge bytes verbatim.
    let request = request_rx.await.unwrap();
    let body_at = request
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
        .unwrap();
    assert_eq!(&request[body_at..], b"challenge-bytes");
    assert_eq!(invocations(&fixture.counter), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn cache_gives_at_most_once_downloads_across_runs() {
    let fixture = fixture(0);
    let adapter = Arc::new(FakeAdapter {
        drm: false,
        license_url: None,
        series: sample_series(),
    });
    let titles = planned_titles(&adapter.series, "S01E02");
    let cache_path = fixture.base.join("cache.json");

    for _ in 0..2 {
        let ctx = run_context(&fixture);
        let cache = DownloadCache::load(&cache_path).unwrap();
        let mut orchestrator = Orchestrator::new(
            adapter.clone(),
            ctx,
            None,
            cache,
            fixture.config.clone(),
            RunOptions::default(),
        );
        orchestrator.run(&titles).await.unwrap();
    }
    assert_eq!(invocations(&fixture.counter), 1);

    // With --no-cache the second run downloads again.
    let ctx = run_context(&fixture);
    let cache = DownloadCache::load(&cache_path).unwrap();
    let mut orchestrator = Orchestrator::new(
        adapter.clone(),
        ctx,
        None,
        cache,
        fixture.config.clone(),
        RunOptions {
            no_cache: true,
            ..RunOptions::default()
        },
    );
    orchestrator.run(&titles).await.unwrap();
    assert_eq!(invocations(&fixture.counter), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn existing_target_skips_license_and_subprocess() {
    let fixture = fixture(0);
    let ctx = run_context(&fixture);
    let adapter = Arc::new(FakeAdapter {
        drm: true,
        license_url: Some("http://127.0.0.1:1/license".to_string()),
        series: sample_series(),
    });
    let titles = planned_titles(&adapter.series, "S01E01");

    // Pre-create the target exactly where the orchestrator would write it.
    let target_dir = fixture
        .config
        .downloads_dir
        .join("The Name")
        .join("Season 01");
    std::fs::create_dir_all(&target_dir).unwrap();
    std::fs::write(
        target_dir.join("The.Name.S01E01.Part.1.1080p.FAKE.AAC2.0.mkv"),
        b"partial",
    )
    .unwrap();

    let probe = Arc::new(EngineProbe::default());
    let cache = DownloadCache::load(fixture.base.join("cache.json")).unwrap();
    let mut orchestrator = Orchestrator::new(
        adapter,
        ctx,
        Some(gateway(probe.clone())),
        cache,
        fixture.config.clone(),
        RunOptions::default(),
    );
    let report = orchestrator.run(&titles).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.completed, 0);
    assert_eq!(probe.sessions.load(Ordering::SeqCst), 0);
    assert_eq!(invocations(&fixture.counter), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn failing_downloader_fails_the_title_but_not_the_run() {
    let fixture = fixture(3);
    let ctx = run_context(&fixture);
    let adapter = Arc::new(FakeAdapter {
        drm: false,
        license_url: None,
        series: sample_series(),
    });
    let titles = planned_titles(&adapter.series, "S01E01,S01E02");
    assert_eq!(titles.len(), 2);

    let cache = DownloadCache::load(fixture.base.join("cache.json")).unwrap();
    let mut orchestrator = Orchestrator::new(
        adapter,
        ctx,
        None,
        cache,
        fixture.config.clone(),
        RunOptions::default(),
    );
    let report = orchestrator.run(&titles).await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.completed, 0);
    // Both titles were attempted despite the first failure.
    assert_eq!(invocations(&fixture.counter), 2);
    // Nothing failed-but-cached: a rerun would retry both.
    let cache = DownloadCache::load(fixture.base.join("cache.json")).unwrap();
    assert!(cache.is_empty());
}
