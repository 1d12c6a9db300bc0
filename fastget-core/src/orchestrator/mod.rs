//! Download orchestrator: drives each planned title through the
//! `planned → resolved → keys_obtained → downloading` pipeline, consults the
//! per-service cache, and spawns the external segment downloader.

mod cache;
mod command;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cdm::{CdmError, CdmGateway, LicenseFraming};
use crate::config::GlobalConfig;
use crate::service::{RunContext, ServiceAdapter, ServiceError};
use crate::title::{filename_for, sanitize, Title};

pub use cache::{CacheKey, CacheRecord, DownloadCache};
pub use command::{build_downloader_command, CommandInputs, DownloadCommand};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Cdm(#[from] CdmError),
    #[error("downloader exited with status {status}")]
    Subprocess { status: i32 },
    #[error("cache error: {0}")]
    Cache(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl OrchestratorError {
    /// Fatal errors abort the run; the rest fail only the current title.
    pub fn is_fatal(&self) -> bool {
        match self {
            OrchestratorError::Service(err) => err.is_fatal(),
            OrchestratorError::Cdm(CdmError::Unavailable { .. }) => true,
            OrchestratorError::Io { .. } => true,
            _ => false,
        }
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Per-title lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleState {
    Planned,
    Resolved,
    KeysObtained,
    Downloading,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for TitleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TitleState::Planned => "planned",
            TitleState::Resolved => "resolved",
            TitleState::KeysObtained => "keys_obtained",
            TitleState::Downloading => "downloading",
            TitleState::Completed => "completed",
            TitleState::Skipped => "skipped",
            TitleState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// CLI overrides for one run; `None` falls through to merged configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub quality: Option<u64>,
    pub select_video: Option<String>,
    pub select_audio: Option<String>,
    pub select_subtitle: Option<String>,
    pub drop_video: Option<String>,
    pub drop_audio: Option<String>,
    pub drop_subtitle: Option<String>,
    pub threads: Option<u32>,
    pub format: Option<String>,
    pub muxer: Option<String>,
    pub use_shaka_packager: bool,
    pub no_mux: bool,
    pub sub_only: bool,
    pub sub_no_mux: bool,
    pub sub_no_fix: bool,
    pub save_name: Option<String>,
    pub save_dir: Option<PathBuf>,
    pub slowdown: Option<u64>,
    pub no_cache: bool,
    pub append_id: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    adapter: Arc<dyn ServiceAdapter>,
    ctx: RunContext,
    cdm: Option<CdmGateway>,
    cache: DownloadCache,
    config: GlobalConfig,
    options: RunOptions,
}

impl Orchestrator {
    pub fn new(
        adapter: Arc<dyn ServiceAdapter>,
        ctx: RunContext,
        cdm: Option<CdmGateway>,
        cache: DownloadCache,
        config: GlobalConfig,
        options: RunOptions,
    ) -> Self {
        Self {
            adapter,
            ctx,
            cdm,
            cache,
            config,
            options,
        }
    }

    /// Processes titles strictly in planner order. `tmp/` is recreated at
    /// run start and removed again only after a fully clean run.
    pub async fn run(&mut self, titles: &[Title]) -> OrchestratorResult<RunReport> {
        let tmp_dir = self.ctx.tmp_dir.clone();
        let _ = fs::remove_dir_all(&tmp_dir).await;
        fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|source| OrchestratorError::Io {
                path: tmp_dir.clone(),
                source,
            })?;

        let mut report = RunReport::default();
        for (index, title) in titles.iter().enumerate() {
            if index > 0 {
                if let Some(seconds) = self.options.slowdown {
                    debug!(seconds, "slowdown between titles");
                    sleep(Duration::from_secs(seconds)).await;
                }
            }
            match self.process_title(title).await {
                Ok(TitleState::Skipped) => report.skipped += 1,
                Ok(_) => report.completed += 1,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(title = %title.display_name(), error = %err, "title failed");
                    report.failed += 1;
                }
            }
        }

        if report.failed == 0 {
            let _ = fs::remove_dir_all(&tmp_dir).await;
        }
        Ok(report)
    }

    async fn process_title(&mut self, title: &Title) -> OrchestratorResult<TitleState> {
        let title_name = title.display_name();
        let key = CacheKey::for_title(title);
        if !self.options.no_cache && self.cache.contains(&key) {
            info!(title = %title_name, "already in download cache, skipping");
            return Ok(TitleState::Skipped);
        }
        debug!(title = %title_name, state = %TitleState::Planned, "processing");

        let playlist = self.adapter.get_playlist(&self.ctx, title).await?;
        let media = self
            .adapter
            .get_mediainfo(&self.ctx, &playlist, self.options.quality)
            .await?;
        debug!(title = %title_name, state = %TitleState::Resolved, height = media.height, drm = playlist.drm, "resolved");

        let resolution = format!("{}p", media.height);
        let template = match title {
            Title::Episode(_) => &self.config.filename_template,
            Title::Movie(_) => &self.config.movie_filename_template,
        };
        let save_name = self.options.save_name.clone().unwrap_or_else(|| {
            filename_for(
                title,
                template,
                &resolution,
                &media.audio,
                self.options.append_id,
            )
        });
        let save_dir = self.save_dir_for(title);
        let container = self
            .options
            .format
            .clone()
            .unwrap_or_else(|| self.config.format.clone());
        let target = save_dir.join(format!("{save_name}.{container}"));
        let subtitle_sidecar = save_dir.join(format!("{save_name}.en.vtt"));

        // Skip-on-exists comes before key acquisition: an existing target
        // must trigger neither a license request nor a subprocess.
        if target.exists() {
            let size = std::fs::metadata(&target).map(|meta| meta.len()).unwrap_or(0);
            warn!(target = %target.display(), size, "file already exists, skipping");
            if subtitle_sidecar.exists() {
                let _ = fs::remove_file(&subtitle_sidecar).await;
            }
            self.record_completion(&key, &save_name)?;
            return Ok(TitleState::Skipped);
        }

        let keys_file = if playlist.drm {
            Some(self.acquire_keys(title, &playlist, &media).await?)
        } else {
            debug!(title = %title_name, "no DRM, bypassing key acquisition");
            None
        };
        if keys_file.is_some() {
            debug!(title = %title_name, state = %TitleState::KeysObtained, "keys written");
        }

        fs::create_dir_all(&save_dir)
            .await
            .map_err(|source| OrchestratorError::Io {
                path: save_dir.clone(),
                source,
            })?;

        // A pre-resolved subtitle that was not grafted into the manifest is
        // fetched as a sidecar and handed to the muxer.
        let subtitle_import = if media.manifest_path.is_none() && !self.options.sub_only {
            match playlist.subtitle_url.as_deref() {
                Some(url) => {
                    self.fetch_subtitle(url, &subtitle_sidecar).await?;
                    Some(subtitle_sidecar.clone())
                }
                None => None,
            }
        } else {
            None
        };

        let manifest_arg = media
            .manifest_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| playlist.manifest_url.clone());
        let command = build_downloader_command(&CommandInputs {
            config: &self.config,
            options: &self.options,
            manifest: &manifest_arg,
            save_name: &save_name,
            save_dir: &save_dir,
            tmp_dir: &self.ctx.tmp_dir,
            keys_file: keys_file.as_deref(),
            subtitle_import: subtitle_import.as_deref(),
            chosen_height: media.height,
        });

        info!(title = %title_name, state = %TitleState::Downloading, program = %command.program, "starting download");
        let status = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .status()
            .await
            .map_err(|source| OrchestratorError::Io {
                path: PathBuf::from(&command.program),
                source,
            })?;
        if !status.success() {
            return Err(OrchestratorError::Subprocess {
                status: status.code().unwrap_or(-1),
            });
        }

        if let Some(sidecar) = subtitle_import {
            if !self.options.sub_no_mux {
                let _ = fs::remove_file(&sidecar).await;
            }
        }

        self.record_completion(&key, &save_name)?;
        info!(title = %title_name, state = %TitleState::Completed, "done");
        Ok(TitleState::Completed)
    }

    fn save_dir_for(&self, title: &Title) -> PathBuf {
        if let Some(dir) = &self.options.save_dir {
            return dir.clone();
        }
        let mut dir = self
            .config
            .downloads_dir
            .join(sanitize(title.show_title()));
        if matches!(title, Title::Episode(_)) && self.config.season_folders && title.season() > 0
        {
            dir = dir.join(format!("Season {:02}", title.season()));
        }
        dir
    }

    async fn acquire_keys(
        &self,
        title: &Title,
        playlist: &crate::service::Playlist,
        media: &crate::service::MediaInfo,
    ) -> OrchestratorResult<PathBuf> {
        let gateway = self.cdm.as_ref().ok_or_else(|| {
            OrchestratorError::Cdm(CdmError::Unavailable {
                dir: PathBuf::from("utils/wvd"),
                detail: "DRM title but no CDM is configured".to_string(),
            })
        })?;
        let pssh = media.pssh.as_deref().ok_or_else(|| {
            OrchestratorError::Service(ServiceError::ManifestMalformed(
                "DRM title without a PSSH".to_string(),
            ))
        })?;
        let license_url = playlist
            .license_url
            .as_deref()
            .or_else(|| title.license_url())
            .ok_or_else(|| {
                OrchestratorError::Service(ServiceError::ManifestMalformed(
                    "DRM title without a license URL".to_string(),
                ))
            })?;
        let framing = playlist.framing.clone().unwrap_or(LicenseFraming::Raw);

        let keys = gateway.get_keys(pssh, license_url, &framing).await?;
        info!(title = %title.display_name(), count = keys.len(), "content keys obtained");

        let path = self.ctx.tmp_dir.join("keys.txt");
        let body = keys
            .iter()
            .map(|key| key.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(&path, body)
            .await
            .map_err(|source| OrchestratorError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    async fn fetch_subtitle(&self, url: &str, target: &PathBuf) -> OrchestratorResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| OrchestratorError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let response = self
            .ctx
            .http
            .get(url)
            .send()
            .await
            .map_err(ServiceError::from)?
            .error_for_status()
            .map_err(ServiceError::from)?;
        let body = response.bytes().await.map_err(ServiceError::from)?;
        fs::write(target, body)
            .await
            .map_err(|source| OrchestratorError::Io {
                path: target.clone(),
                source,
            })?;
        Ok(())
    }

    fn record_completion(&mut self, key: &CacheKey, save_name: &str) -> OrchestratorResult<()> {
        if self.options.no_cache {
            return Ok(());
        }
        self.cache.insert(key.clone(), save_name.to_string());
        self.cache.persist()
    }
}
