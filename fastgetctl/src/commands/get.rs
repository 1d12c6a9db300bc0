use std::path::Path;

use tracing::{info, warn};

use fastget_core::{
    build_adapter, load_global_config, load_service_overrides, plan_titles, CdmGateway,
    DownloadCache, MovieGroup, Orchestrator, PlanOutcome, RunContext, RunOptions, SelectOptions,
    Series, ServiceAdapter, ServiceError, ServicePaths, ServiceRegistry, Title, UrlKind,
};

use crate::{AppError, GetArgs, Result};

pub async fn run(base: &Path, args: &GetArgs) -> Result<()> {
    let registry = ServiceRegistry::load(&base.join("utils/settings/services.json"))?;
    let entry = registry
        .match_url(&args.url)
        .ok_or_else(|| ServiceError::BadUrl(args.url.clone()))?
        .clone();
    info!(service = %entry.name, url = %args.url, "starting run");

    let paths = ServicePaths::new(base, &entry.name);
    let config = load_global_config(base.join("config.yaml"))?
        .merged(load_service_overrides(paths.config())?);
    let adapter = build_adapter(&entry, base)?;
    let ctx = RunContext::new(
        &config.user_agent,
        args.proxy.as_deref(),
        base.join(&config.temp_dir),
    )?;

    // Resolve the catalog. An episode URL (either as the positional URL or
    // as the --episode argument) collapses the catalog to that one episode.
    let mut series = Series::default();
    let mut movies = MovieGroup::default();
    let mut episode_expression = args.episode.clone();

    if let Some(expression) = &args.episode {
        if expression.starts_with("http") {
            let (episode, _slug) = adapter.get_episode_from_url(&ctx, expression).await?;
            series = Series::new(vec![episode]);
            episode_expression = None;
        }
    }

    if series.is_empty() {
        match adapter.parse_url(&args.url)? {
            UrlKind::Movie => {
                movies = adapter.get_movies(&ctx, &args.url).await?;
            }
            UrlKind::Episode => {
                let (episode, _slug) = adapter.get_episode_from_url(&ctx, &args.url).await?;
                series = Series::new(vec![episode]);
                episode_expression = None;
            }
            UrlKind::Catalog => {
                if args.movie {
                    movies = adapter.get_movies(&ctx, &args.url).await?;
                } else {
                    series = adapter.get_series(&ctx, &args.url).await?;
                }
            }
        }
    }
    if args.force_numbering {
        series.force_numbering();
    }
    info!(
        episodes = series.len(),
        movies = movies.len(),
        "catalog resolved"
    );

    let select = SelectOptions {
        episode: episode_expression,
        season: args.season.clone(),
        complete: args.complete,
        movie: args.movie,
        titles: args.titles,
    };
    let titles = match plan_titles(&series, &movies, &select)? {
        PlanOutcome::Listing(lines) => {
            for line in lines {
                println!("{line}");
            }
            return Ok(());
        }
        PlanOutcome::Titles(titles) => titles,
    };
    info!(planned = titles.len(), "selection planned");

    if args.info {
        return print_info(adapter.as_ref(), &ctx, &titles, args.quality).await;
    }

    let cdm = match CdmGateway::from_config(&config.cdm, base, ctx.http.clone()) {
        Ok(gateway) => Some(gateway),
        Err(err) => {
            // Only fatal once a DRM title actually needs keys.
            warn!(error = %err, "no CDM available for this run");
            None
        }
    };
    let cache = DownloadCache::load(paths.cache())?;
    let options = run_options(args);
    let total = titles.len();

    let mut orchestrator =
        Orchestrator::new(adapter, ctx, cdm, cache, config, options);
    let report = orchestrator.run(&titles).await?;
    info!(
        completed = report.completed,
        skipped = report.skipped,
        failed = report.failed,
        "run finished"
    );
    if report.failed > 0 {
        return Err(AppError::TitlesFailed {
            failed: report.failed,
            total,
        });
    }
    Ok(())
}

fn run_options(args: &GetArgs) -> RunOptions {
    RunOptions {
        quality: args.quality,
        select_video: args.select_video.clone(),
        select_audio: args.select_audio.clone(),
        select_subtitle: args.select_subtitle.clone(),
        drop_video: args.drop_video.clone(),
        drop_audio: args.drop_audio.clone(),
        drop_subtitle: args.drop_subtitle.clone(),
        threads: args.threads,
        format: args.format.clone(),
        muxer: args.muxer.clone(),
        use_shaka_packager: args.use_shaka_packager,
        no_mux: args.no_mux,
        sub_only: args.sub_only,
        sub_no_mux: args.sub_no_mux,
        sub_no_fix: args.sub_no_fix,
        save_name: args.save_name.clone(),
        save_dir: args.save_dir.clone(),
        slowdown: args.slowdown,
        no_cache: args.no_cache,
        append_id: args.append_id,
    }
}

/// Multi-line info panel, the one place where output spans lines.
async fn print_info(
    adapter: &dyn ServiceAdapter,
    ctx: &RunContext,
    titles: &[Title],
    quality: Option<u64>,
) -> Result<()> {
    for title in titles {
        let playlist = adapter.get_playlist(ctx, title).await?;
        let media = adapter.get_mediainfo(ctx, &playlist, quality).await?;
        println!("{}", title.display_name());
        println!("  service:    {}", title.service());
        if let Some(year) = title.year() {
            println!("  year:       {year}");
        }
        println!("  resolution: {}p", media.height);
        println!("  audio:      {}", media.audio);
        println!("  drm:        {}", if playlist.drm { "widevine" } else { "none" });
        println!("  manifest:   {}", playlist.manifest_url);
        if let Some(license) = &playlist.license_url {
            println!("  license:    {license}");
        }
        if let Some(subtitle) = &playlist.subtitle_url {
            println!("  subtitle:   {subtitle}");
        }
        println!();
    }
    Ok(())
}
