//! External downloader argument composition. Selector flags follow merged
//! configuration with CLI overrides winning over both config layers.

use std::path::Path;

use crate::config::GlobalConfig;

use super::RunOptions;

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadCommand {
    pub program: String,
    pub args: Vec<String>,
}

pub struct CommandInputs<'a> {
    pub config: &'a GlobalConfig,
    pub options: &'a RunOptions,
    pub manifest: &'a str,
    pub save_name: &'a str,
    pub save_dir: &'a Path,
    pub tmp_dir: &'a Path,
    pub keys_file: Option<&'a Path>,
    pub subtitle_import: Option<&'a Path>,
    pub chosen_height: u64,
}

pub fn build_downloader_command(inputs: &CommandInputs<'_>) -> DownloadCommand {
    let CommandInputs {
        config,
        options,
        manifest,
        save_name,
        save_dir,
        tmp_dir,
        keys_file,
        subtitle_import,
        chosen_height,
    } = inputs;

    let mut args: Vec<String> = vec![manifest.to_string(), "-mt".to_string()];

    if let Some(keys) = keys_file {
        args.push("--key-text-file".to_string());
        args.push(keys.display().to_string());
    }

    // CLI > per-service config > global config; an explicit --quality pins
    // the exact resolution chosen during mediainfo.
    let select_video = options
        .select_video
        .clone()
        .or_else(|| {
            options
                .quality
                .map(|_| format!("res='{chosen_height}'"))
        })
        .unwrap_or_else(|| config.select_video.clone());
    args.push("-sv".to_string());
    args.push(select_video);

    args.push("-sa".to_string());
    args.push(
        options
            .select_audio
            .clone()
            .unwrap_or_else(|| config.select_audio.clone()),
    );
    args.push("-ss".to_string());
    args.push(
        options
            .select_subtitle
            .clone()
            .unwrap_or_else(|| config.select_subtitle.clone()),
    );

    for (flag, value) in [
        ("-dv", options.drop_video.as_ref().or(config.drop_video.as_ref())),
        ("-da", options.drop_audio.as_ref().or(config.drop_audio.as_ref())),
        (
            "-ds",
            options
                .drop_subtitle
                .as_ref()
                .or(config.drop_subtitle.as_ref()),
        ),
    ] {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    }

    if !options.no_mux {
        let format = options.format.clone().unwrap_or_else(|| config.format.clone());
        let muxer = options.muxer.clone().unwrap_or_else(|| config.muxer.clone());
        let mut mux = format!("format={format}:muxer={muxer}");
        if options.sub_no_mux {
            mux.push_str(":skip_sub=true");
        }
        args.push("-M".to_string());
        args.push(mux);
    }

    args.push("--thread-count".to_string());
    args.push(options.threads.unwrap_or(config.threads).to_string());
    args.push("--save-name".to_string());
    args.push(save_name.to_string());
    args.push("--tmp-dir".to_string());
    args.push(tmp_dir.display().to_string());
    args.push("--save-dir".to_string());
    args.push(save_dir.display().to_string());

    if let Some(subtitle) = subtitle_import {
        args.push("--mux-import".to_string());
        args.push(format!(
            "path={}:lang=eng:name=English",
            subtitle.display()
        ));
    }
    if options.sub_no_fix {
        args.push("--auto-subtitle-fix".to_string());
        args.push("false".to_string());
    }
    if options.use_shaka_packager {
        args.push("--use-shaka-packager".to_string());
    }
    if options.sub_only {
        args.push("--sub-only".to_string());
    }

    DownloadCommand {
        program: config.downloader.clone(),
        args,
    }
}
