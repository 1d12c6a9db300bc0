pub mod dash;
pub mod hls;
pub mod pssh;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to parse DASH manifest: {0}")]
    Dash(String),
    #[error("failed to serialize DASH manifest: {0}")]
    Serialize(String),
    #[error("failed to parse HLS playlist: {0}")]
    Hls(String),
    #[error("invalid key id: {0}")]
    InvalidKid(String),
    #[error("no playable video representation in manifest")]
    NoVideo,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

pub type ManifestResult<T> = std::result::Result<T, ManifestError>;

/// Quality selection. With no preference the tallest ladder rung wins; an
/// exact match is honored; otherwise the nearest height, ties breaking
/// toward the larger rung.
pub fn choose_height(heights: &[u64], desired: Option<u64>) -> Option<u64> {
    let mut sorted = heights.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();
    let best = *sorted.first()?;
    let desired = match desired {
        None => return Some(best),
        Some(value) => value,
    };
    if sorted.contains(&desired) {
        return Some(desired);
    }
    let mut chosen = best;
    let mut gap = u64::MAX;
    for height in sorted {
        let diff = height.abs_diff(desired);
        if diff < gap {
            gap = diff;
            chosen = height;
        }
    }
    Some(chosen)
}

/// Filename audio tag. Dolby Digital codecs map to the service's dolby tag
/// (`DDP5.1` or `DD5.1`); everything else is reported as stereo AAC.
pub fn audio_label<'a, I>(codecs: I, dolby_tag: &str) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    for codec in codecs {
        let lower = codec.to_ascii_lowercase();
        if lower.starts_with("ac-3") || lower.starts_with("ec-3") {
            return dolby_tag.to_string();
        }
    }
    "AAC2.0".to_string()
}

/// Replaces the host of `url`, preserving path and query. Used for services
/// whose manifests point at a placeholder origin that must be swapped for a
/// fixed CDN hostname.
pub fn swap_host(url: &str, host: &str) -> ManifestResult<String> {
    let mut parsed =
        url::Url::parse(url).map_err(|err| ManifestError::InvalidUrl(err.to_string()))?;
    parsed
        .set_host(Some(host))
        .map_err(|err| ManifestError::InvalidUrl(err.to_string()))?;
    Ok(parsed.into())
}
