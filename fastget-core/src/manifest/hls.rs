use super::{ManifestError, ManifestResult};

/// One row of an HLS master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsVariant {
    pub height: Option<u64>,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub uri: String,
}

pub fn is_master(text: &str) -> bool {
    m3u8_rs::is_master_playlist(text.as_bytes())
}

/// Enumerates variant streams of a master playlist in document order.
pub fn parse_master(text: &str) -> ManifestResult<Vec<HlsVariant>> {
    match m3u8_rs::parse_playlist_res(text.as_bytes()) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => Ok(master
            .variants
            .into_iter()
            .map(|variant| HlsVariant {
                height: variant.resolution.map(|res| res.height),
                bandwidth: variant.bandwidth,
                codecs: variant.codecs,
                uri: variant.uri,
            })
            .collect()),
        Ok(m3u8_rs::Playlist::MediaPlaylist(_)) => Err(ManifestError::Hls(
            "expected master playlist, found media playlist".to_string(),
        )),
        Err(err) => Err(ManifestError::Hls(format!("{err:?}"))),
    }
}

/// Available heights, tallest first.
pub fn heights(variants: &[HlsVariant]) -> Vec<u64> {
    let mut out: Vec<u64> = variants.iter().filter_map(|v| v.height).collect();
    out.sort_unstable_by(|a, b| b.cmp(a));
    out.dedup();
    out
}

/// Variant carrying the given height, preferring the highest bandwidth.
pub fn variant_for_height(variants: &[HlsVariant], height: u64) -> Option<&HlsVariant> {
    variants
        .iter()
        .filter(|v| v.height == Some(height))
        .max_by_key(|v| v.bandwidth)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720,CODECS=\"avc1.64001f,mp4a.40.2\"\n\
720.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=5600000,RESOLUTION=1920x1080,CODECS=\"avc1.640028,mp4a.40.2\"\n\
1080.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=1400000,RESOLUTION=960x540,CODECS=\"avc1.64001e,mp4a.40.2\"\n\
540.m3u8\n";

    const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:6\n\
#EXTINF:6.0,\n\
seg0.ts\n\
#EXT-X-ENDLIST\n";

    #[test]
    fn parses_master_variants_in_document_order() {
        let variants = parse_master(MASTER).unwrap();
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[0].height, Some(720));
        assert_eq!(variants[1].bandwidth, 5600000);
        assert_eq!(variants[2].uri, "540.m3u8");
        assert_eq!(heights(&variants), vec![1080, 720, 540]);
    }

    #[test]
    fn detects_variant_playlists() {
        assert!(is_master(MASTER));
        assert!(!is_master(MEDIA));
        assert!(parse_master(MEDIA).is_err());
    }

    #[test]
    fn selects_variant_by_height() {
        let variants = parse_master(MASTER).unwrap();
        let chosen = variant_for_height(&variants, 1080).unwrap();
        assert_eq!(chosen.uri, "1080.m3u8");
        assert!(variant_for_height(&variants, 480).is_none());
    }
}
