//! Mutable DASH manifest tree.
//!
//! Parsed manifests are plain structs so adapters can rewrite them in place
//! (inject hidden representations, graft subtitle tracks, pin base URLs) and
//! re-serialize a canonical document for the external downloader. Unknown
//! attributes and elements are dropped on the floor; the downloader only
//! needs the elements modelled here.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{ManifestError, ManifestResult};

pub const WIDEVINE_SCHEME_ID: &str = "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mpd {
    #[serde(rename = "@xmlns", skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<String>,
    #[serde(rename = "@xmlns:cenc", skip_serializing_if = "Option::is_none")]
    pub xmlns_cenc: Option<String>,
    #[serde(rename = "@profiles", skip_serializing_if = "Option::is_none")]
    pub profiles: Option<String>,
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub mpd_type: Option<String>,
    #[serde(
        rename = "@mediaPresentationDuration",
        skip_serializing_if = "Option::is_none"
    )]
    pub media_presentation_duration: Option<String>,
    #[serde(rename = "@minBufferTime", skip_serializing_if = "Option::is_none")]
    pub min_buffer_time: Option<String>,
    #[serde(rename = "BaseURL", default, skip_serializing_if = "Vec::is_empty")]
    pub base_urls: Vec<BaseUrl>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseUrl {
    #[serde(rename = "$text")]
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Period {
    #[serde(rename = "@id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "@start", skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(rename = "@duration", skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(rename = "BaseURL", default, skip_serializing_if = "Vec::is_empty")]
    pub base_urls: Vec<BaseUrl>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptationSet {
    #[serde(rename = "@id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "@group", skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(rename = "@contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "@mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(rename = "@codecs", skip_serializing_if = "Option::is_none")]
    pub codecs: Option<String>,
    #[serde(rename = "@lang", skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(rename = "@segmentAlignment", skip_serializing_if = "Option::is_none")]
    pub segment_alignment: Option<String>,
    #[serde(rename = "@startWithSAP", skip_serializing_if = "Option::is_none")]
    pub start_with_sap: Option<u32>,
    #[serde(rename = "@maxWidth", skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u64>,
    #[serde(rename = "@maxHeight", skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u64>,
    #[serde(
        rename = "ContentProtection",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub content_protection: Vec<ContentProtection>,
    #[serde(rename = "Role", default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(
        rename = "SegmentTemplate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default, skip_serializing_if = "Vec::is_empty")]
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Role {
    #[serde(rename = "@schemeIdUri", skip_serializing_if = "Option::is_none")]
    pub scheme_id_uri: Option<String>,
    #[serde(rename = "@value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Representation {
    #[serde(rename = "@id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "@bandwidth", skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@codecs", skip_serializing_if = "Option::is_none")]
    pub codecs: Option<String>,
    #[serde(rename = "@mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(rename = "@width", skip_serializing_if = "Option::is_none")]
    pub width: Option<u64>,
    #[serde(rename = "@height", skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    #[serde(rename = "@frameRate", skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<String>,
    #[serde(rename = "@audioSamplingRate", skip_serializing_if = "Option::is_none")]
    pub audio_sampling_rate: Option<String>,
    #[serde(rename = "@startWithSAP", skip_serializing_if = "Option::is_none")]
    pub start_with_sap: Option<u32>,
    #[serde(rename = "BaseURL", default, skip_serializing_if = "Vec::is_empty")]
    pub base_urls: Vec<BaseUrl>,
    #[serde(
        rename = "ContentProtection",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub content_protection: Vec<ContentProtection>,
    #[serde(
        rename = "SegmentTemplate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentProtection {
    #[serde(rename = "@schemeIdUri", skip_serializing_if = "Option::is_none")]
    pub scheme_id_uri: Option<String>,
    #[serde(rename = "@value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "@default_KID", skip_serializing_if = "Option::is_none")]
    pub default_kid: Option<String>,
    #[serde(rename = "pssh", default, skip_serializing_if = "Option::is_none")]
    pub pssh: Option<CencPssh>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CencPssh {
    #[serde(rename = "$text", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentTemplate {
    #[serde(rename = "@timescale", skip_serializing_if = "Option::is_none")]
    pub timescale: Option<u64>,
    #[serde(rename = "@initialization", skip_serializing_if = "Option::is_none")]
    pub initialization: Option<String>,
    #[serde(rename = "@media", skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    #[serde(rename = "@startNumber", skip_serializing_if = "Option::is_none")]
    pub start_number: Option<u64>,
    #[serde(rename = "@duration", skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(
        rename = "SegmentTimeline",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub segment_timeline: Option<SegmentTimeline>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<TimelineSegment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineSegment {
    #[serde(rename = "@t", skip_serializing_if = "Option::is_none")]
    pub t: Option<u64>,
    #[serde(rename = "@d")]
    pub d: u64,
    #[serde(rename = "@r", skip_serializing_if = "Option::is_none")]
    pub r: Option<i64>,
}

pub fn parse(input: &str) -> ManifestResult<Mpd> {
    quick_xml::de::from_str(input).map_err(|err| ManifestError::Dash(err.to_string()))
}

pub fn serialize(mpd: &Mpd) -> ManifestResult<String> {
    let body = quick_xml::se::to_string_with_root("MPD", mpd)
        .map_err(|err| ManifestError::Serialize(err.to_string()))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}"))
}

fn is_video(set: &AdaptationSet) -> bool {
    if set.content_type.as_deref() == Some("video") {
        return true;
    }
    if let Some(mime) = &set.mime_type {
        if mime.starts_with("video") {
            return true;
        }
    }
    set.representations.iter().any(|rep| {
        rep.mime_type
            .as_deref()
            .map(|mime| mime.starts_with("video"))
            .unwrap_or(false)
            || (rep.width.is_some() && rep.height.is_some())
    })
}

impl Mpd {
    /// Available video heights, tallest first.
    pub fn video_heights(&self) -> Vec<u64> {
        let mut heights: Vec<u64> = self
            .periods
            .iter()
            .flat_map(|period| period.adaptation_sets.iter())
            .filter(|set| is_video(set))
            .flat_map(|set| set.representations.iter())
            .filter_map(|rep| rep.height)
            .collect();
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights.dedup();
        heights
    }

    pub fn codecs(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for period in &self.periods {
            for set in &period.adaptation_sets {
                if let Some(codecs) = &set.codecs {
                    out.insert(codecs.clone());
                }
                for rep in &set.representations {
                    if let Some(codecs) = &rep.codecs {
                        out.insert(codecs.clone());
                    }
                }
            }
        }
        out
    }

    /// First `cenc:default_KID` advertised by any ContentProtection element.
    pub fn default_kid(&self) -> Option<String> {
        self.content_protection_iter()
            .find_map(|cp| cp.default_kid.clone())
    }

    /// Base64 Widevine PSSH embedded in the manifest, when present.
    pub fn widevine_pssh(&self) -> Option<String> {
        self.content_protection_iter()
            .filter(|cp| {
                cp.scheme_id_uri
                    .as_deref()
                    .map(|scheme| scheme.eq_ignore_ascii_case(WIDEVINE_SCHEME_ID))
                    .unwrap_or(false)
            })
            .find_map(|cp| {
                cp.pssh
                    .as_ref()
                    .and_then(|pssh| pssh.data.as_ref())
                    .map(|data| data.trim().to_string())
            })
    }

    pub fn is_protected(&self) -> bool {
        self.content_protection_iter().next().is_some()
    }

    fn content_protection_iter(&self) -> impl Iterator<Item = &ContentProtection> {
        self.periods
            .iter()
            .flat_map(|period| period.adaptation_sets.iter())
            .flat_map(|set| {
                set.content_protection
                    .iter()
                    .chain(set.representations.iter().flat_map(|rep| rep.content_protection.iter()))
            })
    }

    /// Appends a hidden higher-bitrate representation to the video set. The
    /// new id reuses the donor id with only the bandwidth suffix replaced.
    pub fn inject_representation(
        &mut self,
        width: u64,
        height: u64,
        bandwidth: u64,
    ) -> ManifestResult<()> {
        let set = self
            .periods
            .iter_mut()
            .flat_map(|period| period.adaptation_sets.iter_mut())
            .find(|set| is_video(set))
            .ok_or(ManifestError::NoVideo)?;
        let donor = set
            .representations
            .iter()
            .max_by_key(|rep| rep.bandwidth.unwrap_or(0))
            .cloned()
            .ok_or(ManifestError::NoVideo)?;

        let mut injected = donor.clone();
        injected.width = Some(width);
        injected.height = Some(height);
        injected.bandwidth = Some(bandwidth);
        injected.id = Some(match (&donor.id, donor.bandwidth) {
            (Some(id), Some(old)) if id.contains(&old.to_string()) => {
                id.replace(&old.to_string(), &bandwidth.to_string())
            }
            (Some(id), _) => format!("{id}-{bandwidth}"),
            (None, _) => bandwidth.to_string(),
        });
        set.representations.push(injected);
        Ok(())
    }

    /// Grafts a remote VTT subtitle track onto the first period as a text
    /// AdaptationSet with a single BaseURL representation.
    pub fn add_subtitle_adaptation(&mut self, vtt_url: &str) -> ManifestResult<()> {
        let period = self
            .periods
            .first_mut()
            .ok_or_else(|| ManifestError::Dash("manifest has no Period".to_string()))?;
        let representation = Representation {
            id: Some("caption".to_string()),
            bandwidth: Some(0),
            mime_type: Some("text/vtt".to_string()),
            base_urls: vec![BaseUrl {
                url: vtt_url.to_string(),
            }],
            ..Representation::default()
        };
        period.adaptation_sets.push(AdaptationSet {
            id: Some("caption".to_string()),
            content_type: Some("text".to_string()),
            mime_type: Some("text/vtt".to_string()),
            start_with_sap: Some(1),
            representations: vec![representation],
            ..AdaptationSet::default()
        });
        Ok(())
    }

    /// Pins the manifest-level BaseURL to an absolute location.
    pub fn set_base_url(&mut self, absolute: &str) {
        self.base_urls = vec![BaseUrl {
            url: absolute.to_string(),
        }];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013" type="static" mediaPresentationDuration="PT22M" minBufferTime="PT2S" profiles="urn:mpeg:dash:profile:isoff-on-demand:2011">
  <Period id="0">
    <AdaptationSet id="1" contentType="video" mimeType="video/mp4" segmentAlignment="true" startWithSAP="1">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc" cenc:default_KID="12345678-9012-3456-7890-123456789012"/>
      <ContentProtection schemeIdUri="urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed">
        <cenc:pssh>AAAAMnBzc2g=</cenc:pssh>
      </ContentProtection>
      <SegmentTemplate timescale="90000" initialization="init_$RepresentationID$.mp4" media="seg_$RepresentationID$_$Number$.m4s" startNumber="1"/>
      <Representation id="video-2800000" bandwidth="2800000" codecs="avc1.64001f" width="1280" height="720" frameRate="30"/>
      <Representation id="video-1400000" bandwidth="1400000" codecs="avc1.64001e" width="960" height="540" frameRate="30"/>
    </AdaptationSet>
    <AdaptationSet id="2" contentType="audio" mimeType="audio/mp4" lang="en">
      <Representation id="audio-128000" bandwidth="128000" codecs="mp4a.40.2" audioSamplingRate="48000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_heights_and_codecs() {
        let mpd = parse(FIXTURE).unwrap();
        assert_eq!(mpd.video_heights(), vec![720, 540]);
        let codecs = mpd.codecs();
        assert!(codecs.contains("avc1.64001f"));
        assert!(codecs.contains("mp4a.40.2"));
    }

    #[test]
    fn reads_protection_metadata() {
        let mpd = parse(FIXTURE).unwrap();
        assert!(mpd.is_protected());
        assert_eq!(
            mpd.default_kid().as_deref(),
            Some("12345678-9012-3456-7890-123456789012")
        );
        assert_eq!(mpd.widevine_pssh().as_deref(), Some("AAAAMnBzc2g="));
    }

    #[test]
    fn injects_representation_with_rewritten_id() {
        let mut mpd = parse(FIXTURE).unwrap();
        mpd.inject_representation(1920, 1080, 5600000).unwrap();
        assert_eq!(mpd.video_heights(), vec![1080, 720, 540]);
        let set = &mpd.periods[0].adaptation_sets[0];
        let injected = set.representations.last().unwrap();
        assert_eq!(injected.id.as_deref(), Some("video-5600000"));
        assert_eq!(injected.codecs.as_deref(), Some("avc1.64001f"));
        assert_eq!(injected.bandwidth, Some(5600000));
    }

    #[test]
    fn grafts_exactly_one_text_adaptation() {
        let mut mpd = parse(FIXTURE).unwrap();
        let before = mpd.periods[0].adaptation_sets.len();
        mpd.add_subtitle_adaptation("https://cdn.example.com/subs/en.vtt")
            .unwrap();
        let period = &mpd.periods[0];
        assert_eq!(period.adaptation_sets.len(), before + 1);
        let text_sets: Vec<_> = period
            .adaptation_sets
            .iter()
            .filter(|set| set.mime_type.as_deref() == Some("text/vtt"))
            .collect();
        assert_eq!(text_sets.len(), 1);
        let rendered = serialize(&mpd).unwrap();
        assert!(rendered.contains("text/vtt"));
        assert!(rendered.contains("https://cdn.example.com/subs/en.vtt"));
    }

    #[test]
    fn serialized_tree_parses_back() {
        let mut mpd = parse(FIXTURE).unwrap();
        mpd.set_base_url("https://cdn.example.net/vod/");
        let rendered = serialize(&mpd).unwrap();
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(reparsed.video_heights(), vec![720, 540]);
        assert_eq!(
            reparsed.base_urls.first().map(|b| b.url.as_str()),
            Some("https://cdn.example.net/vod/")
        );
    }
}
