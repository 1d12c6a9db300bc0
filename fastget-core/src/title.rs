use std::fmt;

use serde::{Deserialize, Serialize};

/// One episode of a series as discovered in a service catalog. `data` is an
/// opaque payload the owning adapter uses later to resolve playback (asset
/// id, manifest URL, or a tuple of both).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub service: String,
    pub title: String,
    pub season: u32,
    pub number: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Episode {
    /// Canonical display string. Zero season or number components are
    /// elided rather than rendered as `S00`/`E00`.
    pub fn display_name(&self) -> String {
        let text = match (self.season, self.number) {
            (0, 0) => format!("{} {}", self.title, self.name),
            (0, number) => format!("{} E{:02} {}", self.title, number, self.name),
            (season, 0) => format!("{} S{:02} {}", self.title, season, self.name),
            (season, number) => {
                format!("{} S{:02}E{:02} {}", self.title, season, number, self.name)
            }
        };
        text.trim_end().to_string()
    }
}

impl fmt::Display for Episode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub id: String,
    pub service: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Movie {
    pub fn display_name(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({})", self.title, year),
            None => self.title.clone(),
        }
    }
}

impl fmt::Display for Movie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Ordered sequence of episodes, sorted by `(season, number, year)`. The
/// sort is stable, so insertion order survives key ties.
#[derive(Debug, Clone, Default)]
pub struct Series {
    episodes: Vec<Episode>,
}

impl Series {
    pub fn new(mut episodes: Vec<Episode>) -> Self {
        episodes.sort_by_key(|ep| (ep.season, ep.number, ep.year.unwrap_or(0)));
        Self { episodes }
    }

    pub fn episodes(&self) -> &[Episode] {
        &self.episodes
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Episode> {
        self.episodes.iter()
    }

    /// Renumbers episodes ordinally within each season. Used for feeds that
    /// label every entry `E00` or repeat numbers across a season.
    pub fn force_numbering(&mut self) {
        let mut current_season = None;
        let mut next_number = 0u32;
        for episode in &mut self.episodes {
            if current_season != Some(episode.season) {
                current_season = Some(episode.season);
                next_number = 0;
            }
            next_number += 1;
            episode.number = next_number;
        }
    }
}

impl IntoIterator for Series {
    type Item = Episode;
    type IntoIter = std::vec::IntoIter<Episode>;

    fn into_iter(self) -> Self::IntoIter {
        self.episodes.into_iter()
    }
}

/// Movies from one catalog, ordered by year then title.
#[derive(Debug, Clone, Default)]
pub struct MovieGroup {
    movies: Vec<Movie>,
}

impl MovieGroup {
    pub fn new(mut movies: Vec<Movie>) -> Self {
        movies.sort_by(|a, b| {
            (a.year.unwrap_or(0), &a.title).cmp(&(b.year.unwrap_or(0), &b.title))
        });
        Self { movies }
    }

    pub fn movies(&self) -> &[Movie] {
        &self.movies
    }

    pub fn len(&self) -> usize {
        self.movies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.movies.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Movie> {
        self.movies.iter()
    }
}

/// A planned downloadable item.
#[derive(Debug, Clone, PartialEq)]
pub enum Title {
    Episode(Episode),
    Movie(Movie),
}

impl Title {
    pub fn service(&self) -> &str {
        match self {
            Title::Episode(ep) => &ep.service,
            Title::Movie(movie) => &movie.service,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Title::Episode(ep) => &ep.id,
            Title::Movie(movie) => &movie.id,
        }
    }

    pub fn show_title(&self) -> &str {
        match self {
            Title::Episode(ep) => &ep.title,
            Title::Movie(movie) => &movie.title,
        }
    }

    pub fn season(&self) -> u32 {
        match self {
            Title::Episode(ep) => ep.season,
            Title::Movie(_) => 0,
        }
    }

    pub fn number(&self) -> u32 {
        match self {
            Title::Episode(ep) => ep.number,
            Title::Movie(_) => 0,
        }
    }

    pub fn year(&self) -> Option<i32> {
        match self {
            Title::Episode(ep) => ep.year,
            Title::Movie(movie) => movie.year,
        }
    }

    pub fn episode_name(&self) -> &str {
        match self {
            Title::Episode(ep) => &ep.name,
            Title::Movie(_) => "",
        }
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Title::Episode(ep) => ep.data.as_ref(),
            Title::Movie(movie) => movie.data.as_ref(),
        }
    }

    pub fn subtitle_url(&self) -> Option<&str> {
        match self {
            Title::Episode(ep) => ep.subtitle_url.as_deref(),
            Title::Movie(movie) => movie.subtitle_url.as_deref(),
        }
    }

    pub fn license_url(&self) -> Option<&str> {
        match self {
            Title::Episode(ep) => ep.license_url.as_deref(),
            Title::Movie(movie) => movie.license_url.as_deref(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Title::Episode(ep) => ep.display_name(),
            Title::Movie(movie) => movie.display_name(),
        }
    }
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Clears episode names that carry no information: synonyms of the show
/// title and auto-generated `Episode N` placeholders.
pub fn normalize_episode_name(name: &str, show_title: &str) -> String {
    let trimmed = name.trim();
    if trimmed.eq_ignore_ascii_case(show_title.trim()) {
        return String::new();
    }
    let lower = trimmed.to_lowercase();
    if let Some(rest) = lower.strip_prefix("episode") {
        let rest = rest.trim();
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            return String::new();
        }
    }
    trimmed.to_string()
}

/// Inputs for filename template expansion.
#[derive(Debug, Clone)]
pub struct NameParts<'a> {
    pub title: &'a str,
    pub year: Option<i32>,
    pub season: u32,
    pub number: u32,
    pub name: &'a str,
    pub resolution: &'a str,
    pub service: &'a str,
    pub audio: &'a str,
}

impl<'a> NameParts<'a> {
    pub fn from_title(title: &'a Title, resolution: &'a str, audio: &'a str) -> Self {
        Self {
            title: title.show_title(),
            year: title.year(),
            season: title.season(),
            number: title.number(),
            name: title.episode_name(),
            resolution,
            service: title.service(),
            audio,
        }
    }
}

/// Expands a filename template. `S{season:02}` and `E{episode:02}` are
/// treated as units so that zero components elide their literal prefix.
pub fn expand_template(template: &str, parts: &NameParts<'_>) -> String {
    let season_tag = if parts.season == 0 {
        String::new()
    } else {
        format!("S{:02}", parts.season)
    };
    let episode_tag = if parts.number == 0 {
        String::new()
    } else {
        format!("E{:02}", parts.number)
    };

    let mut out = template.to_string();
    for token in ["S{season:02}", "S{season}"] {
        out = out.replace(token, &season_tag);
    }
    for token in [
        "E{episode:02}",
        "E{number:02}",
        "E{episode}",
        "E{number}",
    ] {
        out = out.replace(token, &episode_tag);
    }
    out = out.replace("{title}", parts.title);
    out = out.replace(
        "{year}",
        &parts.year.map(|y| y.to_string()).unwrap_or_default(),
    );
    out = out.replace("{name}", parts.name);
    out = out.replace("{resolution}", parts.resolution);
    out = out.replace("{service}", parts.service);
    out = out.replace("{audio}", parts.audio);
    out
}

const STRIPPED: &[char] = &[
    ':', ';', '/', '\\', '*', '!', '?', ',', '\'', '"', '<', '>', '|', '$', '#', '`',
];

/// Filename sanitizer. Applied to every expanded template and to directory
/// components derived from titles.
pub fn sanitize(value: &str) -> String {
    // Some feeds smuggle a literal `$` sentinel into titles; rewrite before
    // the strip pass so the remainder survives as text.
    let mut text = value.replace('$', "S");
    text = deunicode::deunicode(&text);
    text = text.replace('&', "and");
    text.retain(|c| !STRIPPED.contains(&c));
    let mut collapsed = collapse_runs(&text);
    if collapsed.matches('.').count() >= 2 {
        collapsed = collapse_runs(&collapsed.replace(' ', "."));
    }
    collapsed
        .trim_matches(|c| c == '.' || c == ' ' || c == '_')
        .to_string()
}

fn collapse_runs(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut previous: Option<char> = None;
    for c in value.chars() {
        if matches!(c, '.' | '_' | ' ') && previous == Some(c) {
            continue;
        }
        out.push(c);
        previous = Some(c);
    }
    out
}

/// Final filename stem for a planned title.
pub fn filename_for(
    title: &Title,
    template: &str,
    resolution: &str,
    audio: &str,
    append_id: bool,
) -> String {
    let parts = NameParts::from_title(title, resolution, audio);
    let mut stem = sanitize(&expand_template(template, &parts));
    if append_id {
        let id = sanitize(title.id());
        if !id.is_empty() {
            stem.push('.');
            stem.push_str(&id);
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(season: u32, number: u32) -> Episode {
        Episode {
            id: format!("ep-{season}-{number}"),
            service: "CTV".into(),
            title: "Show".into(),
            season,
            number,
            name: String::new(),
            ..Episode::default()
        }
    }

    #[test]
    fn display_name_elides_zero_components() {
        let mut ep = episode(1, 3);
        ep.name = "Pilot".into();
        assert_eq!(ep.display_name(), "Show S01E03 Pilot");

        ep.season = 0;
        assert_eq!(ep.display_name(), "Show E03 Pilot");

        ep.season = 2;
        ep.number = 0;
        assert_eq!(ep.display_name(), "Show S02 Pilot");

        ep.season = 0;
        assert_eq!(ep.display_name(), "Show Pilot");
    }

    #[test]
    fn filename_law() {
        let title = Title::Episode(Episode {
            id: "1".into(),
            service: "CTV".into(),
            title: "Show: Two".into(),
            season: 1,
            number: 3,
            name: "It's Here".into(),
            ..Episode::default()
        });
        let stem = filename_for(
            &title,
            "{title}.S{season:02}E{episode:02}.{name}.{resolution}.{service}.{audio}",
            "1080p",
            "AAC2.0",
            false,
        );
        assert_eq!(stem, "Show.Two.S01E03.Its.Here.1080p.CTV.AAC2.0");
    }

    #[test]
    fn filename_zero_components_elided() {
        let title = Title::Episode(Episode {
            id: "1".into(),
            service: "CTV".into(),
            title: "One Off".into(),
            season: 0,
            number: 0,
            name: String::new(),
            ..Episode::default()
        });
        let stem = filename_for(
            &title,
            "{title}.S{season:02}E{episode:02}.{name}.{resolution}.{service}.{audio}",
            "720p",
            "AAC2.0",
            false,
        );
        assert!(!stem.contains("S00"));
        assert!(!stem.contains("E00"));
        assert!(!stem.contains("SE"));
        assert_eq!(stem, "One.Off.720p.CTV.AAC2.0");
    }

    #[test]
    fn sanitize_never_leaves_runs_or_forbidden_characters() {
        let stem = sanitize("A&B:  c?? d!! __ e...f");
        for c in super::STRIPPED {
            assert!(!stem.contains(*c), "found {c:?} in {stem}");
        }
        assert!(!stem.contains(".."));
        assert!(!stem.contains("__"));
        assert!(!stem.contains("  "));
        assert!(stem.contains("and"));
    }

    #[test]
    fn sanitize_rewrites_dollar_sentinel() {
        assert_eq!(sanitize("Pay $ Day"), "Pay S Day");
    }

    #[test]
    fn series_sorting_is_stable_across_permutations() {
        let mut episodes = vec![episode(2, 1), episode(1, 2), episode(1, 1), episode(3, 1)];
        let sorted = Series::new(episodes.clone());
        episodes.reverse();
        let sorted_again = Series::new(episodes);
        let left: Vec<_> = sorted.iter().map(|e| (e.season, e.number)).collect();
        let right: Vec<_> = sorted_again.iter().map(|e| (e.season, e.number)).collect();
        assert_eq!(left, right);
        assert_eq!(left, vec![(1, 1), (1, 2), (2, 1), (3, 1)]);
    }

    #[test]
    fn force_numbering_renumbers_within_seasons() {
        let mut series = Series::new(vec![episode(1, 0), episode(1, 0), episode(2, 0)]);
        series.force_numbering();
        let numbers: Vec<_> = series.iter().map(|e| (e.season, e.number)).collect();
        assert_eq!(numbers, vec![(1, 1), (1, 2), (2, 1)]);
    }

    #[test]
    fn normalize_clears_placeholders_and_synonyms() {
        assert_eq!(normalize_episode_name("Episode 3", "Show"), "");
        assert_eq!(normalize_episode_name("episode 12", "Show"), "");
        assert_eq!(normalize_episode_name("SHOW", "Show"), "");
        assert_eq!(normalize_episode_name("A Real Name", "Show"), "A Real Name");
    }

    #[test]
    fn movie_display_includes_year_when_known() {
        let movie = Movie {
            title: "Heat".into(),
            year: Some(1995),
            ..Movie::default()
        };
        assert_eq!(movie.display_name(), "Heat (1995)");
        let undated = Movie {
            title: "Heat".into(),
            ..Movie::default()
        };
        assert_eq!(undated.display_name(), "Heat");
    }

    #[test]
    fn movie_group_orders_by_year() {
        let group = MovieGroup::new(vec![
            Movie {
                title: "B".into(),
                year: Some(2020),
                ..Movie::default()
            },
            Movie {
                title: "A".into(),
                year: Some(2010),
                ..Movie::default()
            },
        ]);
        let years: Vec<_> = group.iter().map(|m| m.year).collect();
        assert_eq!(years, vec![Some(2010), Some(2020)]);
    }
}
