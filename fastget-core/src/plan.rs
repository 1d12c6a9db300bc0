//! Selection planner: turns a parsed catalog plus the user's selection
//! expression into the ordered list of titles to download.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::title::{MovieGroup, Series, Title};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no titles matched selection {expression:?}")]
    NoMatch { expression: String },
    #[error("invalid selection expression {expression:?}")]
    InvalidExpression { expression: String },
}

pub type PlanResult<T> = std::result::Result<T, PlanError>;

/// Mirror of the CLI selection flags.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub episode: Option<String>,
    pub season: Option<String>,
    pub complete: bool,
    pub movie: bool,
    pub titles: bool,
}

/// Planner output. `--titles` short-circuits to a listing and produces no
/// downloads.
#[derive(Debug)]
pub enum PlanOutcome {
    Listing(Vec<String>),
    Titles(Vec<Title>),
}

static EXACT_RE: OnceLock<Regex> = OnceLock::new();
static RANGE_RE: OnceLock<Regex> = OnceLock::new();
static SEASON_RE: OnceLock<Regex> = OnceLock::new();

fn exact_re() -> &'static Regex {
    EXACT_RE.get_or_init(|| Regex::new(r"^[Ss](\d+)[Ee](\d+)$").expect("valid regex"))
}

fn range_re() -> &'static Regex {
    RANGE_RE.get_or_init(|| {
        Regex::new(r"^[Ss](\d+)[Ee](\d+)-[Ss](\d+)[Ee](\d+)$").expect("valid regex")
    })
}

fn season_re() -> &'static Regex {
    SEASON_RE.get_or_init(|| Regex::new(r"^[Ss](\d+)$").expect("valid regex"))
}

/// Produces the ordered download plan for one run.
pub fn plan_titles(
    series: &Series,
    movies: &MovieGroup,
    options: &SelectOptions,
) -> PlanResult<PlanOutcome> {
    if options.titles {
        let mut lines: Vec<String> = series.iter().map(|ep| ep.display_name()).collect();
        lines.extend(movies.iter().map(|movie| movie.display_name()));
        return Ok(PlanOutcome::Listing(lines));
    }

    if let Some(expression) = &options.episode {
        let selected = select_episodes(series, expression)?;
        return finish(selected, expression);
    }

    if let Some(expression) = &options.season {
        let selected = select_seasons(series, expression)?;
        return finish(selected, expression);
    }

    if options.complete {
        let selected: Vec<Title> = series.iter().cloned().map(Title::Episode).collect();
        return finish(selected, "--complete");
    }

    if options.movie {
        let selected: Vec<Title> = movies.iter().cloned().map(Title::Movie).collect();
        return finish(selected, "--movie");
    }

    // No selector: everything enumerable.
    let mut selected: Vec<Title> = series.iter().cloned().map(Title::Episode).collect();
    selected.extend(movies.iter().cloned().map(Title::Movie));
    finish(selected, "<all>")
}

fn finish(selected: Vec<Title>, expression: &str) -> PlanResult<PlanOutcome> {
    if selected.is_empty() {
        return Err(PlanError::NoMatch {
            expression: expression.to_string(),
        });
    }
    Ok(PlanOutcome::Titles(selected))
}

fn select_episodes(series: &Series, expression: &str) -> PlanResult<Vec<Title>> {
    let expression = expression.trim();

    if let Some(captures) = range_re().captures(expression) {
        let parse = |index: usize| -> u32 {
            captures
                .get(index)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        let (from_season, from_episode, to_season, to_episode) =
            (parse(1), parse(2), parse(3), parse(4));
        if from_season > to_season || from_episode > to_episode {
            return Err(PlanError::InvalidExpression {
                expression: expression.to_string(),
            });
        }
        // The range is the Cartesian product of both intervals, not a flat
        // walk from start to end.
        return Ok(series
            .iter()
            .filter(|ep| {
                (from_season..=to_season).contains(&ep.season)
                    && (from_episode..=to_episode).contains(&ep.number)
            })
            .cloned()
            .map(Title::Episode)
            .collect());
    }

    if expression.contains(',') && expression.split(',').all(|part| exact_re().is_match(part.trim()))
    {
        let wanted: Vec<(u32, u32)> = expression
            .split(',')
            .filter_map(|part| parse_exact(part.trim()))
            .collect();
        return Ok(series
            .iter()
            .filter(|ep| wanted.contains(&(ep.season, ep.number)))
            .cloned()
            .map(Title::Episode)
            .collect());
    }

    if let Some((season, number)) = parse_exact(expression) {
        return Ok(series
            .iter()
            .filter(|ep| ep.season == season && ep.number == number)
            .cloned()
            .map(Title::Episode)
            .collect());
    }

    // Free text: case-insensitive substring match against the canonical
    // display form.
    let needle = expression.to_uppercase();
    Ok(series
        .iter()
        .filter(|ep| ep.display_name().to_uppercase().contains(&needle))
        .cloned()
        .map(Title::Episode)
        .collect())
}

fn select_seasons(series: &Series, expression: &str) -> PlanResult<Vec<Title>> {
    let mut seasons = Vec::new();
    for part in expression.split(',') {
        let part = part.trim();
        match season_re()
            .captures(part)
            .and_then(|captures| captures.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            Some(season) => seasons.push(season),
            None => {
                return Err(PlanError::InvalidExpression {
                    expression: expression.to_string(),
                })
            }
        }
    }
    Ok(series
        .iter()
        .filter(|ep| seasons.contains(&ep.season))
        .cloned()
        .map(Title::Episode)
        .collect())
}

fn parse_exact(tag: &str) -> Option<(u32, u32)> {
    let captures = exact_re().captures(tag)?;
    let season = captures.get(1)?.as_str().parse().ok()?;
    let number = captures.get(2)?.as_str().parse().ok()?;
    Some((season, number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::title::Episode;

    fn series() -> Series {
        let mut episodes = Vec::new();
        for season in 1..=2 {
            for number in 1..=4 {
                episodes.push(Episode {
                    id: format!("{season}-{number}"),
                    service: "CTV".into(),
                    title: "Show".into(),
                    season,
                    number,
                    name: format!("Name {season}{number}"),
                    ..Episode::default()
                });
            }
        }
        Series::new(episodes)
    }

    fn tags(outcome: PlanOutcome) -> Vec<String> {
        match outcome {
            PlanOutcome::Titles(titles) => titles
                .iter()
                .map(|t| format!("S{:02}E{:02}", t.season(), t.number()))
                .collect(),
            PlanOutcome::Listing(_) => panic!("expected titles"),
        }
    }

    #[test]
    fn exact_tag_matches_one_episode() {
        let outcome = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                episode: Some("S01E03".into()),
                ..SelectOptions::default()
            },
        )
        .unwrap();
        assert_eq!(tags(outcome), vec!["S01E03"]);
    }

    #[test]
    fn range_is_cartesian_product() {
        let outcome = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                episode: Some("S01E01-S02E03".into()),
                ..SelectOptions::default()
            },
        )
        .unwrap();
        assert_eq!(
            tags(outcome),
            vec!["S01E01", "S01E02", "S01E03", "S02E01", "S02E02", "S02E03"]
        );
    }

    #[test]
    fn comma_list_is_a_set_union() {
        let outcome = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                episode: Some("S01E01,S02E04".into()),
                ..SelectOptions::default()
            },
        )
        .unwrap();
        assert_eq!(tags(outcome), vec!["S01E01", "S02E04"]);
    }

    #[test]
    fn free_text_matches_display_form() {
        let outcome = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                episode: Some("name 21".into()),
                ..SelectOptions::default()
            },
        )
        .unwrap();
        assert_eq!(tags(outcome), vec!["S02E01"]);
    }

    #[test]
    fn season_list_selects_whole_seasons() {
        let outcome = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                season: Some("S02".into()),
                ..SelectOptions::default()
            },
        )
        .unwrap();
        assert_eq!(tags(outcome), vec!["S02E01", "S02E02", "S02E03", "S02E04"]);

        let outcome = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                season: Some("S01,S02".into()),
                ..SelectOptions::default()
            },
        )
        .unwrap();
        assert_eq!(tags(outcome).len(), 8);
    }

    #[test]
    fn complete_selects_everything_in_order() {
        let outcome = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                complete: true,
                ..SelectOptions::default()
            },
        )
        .unwrap();
        assert_eq!(tags(outcome).len(), 8);
    }

    #[test]
    fn titles_flag_wins_over_other_selectors() {
        let outcome = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                episode: Some("S01E01".into()),
                titles: true,
                ..SelectOptions::default()
            },
        )
        .unwrap();
        match outcome {
            PlanOutcome::Listing(lines) => {
                assert_eq!(lines.len(), 8);
                assert!(lines[0].contains("S01E01"));
            }
            PlanOutcome::Titles(_) => panic!("expected listing"),
        }
    }

    #[test]
    fn empty_selection_is_an_error() {
        let err = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                episode: Some("S09E09".into()),
                ..SelectOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::NoMatch { .. }));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = plan_titles(
            &series(),
            &MovieGroup::default(),
            &SelectOptions {
                episode: Some("S02E01-S01E03".into()),
                ..SelectOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidExpression { .. }));
    }
}
