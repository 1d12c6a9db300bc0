use std::fs;
use std::path::Path;

use clap::Parser;
use tracing::{error, info};

use crate::{AppError, Cli, FileArgs, Result};

/// Replays a file of CLI invocations, one per line, each as an independent
/// run. A failing line is reported and the remaining lines still execute.
pub async fn run(base: &Path, args: &FileArgs) -> Result<()> {
    let text = fs::read_to_string(&args.path)?;
    let mut total = 0usize;
    let mut failed = 0usize;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        total += 1;

        let words = match split_line(line) {
            Ok(words) => words,
            Err(reason) => {
                error!(line = lineno + 1, reason, "unparseable line");
                failed += 1;
                continue;
            }
        };
        let parsed =
            Cli::try_parse_from(std::iter::once("fastgetctl".to_string()).chain(words));
        let cli = match parsed {
            Ok(cli) => cli,
            Err(err) => {
                error!(line = lineno + 1, error = %err, "invalid invocation");
                failed += 1;
                continue;
            }
        };

        info!(line = lineno + 1, "running batch line");
        if let Err(err) = crate::dispatch(base, &cli.command).await {
            error!(line = lineno + 1, error = %err, "batch line failed");
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(AppError::Batch(format!("{failed} of {total} lines failed")));
    }
    info!(total, "batch file finished");
    Ok(())
}

/// Shell-style word splitting: whitespace separates, single and double
/// quotes group.
fn split_line(line: &str) -> std::result::Result<Vec<String>, &'static str> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut pending = false;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    pending = true;
                }
                c if c.is_whitespace() => {
                    if pending || !current.is_empty() {
                        words.push(std::mem::take(&mut current));
                        pending = false;
                    }
                }
                _ => current.push(c),
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated quote");
    }
    if pending || !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}
