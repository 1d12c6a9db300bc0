use std::path::Path;

use futures::future::join_all;
use tracing::warn;

use fastget_core::{
    build_adapter, load_global_config, RunContext, SearchHit, ServiceAdapter, ServiceError,
    ServiceRegistry,
};

use crate::{AppError, Result, SearchArgs};

pub async fn run(base: &Path, args: &SearchArgs) -> Result<()> {
    let registry = ServiceRegistry::load(&base.join("utils/settings/services.json"))?;
    let config = load_global_config(base.join("config.yaml"))?;
    let ctx = RunContext::new(&config.user_agent, None, base.join(&config.temp_dir))?;
    let keywords = args.keywords.join(" ");

    let mut adapters = Vec::new();
    for alias in args.services.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let entry = registry.by_alias(alias).ok_or_else(|| {
            AppError::MissingResource(format!("unknown service alias {alias}"))
        })?;
        adapters.push(build_adapter(entry, base)?);
    }

    let queries = adapters
        .iter()
        .map(|adapter| adapter.search(&ctx, &keywords));
    let mut hits: Vec<SearchHit> = Vec::new();
    for (adapter, outcome) in adapters.iter().zip(join_all(queries).await) {
        match outcome {
            Ok(results) => hits.extend(results),
            Err(ServiceError::Unsupported { service, .. }) => {
                warn!(service, "service has no search API");
            }
            Err(err) => warn!(service = adapter.name(), error = %err, "search failed"),
        }
    }

    if hits.is_empty() {
        println!("no results for {keywords:?}");
        return Ok(());
    }
    for hit in hits {
        let year = hit
            .year
            .map(|year| year.to_string())
            .unwrap_or_else(|| "----".to_string());
        println!(
            "[{service}] {title} ({year}) {kind} {url}",
            service = hit.service,
            title = hit.title,
            year = year,
            kind = hit.kind,
            url = hit.url
        );
    }
    Ok(())
}
