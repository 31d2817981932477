use crate::{
    api::PoolConfig,
    cli::actions::{server::Args, Action},
};
use anyhow::{Context, Result};
use std::time::Duration;
use url::Url;

/// # Errors
/// Returns an error if required arguments are missing or invalid.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let idp_metadata_url = matches
        .get_one::<String>("idp-metadata-url")
        .cloned()
        .context("missing required argument: --idp-metadata-url")?;

    let entity_id = matches
        .get_one::<String>("entity-id")
        .cloned()
        .context("missing required argument: --entity-id")?;

    let backend_url = matches
        .get_one::<String>("backend-url")
        .context("missing required argument: --backend-url")?;
    let backend_url =
        Url::parse(backend_url).with_context(|| format!("invalid --backend-url: {backend_url}"))?;

    let frontend_origins = matches
        .get_many::<String>("frontend-origin")
        .map(|values| {
            values
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let pool = PoolConfig {
        max_connections: matches
            .get_one::<u32>("db-max-connections")
            .copied()
            .unwrap_or(5),
        min_connections: matches
            .get_one::<u32>("db-min-connections")
            .copied()
            .unwrap_or(1),
        max_lifetime: Duration::from_secs(
            matches
                .get_one::<u64>("db-max-lifetime")
                .copied()
                .unwrap_or(120),
        ),
    };

    if pool.min_connections > pool.max_connections {
        anyhow::bail!(
            "--db-min-connections ({}) cannot exceed --db-max-connections ({})",
            pool.min_connections,
            pool.max_connections
        );
    }

    Ok(Action::Server(Args {
        port,
        dsn,
        pool,
        idp_metadata_url,
        entity_id,
        backend_url,
        frontend_origins,
    }))
}
