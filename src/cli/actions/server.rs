use crate::api::{self, PoolConfig, ServerConfig};
use anyhow::Result;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub pool: PoolConfig,
    pub idp_metadata_url: String,
    pub entity_id: String,
    pub backend_url: Url,
    pub frontend_origins: Vec<String>,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database, the IdP metadata or the listener are not available.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    api::new(ServerConfig {
        port: args.port,
        dsn: args.dsn,
        pool: args.pool,
        idp_metadata_url: args.idp_metadata_url,
        entity_id: args.entity_id,
        backend_url: args.backend_url,
        frontend_origins: args.frontend_origins,
    })
    .await
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        (
            "db_pool",
            format!(
                "min={} max={} lifetime={}s",
                args.pool.min_connections,
                args.pool.max_connections,
                args.pool.max_lifetime.as_secs()
            ),
        ),
        ("idp_metadata_url", args.idp_metadata_url.clone()),
        ("entity_id", args.entity_id.clone()),
        ("backend_url", args.backend_url.to_string()),
        (
            "frontend_origins",
            if args.frontend_origins.is_empty() {
                "any".to_string()
            } else {
                args.frontend_origins.join(", ")
            },
        ),
    ];
    info!("{}", startup_message(&entries));
}

fn startup_message(entries: &[(&str, String)]) -> String {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    message
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}
