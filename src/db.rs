use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::Executor;
use std::str::FromStr;

use crate::config::Config;

/// Open a connection pool from either a connection URL or the component
/// fields, pinning every connection's `search_path` to the configured
/// schema so all queries stay unqualified.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let pg = &config.store.postgres;

    let options = match &pg.url {
        Some(url) => PgConnectOptions::from_str(url)?,
        None => {
            let mut options = PgConnectOptions::new()
                .host(pg.host.as_deref().unwrap_or("localhost"))
                .port(pg.port.unwrap_or(5432))
                .ssl_mode(if pg.ssl {
                    PgSslMode::Require
                } else {
                    PgSslMode::Prefer
                });
            if let Some(user) = &pg.user {
                options = options.username(user);
            }
            if let Some(password) = &pg.password {
                options = options.password(password);
            }
            if let Some(database) = &pg.database {
                options = options.database(database);
            }
            options
        }
    };

    let schema = config.store.schema.clone();
    let pool = PgPoolOptions::new()
        .max_connections(pg.max_connections)
        .after_connect(move |conn, _meta| {
            let set_path = format!("SET search_path TO {}", quote_ident(&schema));
            Box::pin(async move {
                conn.execute(set_path.as_str()).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Quote a schema name as a SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(quote_ident("public"), "\"public\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
