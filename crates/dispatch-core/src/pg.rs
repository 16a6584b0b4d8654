//! The Postgres adapter: connection setup, identifier/array escaping, and the
//! session-security search_path step every new connection runs (§4.2).

use sqlx::postgres::{PgConnectOptions, PgListener};
use sqlx::{Connection, Executor, PgConnection};

use crate::error::{ConnectError, ListenError};

/// Mirrors the original's `ConnectionParams`: just enough to dial a session,
/// no password field (auth is left to `.pgpass`/peer trust as in the source).
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub user: String,
    pub host: String,
    pub port: String,
    pub dbname: String,
}

const SET_EMPTY_SEARCH_PATH: &str = "SELECT pg_catalog.set_config('search_path', '', false)";

impl ConnectionParams {
    fn connect_options(&self) -> Result<PgConnectOptions, ConnectError> {
        let port: u16 = self
            .port
            .parse()
            .map_err(|_| ConnectError::InvalidPort(self.port.clone()))?;

        Ok(PgConnectOptions::new()
            .username(&self.user)
            .host(&self.host)
            .port(port)
            .database(&self.dbname))
    }
}

/// Opens a fresh, dedicated (non-pooled) connection and immediately locks
/// down its search_path. Every worker, listener, and dispatcher connection
/// goes through this so no session ever inherits an attacker-writable schema
/// search order.
pub async fn connect(params: &ConnectionParams) -> Result<PgConnection, ConnectError> {
    let opts = params.connect_options()?;

    let mut conn = PgConnection::connect_with(&opts)
        .await
        .map_err(ConnectError::Connect)?;

    conn.execute(SET_EMPTY_SEARCH_PATH)
        .await
        .map_err(ConnectError::SearchPath)?;

    Ok(conn)
}

/// Opens a connection already `LISTEN`ing on `channel_ident`, with the same
/// search_path lockdown. `sqlx::PgListener` escapes the channel identifier
/// internally, satisfying §4.2's `escape_identifier` step for this call site;
/// [`escape_identifier`] below remains available for any other caller that
/// needs to quote an identifier by hand.
pub async fn listen(
    params: &ConnectionParams,
    channel_ident: &str,
) -> Result<PgListener, ListenError> {
    let opts = params.connect_options().map_err(ConnectError::from)?;

    let mut listener = PgListener::connect_with(&sqlx::PgPool::connect_with(opts.clone()).await.map_err(ConnectError::Connect)?)
        .await
        .map_err(|source| ListenError::Listen {
            channel: channel_ident.to_string(),
            source,
        })?;

    listener
        .execute(SET_EMPTY_SEARCH_PATH)
        .await
        .map_err(ConnectError::SearchPath)?;

    listener
        .listen(channel_ident)
        .await
        .map_err(|source| ListenError::Listen {
            channel: channel_ident.to_string(),
            source,
        })?;

    Ok(listener)
}

/// Quotes a Postgres identifier by hand (doubling embedded `"`). Kept as a
/// standalone operation per the adapter's contract even though `PgListener`
/// performs its own quoting internally for `LISTEN`.
pub fn escape_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Wraps a UUID as `{…}`, the textual form the schema's stored procedures
/// expect for UUID parameters in this system.
pub fn escape_uuid(u: &uuid::Uuid) -> String {
    format!("{{{u}}}")
}

/// Builds a Postgres array literal `{a,b,c}` with no quoting. Callers must
/// ensure elements contain no commas or braces; every caller in this system
/// passes derivation paths, system tags, or feature tags, which by
/// construction never do.
pub fn to_sql_array<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = items
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{joined}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_identifiers_with_embedded_quotes() {
        assert_eq!(escape_identifier("events"), "\"events\"");
        assert_eq!(escape_identifier("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn wraps_uuid_in_braces() {
        let id: uuid::Uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        assert_eq!(escape_uuid(&id), "{11111111-1111-1111-1111-111111111111}");
    }

    #[test]
    fn builds_unquoted_array_literal() {
        assert_eq!(to_sql_array(["a", "b", "c"]), "{a,b,c}");
        assert_eq!(to_sql_array(Vec::<String>::new()), "{}");
    }
}
