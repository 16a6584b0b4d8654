//! Environment-driven configuration shared by both binaries, in the
//! teacher's `Config::from_env` style: typed fields, `.env` support via
//! `dotenvy`, and named errors for anything missing.

use crate::pg::ConnectionParams;

#[derive(Clone, Debug)]
pub struct PgEnvConfig {
    pub params: ConnectionParams,
}

impl PgEnvConfig {
    /// Reads `PG_USER`/`PG_HOST`/`PG_PORT`/`PG_DBNAME`, the four variables
    /// the original's `env_conn_params` requires (no password — left to
    /// `.pgpass`/peer trust as in the source).
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let user = require_env("PG_USER")?;
        let host = require_env("PG_HOST")?;
        let port = require_env("PG_PORT")?;
        let dbname = require_env("PG_DBNAME")?;

        Ok(Self {
            params: ConnectionParams {
                user,
                host,
                port,
                dbname,
            },
        })
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{key} is missing"))
}

/// Config for the `queue` binary: the fleet scheduler and worker runtime.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub pg: PgEnvConfig,
    pub machines_file: String,
    pub admin_addr: Option<String>,
    pub verbose_job_logs: bool,
    /// Whether a worker's `nix copy` may pull missing paths from the
    /// destination's own substituters rather than requiring everything to
    /// arrive from this side (`--substitute-on-destination`). Always paired
    /// with `--no-check-sigs` at the call site, since a remote builder's
    /// store is untrusted for signature purposes regardless of this setting.
    pub substitute_on_destination: bool,
}

impl QueueConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let pg = PgEnvConfig::from_env()?;
        let machines_file = std::env::var("DISPATCH_MACHINES_FILE")
            .map_err(|_| anyhow::anyhow!("DISPATCH_MACHINES_FILE is missing"))?;
        let admin_addr = env_or_fallback("DISPATCH_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|v| normalize_optional_addr(&v));
        let verbose_job_logs = env_bool("DISPATCH_VERBOSE").unwrap_or(false);
        let substitute_on_destination = env_bool("DISPATCH_SUBSTITUTE").unwrap_or(false);

        Ok(Self {
            pg,
            machines_file,
            admin_addr,
            verbose_job_logs,
            substitute_on_destination,
        })
    }
}

/// Config for the `enqueue` binary, constructed directly from its five
/// positional CLI arguments rather than the environment (§4.4, §6): the
/// hook is invoked by the Nix daemon, which passes connection parameters as
/// argv, not env vars.
#[derive(Clone, Debug)]
pub struct EnqueueArgs {
    pub pg: ConnectionParams,
    pub verbosity: i32,
}

impl EnqueueArgs {
    /// `argv[1..]` is `user host port database verbosity`, matching the
    /// source's `argc != 6` check (program name plus five arguments).
    pub fn parse(args: &[String]) -> anyhow::Result<Self> {
        if args.len() != 5 {
            anyhow::bail!(
                "expected 5 arguments (user host port database verbosity), got {}",
                args.len()
            );
        }

        let verbosity: i32 = args[4]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid verbosity {:?}", args[4]))?;

        Ok(Self {
            pg: ConnectionParams {
                user: args[0].clone(),
                host: args[1].clone(),
                port: args[2].clone(),
                dbname: args[3].clone(),
            },
            verbosity,
        })
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            std::env::var(fallback)
                .ok()
                .filter(|s| !s.trim().is_empty())
        })
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_args_rejects_wrong_arity() {
        let args = vec!["user".to_string(), "host".to_string()];
        assert!(EnqueueArgs::parse(&args).is_err());
    }

    #[test]
    fn enqueue_args_parses_five_positionals() {
        let args = vec![
            "nix".to_string(),
            "builder.example.com".to_string(),
            "5432".to_string(),
            "dispatch".to_string(),
            "2".to_string(),
        ];
        let parsed = EnqueueArgs::parse(&args).unwrap();
        assert_eq!(parsed.pg.host, "builder.example.com");
        assert_eq!(parsed.verbosity, 2);
    }
}
