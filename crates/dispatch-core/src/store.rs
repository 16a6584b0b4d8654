//! The remote store collaborator: copying inputs, rewriting a derivation's
//! `inputSrcs`, and running the build on the far side of an SSH store (§4.6).
//!
//! The source links against `libnixstore` directly; this workspace has no
//! such binding, so `NixCliStore` drives the same operations through the
//! `nix` command-line tools, the store-agnostic surface every Nix
//! installation exposes regardless of language bindings.

use std::collections::BTreeSet;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

/// Boxed-future alias for the trait's async methods, since `RemoteStore`
/// needs to be object-safe for dependency injection in tests.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("spawning `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("reading derivation {drv}: {message}")]
    ReadDerivation { drv: String, message: String },
}

/// The operations a worker performs against a machine's store once it has
/// accepted a job (§4.6's `copyPaths` / `readDerivation` + rewrite /
/// `buildDerivation` sequence).
pub trait RemoteStore: Send + Sync {
    /// Copies `paths` to `to_store_uri`. Implementations must pass
    /// `NoCheckSigs` (a remote builder's store has no reason to hold our
    /// signing keys) and decide whether to allow substitution on the
    /// destination from their own static configuration rather than a
    /// per-call argument (§4.6 step 6).
    fn copy_paths<'a>(
        &'a self,
        to_store_uri: &'a str,
        paths: &'a [String],
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Reads a derivation's declared input sources, as an idiomatic stand-in
    /// for `readDerivation` + the `inputSrcs` rewrite §4.6 describes: the
    /// rewrite itself is the caller's job (substituting local store paths for
    /// the remote store's once `copy_paths` has placed them there).
    fn input_srcs<'a>(&'a self, drv: &'a str) -> BoxFuture<'a, Result<BTreeSet<String>, StoreError>>;

    fn build_derivation<'a>(
        &'a self,
        store_uri: &'a str,
        drv: &'a str,
        wanted_outputs: &'a [String],
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Shells out to the `nix` CLI found on `PATH`.
pub struct NixCliStore {
    binary: String,
    substitute_on_destination: bool,
}

impl Default for NixCliStore {
    fn default() -> Self {
        Self {
            binary: "nix".to_string(),
            substitute_on_destination: false,
        }
    }
}

impl NixCliStore {
    pub fn new(binary: impl Into<String>, substitute_on_destination: bool) -> Self {
        Self {
            binary: binary.into(),
            substitute_on_destination,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, StoreError> {
        let command_desc = format!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| StoreError::Spawn {
                command: command_desc.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(StoreError::CommandFailed {
                command: command_desc,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RemoteStore for NixCliStore {
    fn copy_paths<'a>(
        &'a self,
        to_store_uri: &'a str,
        paths: &'a [String],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut args = vec!["copy", "--to", to_store_uri, "--no-check-sigs"];
            if self.substitute_on_destination {
                args.push("--substitute-on-destination");
            }
            args.extend(paths.iter().map(String::as_str));
            self.run(&args).await.map(|_| ())
        })
    }

    fn input_srcs<'a>(&'a self, drv: &'a str) -> BoxFuture<'a, Result<BTreeSet<String>, StoreError>> {
        Box::pin(async move {
            let out = self
                .run(&["derivation", "show", drv])
                .await
                .map_err(|e| StoreError::ReadDerivation {
                    drv: drv.to_string(),
                    message: e.to_string(),
                })?;

            parse_input_srcs(drv, &out)
        })
    }

    fn build_derivation<'a>(
        &'a self,
        store_uri: &'a str,
        drv: &'a str,
        wanted_outputs: &'a [String],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let installables: Vec<String> = if wanted_outputs.is_empty() {
                vec![drv.to_string()]
            } else {
                wanted_outputs
                    .iter()
                    .map(|o| format!("{drv}^{o}"))
                    .collect()
            };

            let mut args = vec!["build", "--store", store_uri, "--no-link"];
            args.extend(installables.iter().map(String::as_str));
            self.run(&args).await.map(|_| ())
        })
    }
}

/// Pulls `inputSrcs` out of `nix derivation show`'s JSON, whose top level is
/// `{ "<drv path>": { "inputSrcs": [...], ... } }`.
fn parse_input_srcs(drv: &str, json: &str) -> Result<BTreeSet<String>, StoreError> {
    let parsed: serde_json::Value =
        serde_json::from_str(json).map_err(|e| StoreError::ReadDerivation {
            drv: drv.to_string(),
            message: e.to_string(),
        })?;

    let entry = parsed
        .as_object()
        .and_then(|m| m.values().next())
        .ok_or_else(|| StoreError::ReadDerivation {
            drv: drv.to_string(),
            message: "empty derivation show output".to_string(),
        })?;

    let srcs = entry
        .get("inputSrcs")
        .and_then(|v| v.as_array())
        .ok_or_else(|| StoreError::ReadDerivation {
            drv: drv.to_string(),
            message: "missing inputSrcs".to_string(),
        })?;

    Ok(srcs
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

/// Builds the local `/nix/store` path a remote input would be rewritten to
/// after `copy_paths` has placed it on the worker's own store, i.e. the
/// `inputSrcs` rewrite §4.6 calls for between reading and building.
pub fn rewrite_input_src(local_store_dir: &Path, remote_path: &str) -> String {
    let base = remote_path.rsplit('/').next().unwrap_or(remote_path);
    local_store_dir.join(base).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_srcs_from_derivation_show() {
        let json = r#"{
            "/nix/store/aaa-foo.drv": {
                "inputSrcs": ["/nix/store/bbb-bar", "/nix/store/ccc-baz"],
                "inputDrvs": {}
            }
        }"#;

        let srcs = parse_input_srcs("/nix/store/aaa-foo.drv", json).unwrap();
        assert_eq!(srcs.len(), 2);
        assert!(srcs.contains("/nix/store/bbb-bar"));
    }

    #[test]
    fn rejects_missing_input_srcs() {
        let json = r#"{"/nix/store/aaa-foo.drv": {"inputDrvs": {}}}"#;
        assert!(parse_input_srcs("/nix/store/aaa-foo.drv", json).is_err());
    }

    #[test]
    fn rewrites_to_local_store_dir() {
        let rewritten = rewrite_input_src(Path::new("/nix/store"), "/nix/store/bbb-bar");
        assert_eq!(rewritten, "/nix/store/bbb-bar");
    }
}
