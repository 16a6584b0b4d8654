//! The static machine fleet: loading, canonicalization, the priority partial
//! order, and the match predicate (§3, §4.5).

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{Job, BUILTIN_SYSTEM};

/// A fleet machine record. Immutable once loaded; `system_types` is sorted
/// and deduplicated by [`Machine::canonicalize`] before the machine is ever
/// compared or matched (§3's load invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub store_uri: String,
    pub system_types: Vec<String>,
    pub supported_features: BTreeSet<String>,
    pub mandatory_features: BTreeSet<String>,
    pub speed_factor: i64,
    pub max_jobs: u32,
    pub ssh_key: Option<PathBuf>,
    pub ssh_public_host_key: Option<String>,
}

impl Machine {
    pub fn canonicalize(mut self) -> Self {
        self.system_types.sort();
        self.system_types.dedup();
        self
    }
}

#[derive(Debug, Error)]
pub enum MachinesFileError {
    #[error("line {line}: expected at least a store URI and system types, got {text:?}")]
    TooFewFields { line: usize, text: String },
    #[error("line {line}: invalid max-jobs {value:?}")]
    InvalidMaxJobs { line: usize, value: String },
    #[error("line {line}: invalid speed-factor {value:?}")]
    InvalidSpeedFactor { line: usize, value: String },
}

/// Parses the classic Nix machines file format: one machine per line,
/// whitespace-separated fields
/// `storeUri systemTypes(,) sshKey maxJobs speedFactor supportedFeatures(,) mandatoryFeatures(,) sshPublicHostKey`,
/// trailing fields optional, blank lines and `#`-comments ignored. Resolved
/// from `original_source/src/remote-build-queue/machines.cc`'s use of
/// `nix::getMachines()`, which reads this exact format.
pub fn parse_machines_file(contents: &str) -> Result<Vec<Machine>, MachinesFileError> {
    let mut machines = Vec::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(MachinesFileError::TooFewFields {
                line: idx + 1,
                text: raw_line.to_string(),
            });
        }

        let store_uri = fields[0].to_string();
        let system_types = split_comma_list(fields.get(1).copied().unwrap_or(""));

        let ssh_key = fields
            .get(2)
            .copied()
            .filter(|s| !s.is_empty() && *s != "-")
            .map(PathBuf::from);

        let max_jobs = match fields.get(3).copied().filter(|s| !s.is_empty()) {
            Some(v) => v.parse().map_err(|_| MachinesFileError::InvalidMaxJobs {
                line: idx + 1,
                value: v.to_string(),
            })?,
            None => 1,
        };

        let speed_factor = match fields.get(4).copied().filter(|s| !s.is_empty()) {
            Some(v) => v
                .parse()
                .map_err(|_| MachinesFileError::InvalidSpeedFactor {
                    line: idx + 1,
                    value: v.to_string(),
                })?,
            None => 1,
        };

        let supported_features: BTreeSet<String> =
            split_comma_list(fields.get(5).copied().unwrap_or(""))
                .into_iter()
                .collect();
        let mandatory_features: BTreeSet<String> =
            split_comma_list(fields.get(6).copied().unwrap_or(""))
                .into_iter()
                .collect();

        let ssh_public_host_key = fields
            .get(7)
            .copied()
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        machines.push(
            Machine {
                store_uri,
                system_types,
                supported_features,
                mandatory_features,
                speed_factor,
                max_jobs,
                ssh_key,
                ssh_public_host_key,
            }
            .canonicalize(),
        );
    }

    Ok(machines)
}

fn split_comma_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The fleet priority partial order. §4.5's conjunction as literally stated
/// is reflexive (every `≥`/`⊆` comparator is true of a machine against
/// itself), which breaks the strict-weak-ordering a sort needs — the source
/// carries this bug verbatim. This implements the redesigned, strict
/// version: `priority_lt(a, b)` holds when every field comparison is the
/// corresponding strict relation, i.e. a conjunction of `<`/`⊆` clauses
/// rather than `≥`/`⊄`. See DESIGN.md for the field-by-field reasoning.
pub fn priority_lt(a: &Machine, b: &Machine) -> bool {
    a.system_types < b.system_types
        && b.mandatory_features.is_subset(&a.mandatory_features)
        && b.supported_features.is_subset(&a.supported_features)
        && a.speed_factor < b.speed_factor
        && a.max_jobs < b.max_jobs
        && a.store_uri < b.store_uri
        && a.ssh_public_host_key < b.ssh_public_host_key
        && a.ssh_key < b.ssh_key
}

/// Orders a fleet by priority. `priority_lt` is a strict partial order, not a
/// total one, so incomparable machines keep their relative load-time order
/// (sort stability is not required per §4.5, but `sort_by` is stable anyway).
pub fn sort_by_priority(machines: &mut [Machine]) {
    machines.sort_by(|a, b| {
        if priority_lt(a, b) {
            Ordering::Less
        } else if priority_lt(b, a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    });
}

/// `(job.system == "builtin" OR job.system ∈ machine.systemTypes) AND
/// job.required_features ⊆ machine.supportedFeatures AND
/// machine.mandatoryFeatures ⊆ job.required_features` (§4.5, testable
/// property 4).
pub fn can_build(machine: &Machine, job: &Job) -> bool {
    let system_ok =
        job.system == BUILTIN_SYSTEM || machine.system_types.iter().any(|s| s == &job.system);

    system_ok
        && job.required_features.is_subset(&machine.supported_features)
        && machine.mandatory_features.is_subset(&job.required_features)
}

/// Builds the full store URI a worker passes to `nix ... --store`, appending
/// query parameters in the exact order the original's `open_store` does:
/// `max-connections=1` and `log-fd` for `ssh://` stores only (`ssh-ng://`
/// multiplexes connections itself and manages its own fds); `ssh-key` and
/// `base64-ssh-public-host-key` for either scheme, each only if the machine
/// record actually carries one; `system-features` last, the supported list
/// followed by the mandatory list, space-joined, neither deduplicated nor
/// sorted (a mandatory feature repeated from the supported list is passed
/// twice, matching the source).
pub fn store_uri_with_params(machine: &Machine, log_fd: Option<i32>) -> String {
    let mut params: Vec<String> = Vec::new();

    if machine.store_uri.starts_with("ssh://") {
        params.push("max-connections=1".to_string());
        if let Some(fd) = log_fd {
            params.push(format!("log-fd={fd}"));
        }
    }

    if machine.store_uri.starts_with("ssh://") || machine.store_uri.starts_with("ssh-ng://") {
        if let Some(key) = &machine.ssh_key {
            params.push(format!("ssh-key={}", key.display()));
        }
        if let Some(host_key) = &machine.ssh_public_host_key {
            if !host_key.is_empty() {
                params.push(format!("base64-ssh-public-host-key={host_key}"));
            }
        }
    }

    let mut features: Vec<&str> = Vec::new();
    features.extend(machine.supported_features.iter().map(String::as_str));
    features.extend(machine.mandatory_features.iter().map(String::as_str));
    if !features.is_empty() {
        params.push(format!("system-features={}", features.join(" ")));
    }

    if params.is_empty() {
        machine.store_uri.clone()
    } else {
        format!("{}?{}", machine.store_uri, params.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(system: &str, features: &[&str]) -> Job {
        Job {
            id: uuid::Uuid::nil(),
            drv: "/nix/store/aaa-foo.drv".into(),
            system: system.to_string(),
            required_features: features.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn machine(system_types: &[&str], supported: &[&str], mandatory: &[&str]) -> Machine {
        Machine {
            store_uri: "ssh://host".into(),
            system_types: system_types.iter().map(|s| s.to_string()).collect(),
            supported_features: supported.iter().map(|s| s.to_string()).collect(),
            mandatory_features: mandatory.iter().map(|s| s.to_string()).collect(),
            speed_factor: 1,
            max_jobs: 1,
            ssh_key: None,
            ssh_public_host_key: None,
        }
        .canonicalize()
    }

    #[test]
    fn parses_machines_file() {
        let contents = "\
            # a comment\n\
            ssh://builder1 x86_64-linux,aarch64-linux /root/.ssh/id_ed25519 4 2 big-parallel,kvm kvm c3NoLWVkMjU1MTkK\n\
            \n\
            ssh-ng://builder2 x86_64-linux\n\
        ";

        let machines = parse_machines_file(contents).unwrap();
        assert_eq!(machines.len(), 2);

        assert_eq!(machines[0].store_uri, "ssh://builder1");
        assert_eq!(machines[0].system_types, vec!["aarch64-linux", "x86_64-linux"]);
        assert_eq!(machines[0].max_jobs, 4);
        assert_eq!(machines[0].speed_factor, 2);
        assert!(machines[0].supported_features.contains("big-parallel"));
        assert!(machines[0].mandatory_features.contains("kvm"));
        assert_eq!(machines[0].ssh_public_host_key.as_deref(), Some("c3NoLWVkMjU1MTkK"));

        assert_eq!(machines[1].store_uri, "ssh-ng://builder2");
        assert_eq!(machines[1].max_jobs, 1);
        assert_eq!(machines[1].speed_factor, 1);
        assert!(machines[1].supported_features.is_empty());
    }

    #[test]
    fn can_build_matches_system_and_features() {
        let m = machine(&["x86_64-linux"], &["big-parallel"], &[]);
        assert!(can_build(&m, &job("x86_64-linux", &["big-parallel"])));
        assert!(!can_build(&m, &job("aarch64-linux", &["big-parallel"])));
        assert!(can_build(&m, &job("builtin", &["big-parallel"])));
        assert!(!can_build(&m, &job("x86_64-linux", &["big-parallel", "nonexistent"])));
    }

    #[test]
    fn can_build_enforces_mandatory_features() {
        let m = machine(&["x86_64-linux"], &["big-parallel"], &["kvm"]);
        assert!(!can_build(&m, &job("x86_64-linux", &["big-parallel"])));
        assert!(can_build(&m, &job("x86_64-linux", &["big-parallel", "kvm"])));
    }

    #[test]
    fn priority_lt_is_irreflexive() {
        let m = machine(&["x86_64-linux"], &["big-parallel"], &[]);
        assert!(!priority_lt(&m, &m));
    }

    #[test]
    fn ssh_store_params_follow_the_documented_order() {
        let mut m = machine(&["x86_64-linux"], &["big-parallel"], &["kvm"]);
        m.store_uri = "ssh://builder1".into();
        m.ssh_key = Some(PathBuf::from("/root/.ssh/id_ed25519"));
        m.ssh_public_host_key = Some("c3NoLWVkMjU1MTkK".into());

        let uri = store_uri_with_params(&m, Some(3));
        assert_eq!(
            uri,
            "ssh://builder1?max-connections=1&log-fd=3&ssh-key=/root/.ssh/id_ed25519&base64-ssh-public-host-key=c3NoLWVkMjU1MTkK&system-features=big-parallel kvm"
        );
    }

    #[test]
    fn ssh_ng_store_skips_max_connections_and_log_fd() {
        let mut m = machine(&["x86_64-linux"], &[], &[]);
        m.store_uri = "ssh-ng://builder2".into();
        m.ssh_key = Some(PathBuf::from("/root/.ssh/id_ed25519"));

        let uri = store_uri_with_params(&m, Some(3));
        assert_eq!(uri, "ssh-ng://builder2?ssh-key=/root/.ssh/id_ed25519");
    }

    #[test]
    fn bare_store_uri_with_no_features_has_no_query_string() {
        let m = machine(&["x86_64-linux"], &[], &[]);
        assert_eq!(store_uri_with_params(&m, None), "ssh://host");
    }
}
