use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{FromRowError, NotificationParseError};

/// One row of the `events` table, decoded. Per-job sequences are
/// `start · (cancel | no-machine-available | (accept · add-inputs-and-outputs · fail?))`.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start {
        ts: DateTime<Utc>,
        job: Uuid,
        drv: String,
        system: String,
        system_features: BTreeSet<String>,
    },
    Cancel {
        ts: DateTime<Utc>,
        job: Uuid,
    },
    NoMachineAvailable {
        ts: DateTime<Utc>,
        job: Uuid,
    },
    Accept {
        ts: DateTime<Utc>,
        job: Uuid,
        uri: String,
    },
    AddInputsAndOutputs {
        ts: DateTime<Utc>,
        job: Uuid,
        inputs: Vec<String>,
        wanted_outputs: Vec<String>,
    },
    Fail {
        ts: DateTime<Utc>,
        job: Uuid,
        msg: String,
    },
}

impl Event {
    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            Event::Start { ts, .. }
            | Event::Cancel { ts, .. }
            | Event::NoMachineAvailable { ts, .. }
            | Event::Accept { ts, .. }
            | Event::AddInputsAndOutputs { ts, .. }
            | Event::Fail { ts, .. } => *ts,
        }
    }

    pub fn job(&self) -> Uuid {
        match self {
            Event::Start { job, .. }
            | Event::Cancel { job, .. }
            | Event::NoMachineAvailable { job, .. }
            | Event::Accept { job, .. }
            | Event::AddInputsAndOutputs { job, .. }
            | Event::Fail { job, .. } => *job,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Start { .. } => "start",
            Event::Cancel { .. } => "cancel",
            Event::NoMachineAvailable { .. } => "no-machine-available",
            Event::Accept { .. } => "accept",
            Event::AddInputsAndOutputs { .. } => "add-inputs-and-outputs",
            Event::Fail { .. } => "fail",
        }
    }

    fn payload(&self) -> Value {
        match self {
            Event::Start {
                drv,
                system,
                system_features,
                ..
            } => json!({"drv": drv, "system": system, "system_features": system_features}),
            Event::Cancel { .. } | Event::NoMachineAvailable { .. } => json!({}),
            Event::Accept { uri, .. } => json!({"uri": uri}),
            Event::AddInputsAndOutputs {
                inputs,
                wanted_outputs,
                ..
            } => json!({"inputs": inputs, "wanted_outputs": wanted_outputs}),
            Event::Fail { msg, .. } => json!({"msg": msg}),
        }
    }

    /// Serializes back to the row shape a notification's `extra` field
    /// carries: `{ts, name, job, payload}`.
    pub fn to_row_json(&self) -> Value {
        json!({
            "ts": self.ts().to_rfc3339(),
            "name": self.name(),
            "job": self.job(),
            "payload": self.payload(),
        })
    }
}

/// Total order by `ts` ascending, used by the replay sort (§4.1's "ordering
/// predicate"). Not `Ord`/`PartialOrd` on `Event` itself, since events with
/// equal timestamps are not otherwise interchangeable.
pub fn cmp_ts_asc(a: &Event, b: &Event) -> Ordering {
    a.ts().cmp(&b.ts())
}

#[derive(Deserialize)]
struct StartPayload {
    drv: String,
    system: String,
    #[serde(default)]
    system_features: BTreeSet<String>,
}

#[derive(Deserialize)]
struct AcceptPayload {
    uri: String,
}

#[derive(Deserialize)]
struct AddInputsAndOutputsPayload {
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    wanted_outputs: Vec<String>,
}

#[derive(Deserialize)]
struct FailPayload {
    msg: String,
}

fn parse_payload(
    ts: DateTime<Utc>,
    name: &str,
    job: Uuid,
    payload: Value,
) -> Result<Event, FromRowError> {
    let bad_payload = |source: serde_json::Error| FromRowError::BadPayload {
        source,
        payload: payload.to_string(),
    };

    match name {
        "start" => {
            let p: StartPayload = serde_json::from_value(payload).map_err(bad_payload)?;
            Ok(Event::Start {
                ts,
                job,
                drv: p.drv,
                system: p.system,
                system_features: p.system_features,
            })
        }
        "cancel" => Ok(Event::Cancel { ts, job }),
        "no-machine-available" => Ok(Event::NoMachineAvailable { ts, job }),
        "accept" => {
            let p: AcceptPayload = serde_json::from_value(payload).map_err(bad_payload)?;
            Ok(Event::Accept {
                ts,
                job,
                uri: p.uri,
            })
        }
        "add-inputs-and-outputs" => {
            let p: AddInputsAndOutputsPayload =
                serde_json::from_value(payload).map_err(bad_payload)?;
            Ok(Event::AddInputsAndOutputs {
                ts,
                job,
                inputs: p.inputs,
                wanted_outputs: p.wanted_outputs,
            })
        }
        "fail" => {
            let p: FailPayload = serde_json::from_value(payload).map_err(bad_payload)?;
            Ok(Event::Fail {
                ts,
                job,
                msg: p.msg,
            })
        }
        other => Err(FromRowError::UnexpectedName(other.to_string())),
    }
}

/// Parses a four-column row. Nulls in any column are reported together
/// (distinguishing which); only once all four are present is the payload
/// JSON-decoded and dispatched on `name`.
pub fn from_row(
    ts: Option<DateTime<Utc>>,
    name: Option<String>,
    job: Option<Uuid>,
    payload: Option<Value>,
) -> Result<Event, FromRowError> {
    let mut nulls = Vec::new();
    if ts.is_none() {
        nulls.push("ts was null");
    }
    if name.is_none() {
        nulls.push("name was null");
    }
    if job.is_none() {
        nulls.push("job was null");
    }
    if payload.is_none() {
        nulls.push("payload was null");
    }
    if !nulls.is_empty() {
        return Err(FromRowError::NullFields(nulls.join(", ")));
    }

    parse_payload(ts.unwrap(), &name.unwrap(), job.unwrap(), payload.unwrap())
}

#[derive(Deserialize)]
struct NotificationRow {
    ts: DateTime<Utc>,
    name: String,
    job: Uuid,
    payload: Value,
}

/// Decodes a notification's `extra` field, which per §6 is the JSON encoding
/// of a single event row with keys `ts, name, job, payload`.
pub fn parse_notification(raw: &str) -> Result<Event, NotificationParseError> {
    let row: NotificationRow = serde_json::from_str(raw).map_err(|e| NotificationParseError::Json {
        message: e.to_string(),
        payload: raw.to_string(),
    })?;

    parse_payload(row.ts, &row.name, row.job, row.payload).map_err(NotificationParseError::Event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid() -> Uuid {
        "11111111-1111-1111-1111-111111111111".parse().unwrap()
    }

    #[test]
    fn round_trips_each_event_kind() {
        let ts = Utc::now();
        let job = uuid();
        let events = vec![
            Event::Start {
                ts,
                job,
                drv: "/nix/store/aaa-foo.drv".into(),
                system: "x86_64-linux".into(),
                system_features: BTreeSet::from(["big-parallel".to_string()]),
            },
            Event::Cancel { ts, job },
            Event::NoMachineAvailable { ts, job },
            Event::Accept {
                ts,
                job,
                uri: "ssh://host".into(),
            },
            Event::AddInputsAndOutputs {
                ts,
                job,
                inputs: vec!["/nix/store/bbb-bar".into()],
                wanted_outputs: vec!["out".into()],
            },
            Event::Fail {
                ts,
                job,
                msg: "build failed".into(),
            },
        ];

        for e in events {
            let row = e.to_row_json();
            let parsed = from_row(
                Some(
                    row["ts"]
                        .as_str()
                        .unwrap()
                        .parse::<DateTime<Utc>>()
                        .unwrap(),
                ),
                Some(row["name"].as_str().unwrap().to_string()),
                Some(row["job"].as_str().unwrap().parse().unwrap()),
                Some(row["payload"].clone()),
            )
            .unwrap();
            assert_eq!(parsed, e);
        }
    }

    #[test]
    fn null_columns_are_named() {
        let err = from_row(None, None, Some(uuid()), Some(json!({}))).unwrap_err();
        match err {
            FromRowError::NullFields(msg) => {
                assert!(msg.contains("ts was null"));
                assert!(msg.contains("name was null"));
                assert!(!msg.contains("job was null"));
            }
            other => panic!("expected NullFields, got {other:?}"),
        }
    }

    #[test]
    fn unknown_name_is_reported() {
        let err = from_row(Some(Utc::now()), Some("bogus".into()), Some(uuid()), Some(json!({})))
            .unwrap_err();
        assert!(matches!(err, FromRowError::UnexpectedName(n) if n == "bogus"));
    }

    #[test]
    fn bad_json_in_notification_is_distinguished_from_parse_error() {
        let err = parse_notification("{not json").unwrap_err();
        match err {
            NotificationParseError::Json { payload, .. } => {
                assert!(payload.contains("{not json"));
            }
            other => panic!("expected Json, got {other:?}"),
        }
    }

    #[test]
    fn ts_ordering_is_ascending() {
        let job = uuid();
        let earlier = Event::Cancel {
            ts: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            job,
        };
        let later = Event::Cancel {
            ts: DateTime::parse_from_rfc3339("2026-01-01T00:00:01Z")
                .unwrap()
                .with_timezone(&Utc),
            job,
        };
        assert_eq!(cmp_ts_asc(&earlier, &later), Ordering::Less);
    }
}
