//! Pull-based event stream: replayed rows followed by live notifications,
//! seeded so that `LISTEN` starts before the replay query runs (§4.1, §6).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;

use crate::error::EventStreamError;
use crate::event::{cmp_ts_asc, parse_notification, Event};

/// Combines a sorted replay buffer with a live `LISTEN` subscription into one
/// ordered pull interface. Callers must open `listener` (i.e. issue `LISTEN`)
/// *before* running the replay query that produces `replay` — that ordering
/// guarantees every event committed after the `LISTEN` takes effect arrives
/// as a notification, even if the replay query also happens to pick it up.
/// Notifications at or before the replay's high-water timestamp are treated
/// as replays of already-seen rows and dropped.
pub struct EventStream {
    listener: PgListener,
    channel: String,
    buffered: VecDeque<Event>,
    high_water_ts: Option<DateTime<Utc>>,
}

impl EventStream {
    pub fn new(listener: PgListener, channel: impl Into<String>, mut replay: Vec<Event>) -> Self {
        replay.sort_by(cmp_ts_asc);
        let high_water_ts = replay.last().map(|e| e.ts());
        Self {
            listener,
            channel: channel.into(),
            buffered: replay.into(),
            high_water_ts,
        }
    }

    /// Returns the next event in `ts` order. Blocks on the socket once the
    /// replay buffer is drained. A non-fatal error (bad JSON, wrong channel)
    /// consumes the offending notification and is returned to the caller to
    /// log; `EventStreamError::is_fatal` distinguishes these from the
    /// connection-level failures that should end the stream.
    pub async fn next_event(&mut self) -> Result<Event, EventStreamError> {
        loop {
            if let Some(event) = self.buffered.pop_front() {
                return Ok(event);
            }

            let notification = self
                .listener
                .recv()
                .await
                .map_err(EventStreamError::Polling)?;

            if notification.channel() != self.channel {
                return Err(EventStreamError::WrongChannel(
                    notification.channel().to_string(),
                ));
            }

            let event = parse_notification(notification.payload())?;
            if is_replay_duplicate(self.high_water_ts, &event) {
                continue;
            }

            self.high_water_ts = Some(event.ts());
            return Ok(event);
        }
    }
}

fn is_replay_duplicate(high_water_ts: Option<DateTime<Utc>>, event: &Event) -> bool {
    matches!(high_water_ts, Some(hw) if event.ts() <= hw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn cancel_at(secs: i64) -> Event {
        Event::Cancel {
            ts: DateTime::from_timestamp(secs, 0).unwrap(),
            job: Uuid::nil(),
        }
    }

    #[test]
    fn replay_buffer_is_sorted_by_ts() {
        let replay = vec![cancel_at(30), cancel_at(10), cancel_at(20)];
        let mut sorted = replay.clone();
        sorted.sort_by(cmp_ts_asc);
        assert_eq!(sorted[0].ts(), cancel_at(10).ts());
        assert_eq!(sorted[2].ts(), cancel_at(30).ts());
    }

    #[test]
    fn events_at_or_before_high_water_are_duplicates() {
        let hw = Some(cancel_at(20).ts());
        assert!(is_replay_duplicate(hw, &cancel_at(20)));
        assert!(is_replay_duplicate(hw, &cancel_at(10)));
        assert!(!is_replay_duplicate(hw, &cancel_at(21)));
    }

    #[test]
    fn no_high_water_means_nothing_is_a_duplicate() {
        assert!(!is_replay_duplicate(None, &cancel_at(1)));
    }

    #[test]
    fn start_payload_round_trips_a_feature_set() {
        let e = Event::Start {
            ts: Utc::now(),
            job: Uuid::nil(),
            drv: "/nix/store/aaa-foo.drv".into(),
            system: "x86_64-linux".into(),
            system_features: BTreeSet::from(["kvm".to_string()]),
        };
        assert_eq!(e.name(), "start");
    }
}
