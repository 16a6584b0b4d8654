//! Shared engine for the remote build dispatcher: the Postgres adapter, the
//! event codec, the fleet model, the remote store collaborator, and the
//! schema-boundary repository calls both binaries in this workspace drive.

pub mod config;
pub mod error;
pub mod event;
pub mod fleet;
pub mod model;
pub mod pg;
pub mod repo;
pub mod store;
pub mod stream;

pub use config::{EnqueueArgs, PgEnvConfig, QueueConfig};
pub use error::{ConnectError, EventStreamError, FromRowError, ListenError, NotificationParseError};
pub use event::{cmp_ts_asc, Event};
pub use fleet::{can_build, parse_machines_file, priority_lt, sort_by_priority, Machine, MachinesFileError};
pub use model::{Job, BUILTIN_SYSTEM};
pub use pg::{connect, escape_identifier, escape_uuid, listen, to_sql_array, ConnectionParams};
pub use repo::RepoError;
pub use store::{NixCliStore, RemoteStore, StoreError};
pub use stream::EventStream;
