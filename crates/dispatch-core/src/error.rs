use thiserror::Error;

/// Errors raised while turning a four-column row (or a notification's decoded
/// row) into an [`crate::event::Event`]. Distinguishes null columns from a bad
/// payload from an unrecognized event name, per the codec contract.
#[derive(Debug, Error)]
pub enum FromRowError {
    #[error("{0}")]
    NullFields(String),
    #[error("parsing payload: {source}. got {payload}")]
    BadPayload {
        source: serde_json::Error,
        payload: String,
    },
    #[error("unexpected event name: {0}")]
    UnexpectedName(String),
}

/// Errors raised while decoding a raw NOTIFY payload before it even reaches
/// row parsing.
#[derive(Debug, Error)]
pub enum NotificationParseError {
    #[error("failed decoding event: {message}. got: {payload}")]
    Json { message: String, payload: String },
    #[error("error parsing event: {0}")]
    Event(#[from] FromRowError),
}

/// Connection-time failures. `connect` fails either at the socket/handshake
/// level or while installing the empty search_path.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connecting to postgres: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("setting secure search path: {0}")]
    SearchPath(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("listening to {channel}: {source}")]
    Listen {
        channel: String,
        #[source]
        source: sqlx::Error,
    },
}

/// The seven error kinds named in the design (`FromRowError` above covers the
/// eighth, replay-row variant, since it is raised outside the live stream).
/// `PollingError`/`ConsumingInput` are fatal to their caller; the rest are
/// logged and the stream continues. `PgListener::recv` folds libpq's separate
/// poll-syscall and `PQconsumeInput` failure modes into one connection error,
/// so `ConsumingInput` and `NoMessages` are kept for taxonomy parity with §7
/// but are not constructed by this adapter — `recv` never returns on an
/// empty, ready drain the way the raw socket-polling loop could.
#[derive(Debug, Error)]
pub enum EventStreamError {
    #[error("polling postgres socket: {0}")]
    Polling(#[source] sqlx::Error),
    #[error("consuming input: {0}")]
    ConsumingInput(#[source] sqlx::Error),
    #[error("failed decoding event: {message}. got: {payload}")]
    JsonDecode { message: String, payload: String },
    #[error("error parsing event: {0}")]
    ParsingEvent(String),
    #[error("got message on unexpected channel: {0}")]
    WrongChannel(String),
    #[error("unexpectedly got no messages even though poll was ready")]
    NoMessages,
}

impl EventStreamError {
    /// `PollingError`/`ConsumingInput` terminate the process that observed
    /// them (§7); everything else is logged and the stream continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Polling(_) | Self::ConsumingInput(_))
    }
}

impl From<NotificationParseError> for EventStreamError {
    fn from(e: NotificationParseError) -> Self {
        match e {
            NotificationParseError::Json { message, payload } => {
                Self::JsonDecode { message, payload }
            }
            NotificationParseError::Event(e) => Self::ParsingEvent(e.to_string()),
        }
    }
}
