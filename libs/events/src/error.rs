use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The builder was finished before this field was set.
    #[error("event envelope is missing `{0}`")]
    MissingField(&'static str),

    /// The sink has shut down and accepts no further events.
    #[error("event sink closed")]
    SinkClosed,
}
