/// Error taxonomy for the posting pipeline
///
/// Every collaborator (generator, duplicate filter, history store, publisher)
/// reports failures through `BotError`. The workflow catches all of them at its
/// boundary, so none of these ever escape a single invocation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    /// Remote generation call failed (network, auth, quota, timeout)
    #[error("generation failed: {0}")]
    Generation(String),

    /// Generator answered, but with nothing usable
    #[error("generation returned empty text")]
    EmptyCandidate,

    /// Embedding call failed so the candidate could not be evaluated
    #[error("duplicate filter failed: {0}")]
    Filter(String),

    /// History could not be read
    #[error("history store unavailable: {0}")]
    StoreUnavailable(String),

    /// History could not be written
    #[error("history store write failed: {0}")]
    Store(String),

    /// Platform rejected the post, or the request never reached it
    #[error("publish failed (status {status}): {message}")]
    Publish { status: u16, message: String },
}

impl BotError {
    /// Name of the component that produced this error, used in logs and status payloads
    pub fn component(&self) -> &'static str {
        match self {
            BotError::Generation(_) | BotError::EmptyCandidate => "generator",
            BotError::Filter(_) => "filter",
            BotError::StoreUnavailable(_) | BotError::Store(_) => "history_store",
            BotError::Publish { .. } => "publisher",
        }
    }

    /// Transport-level publish failure (no HTTP status was received)
    pub fn publish_transport(message: String) -> Self {
        BotError::Publish { status: 0, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_are_named_per_collaborator() {
        assert_eq!(BotError::EmptyCandidate.component(), "generator");
        assert_eq!(BotError::Filter("x".into()).component(), "filter");
        assert_eq!(BotError::Store("x".into()).component(), "history_store");
        assert_eq!(BotError::publish_transport("down".into()).component(), "publisher");
    }

    #[test]
    fn publish_error_display_carries_status() {
        let err = BotError::Publish {
            status: 403,
            message: "forbidden".into(),
        };
        assert_eq!(err.to_string(), "publish failed (status 403): forbidden");
    }
}
