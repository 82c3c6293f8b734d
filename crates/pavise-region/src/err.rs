//! Error type for rule parsing.

/// An error encountered while parsing region rules.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A rule token was empty.
    #[error("empty region rule")]
    EmptyRule,
}
