use thiserror::Error;

/// Failure classes surfaced by machine and macro operations.
///
/// Every variant is reported to the user as a message and degrades the
/// triggering operation to a no-op; none of these escape the dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    /// Reachability probe failed before a connection was attempted.
    #[error("{0} is unreachable")]
    Unreachable(String),

    /// The transport failed to open a session or the session died under us.
    #[error("connection failed: {0}")]
    AuthOrTransport(String),

    /// A connect attempt exceeded the configured deadline.
    #[error("connection attempt timed out after {0}s")]
    Timeout(u64),

    /// Malformed user input (bad `user@ip[:port]`, non-absolute path, ...).
    #[error("invalid input: {0}")]
    UserInput(String),

    /// No machine or path could be resolved for the operation.
    #[error("{0}")]
    NoTarget(String),

    /// The macro or registry is missing something the operation needs.
    #[error("{0}")]
    MissingCapability(String),

    /// The machine is mid-connect; the call was ignored.
    #[error("{0} is already connecting")]
    Busy(String),
}
