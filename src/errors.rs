use thiserror::Error;

/// Errors returned from the [`Market`](crate::market::Market) manager.
///
/// These cover sale-start rejections, invalid request arguments, and
/// misconfigured sale parameters. Buy attempts that merely fail (sold out,
/// expired, unknown sale) are not errors; they are a normal `false` outcome.
#[derive(Error, Debug)]
pub enum MarketError {
    /// The seller has no ledger. Sellers receive one at registration, so
    /// this indicates a request from an unregistered or non-seller client.
    #[error("Unknown seller: {0}. Have they registered?")]
    UnknownSeller(String),

    /// The item name is not part of the fixed catalog.
    #[error("Unknown item '{0}'. Valid items are: flower, sugar, potato, oil")]
    UnknownItem(String),

    /// The seller's ledger holds less of the item than the sale asks for.
    #[error("Insufficient stock of {item}: {available:.2} available, {requested:.2} requested")]
    InsufficientStock {
        /// Catalog name of the item.
        item: &'static str,
        /// Quantity currently on the seller's ledger.
        available: f64,
        /// Quantity the request asked for.
        requested: f64,
    },

    /// A quantity argument was zero, negative, or not a number.
    #[error("Quantity must be a positive number, got {0}")]
    InvalidQuantity(f64),

    /// A sale duration outside `(0, 60s]` was requested.
    #[error("Sale duration must be within (0, {max}] seconds, got {got}s")]
    InvalidDuration {
        /// The rejected duration, in whole seconds.
        got: u64,
        /// The configured upper bound, in seconds.
        max: u64,
    },
}

/// Errors produced while reading or writing framed messages.
#[derive(Error, Debug)]
pub enum WireError {
    /// Underlying socket I/O failure.
    #[error("Frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection cleanly.
    #[error("Connection closed by peer")]
    Closed,

    /// A frame announced a payload larger than
    /// [`MAX_FRAME_LEN`](crate::defs::MAX_FRAME_LEN).
    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    Oversize(usize),

    /// The payload was not a valid message (bad JSON, unknown type, missing
    /// envelope field).
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    /// A payload field required by the message kind was absent or of the
    /// wrong type.
    #[error("Missing or malformed field '{0}'")]
    MissingField(&'static str),
}

/// Errors produced by the broker server and its sessions.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The TCP listener failed to bind to the specified address/port.
    #[error("Failed to bind TCP listener: {0}")]
    Bind(String),

    /// Error while accepting an incoming TCP connection.
    #[error("Failed to accept TCP connection: {0}")]
    Accept(String),

    /// Wire-level failure on a specific client connection.
    #[error("Session I/O error: {0}")]
    SessionIo(#[from] WireError),

    /// The client violated the registration or framing protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// High-level errors returned by the server binary.
///
/// Used at the application entry point for formatting user-facing failure
/// messages and wrapping lower-level errors.
#[derive(Error, Debug)]
pub enum CliError {
    /// General wrapper around any textual failure.
    #[error("Broker failed with error: {0}")]
    General(String),
}

impl From<ServerError> for CliError {
    fn from(err: ServerError) -> Self {
        CliError::General(err.to_string())
    }
}
