use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = gateway_common::id::prefixed_ulid("ack");
/// assert!(id.starts_with("ack_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Correlation id of an outbound event awaiting acknowledgement.
    pub const ACK: &str = "ack";
    /// Gateway process identity used to scope presence keys.
    pub const SERVER: &str = "srv";
}
