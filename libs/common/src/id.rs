//! Identifier generation.

use ulid::Ulid;

/// Prefix of the ids connections get before the application renames them.
pub const CONNECTION_PREFIX: &str = "conn";

/// `{prefix}_{ulid}`. ULIDs sort by creation time.
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{prefix}_{}", Ulid::new())
}

/// Fresh id for a newly accepted connection, e.g. `conn_01HV...`.
pub fn connection_id() -> String {
    prefixed_ulid(CONNECTION_PREFIX)
}
