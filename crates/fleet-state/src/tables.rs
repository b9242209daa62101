//! redb table definitions for the Fleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Service rows keyed by service name.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Immutable task versions keyed by `{service}:{version:020}`.
pub const VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("versions");

/// Replica rows keyed by `{service}:{replica_id:020}`.
pub const REPLICAS: TableDefinition<&str, &[u8]> = TableDefinition::new("replicas");
