use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adapter::options::WriteMode;
use crate::bail;
use crate::error::{ConduitResult, ErrorKind};

/// Feature flags an adapter advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub schema_discovery: bool,
    pub batch_operations: bool,
    pub streaming: bool,
    pub transactions: bool,
    pub partitioning: bool,
    pub cdc: bool,
    pub incremental_sync: bool,
    pub custom_query: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    SchemaDiscovery,
    BatchOperations,
    Streaming,
    Transactions,
    Partitioning,
    Cdc,
    IncrementalSync,
    CustomQuery,
}

impl Capabilities {
    /// Returns `true` when `capability` is supported.
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::SchemaDiscovery => self.schema_discovery,
            Capability::BatchOperations => self.batch_operations,
            Capability::Streaming => self.streaming,
            Capability::Transactions => self.transactions,
            Capability::Partitioning => self.partitioning,
            Capability::Cdc => self.cdc,
            Capability::IncrementalSync => self.incremental_sync,
            Capability::CustomQuery => self.custom_query,
        }
    }

    /// Fails with [`ErrorKind::Unsupported`] when `capability` is absent.
    pub fn require(&self, capability: Capability, system_id: &str) -> ConduitResult<()> {
        if !self.has(capability) {
            bail!(
                ErrorKind::Unsupported,
                "Capability not supported by adapter",
                format!("{system_id} does not support {capability}")
            );
        }

        Ok(())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::SchemaDiscovery => "schemaDiscovery",
            Capability::BatchOperations => "batchOperations",
            Capability::Streaming => "streaming",
            Capability::Transactions => "transactions",
            Capability::Partitioning => "partitioning",
            Capability::Cdc => "cdc",
            Capability::IncrementalSync => "incrementalSync",
            Capability::CustomQuery => "customQuery",
        };
        f.write_str(name)
    }
}

/// Data operations an adapter can perform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedOperations {
    pub read: bool,
    pub write: bool,
    pub update: bool,
    pub delete: bool,
    pub upsert: bool,
    pub truncate: bool,
    pub create_schema: bool,
    pub drop_schema: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Update,
    Delete,
    Upsert,
    Truncate,
    CreateSchema,
    DropSchema,
}

impl Operation {
    /// Operation a write mode needs on top of [`Operation::Write`].
    pub fn for_write_mode(mode: WriteMode) -> Self {
        match mode {
            WriteMode::Insert => Operation::Write,
            WriteMode::Update => Operation::Update,
            WriteMode::Upsert => Operation::Upsert,
            WriteMode::Replace => Operation::Delete,
        }
    }
}

impl SupportedOperations {
    /// Every operation enabled.
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            update: true,
            delete: true,
            upsert: true,
            truncate: true,
            create_schema: true,
            drop_schema: true,
        }
    }

    /// Returns `true` when `operation` is supported.
    pub fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
            Operation::Upsert => self.upsert,
            Operation::Truncate => self.truncate,
            Operation::CreateSchema => self.create_schema,
            Operation::DropSchema => self.drop_schema,
        }
    }

    /// Fails with `Unsupported` when `operation` is not supported by `system_id`.
    pub fn require(&self, operation: Operation, system_id: &str) -> ConduitResult<()> {
        if !self.supports(operation) {
            bail!(
                ErrorKind::Unsupported,
                "Operation not supported by adapter",
                format!("{system_id} does not support {operation:?}")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_capability_is_unsupported() {
        let capabilities = Capabilities {
            schema_discovery: true,
            ..Capabilities::default()
        };

        assert!(capabilities.require(Capability::SchemaDiscovery, "pg").is_ok());
        let err = capabilities
            .require(Capability::CustomQuery, "pg")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(err.detail(), Some("pg does not support customQuery"));
    }

    #[test]
    fn replace_needs_delete() {
        let operations = SupportedOperations {
            delete: false,
            ..SupportedOperations::all()
        };

        let operation = Operation::for_write_mode(WriteMode::Replace);
        assert!(!operations.supports(operation));
        assert!(operations.supports(Operation::for_write_mode(WriteMode::Upsert)));
    }
}
