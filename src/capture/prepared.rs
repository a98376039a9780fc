//! Per-connection prepared-statement table: tracks the parameter count
//! and cached parameter types each `COM_STMT_PREPARE_OK` establishes, plus
//! any `COM_STMT_SEND_LONG_DATA` buffers awaiting splice into the next
//! `COM_STMT_EXECUTE`.

use std::collections::HashMap;

use crate::wire::value::ParamType;

#[derive(Debug, Clone, Default)]
pub struct PreparedStatementEntry {
    pub sql: String,
    pub num_params: u16,
    /// Set once the first execute supplies a type block; reused by later
    /// executes that set `new-params-bound = 0`.
    pub cached_types: Option<Vec<ParamType>>,
    /// Long-data fragments accumulated via `COM_STMT_SEND_LONG_DATA`,
    /// keyed by parameter index. Spliced into the parameter list of the
    /// next `COM_STMT_EXECUTE` and cleared afterwards.
    pub long_data: HashMap<u16, Vec<u8>>,
}

impl PreparedStatementEntry {
    pub fn new(sql: String, num_params: u16) -> Self {
        Self {
            sql,
            num_params,
            cached_types: None,
            long_data: HashMap::new(),
        }
    }

    pub fn append_long_data(&mut self, param_index: u16, chunk: &[u8]) {
        self.long_data.entry(param_index).or_default().extend_from_slice(chunk);
    }

    pub fn take_long_data(&mut self, param_index: u16) -> Option<Vec<u8>> {
        self.long_data.remove(&param_index)
    }
}

/// Keyed by the statement id the server assigned in `COM_STMT_PREPARE_OK`.
/// Statement ids are scoped to a single connection, so this table lives on
/// the connection state machine rather than globally.
#[derive(Debug, Clone, Default)]
pub struct PreparedStatementTable {
    statements: HashMap<u32, PreparedStatementEntry>,
}

impl PreparedStatementTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, statement_id: u32, entry: PreparedStatementEntry) {
        self.statements.insert(statement_id, entry);
    }

    pub fn get(&self, statement_id: u32) -> Option<&PreparedStatementEntry> {
        self.statements.get(&statement_id)
    }

    pub fn get_mut(&mut self, statement_id: u32) -> Option<&mut PreparedStatementEntry> {
        self.statements.get_mut(&statement_id)
    }

    pub fn remove(&mut self, statement_id: u32) -> Option<PreparedStatementEntry> {
        self.statements.remove(&statement_id)
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }
}
