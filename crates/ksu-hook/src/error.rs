use std::io;

use crate::patch::TableKind;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("register {symbol} failed: {code}")]
    Register { symbol: &'static str, code: i32 },

    #[error("{0} is already registered")]
    AlreadyRegistered(&'static str),

    #[error("{0} was never registered")]
    NotRegistered(&'static str),

    #[error("{0:?} dispatch table is not available")]
    NoTable(TableKind),

    #[error("hook for the {hook:?} table used on the {table:?} table")]
    TableMismatch { hook: TableKind, table: TableKind },

    #[error("index {index} out of range for {kind:?} table of {len} slots")]
    IndexOutOfRange {
        kind: TableKind,
        index: usize,
        len: usize,
    },

    #[error("slot {index} of {kind:?} table is already hooked")]
    SlotBusy { kind: TableKind, index: usize },

    #[error("an interceptor is already loaded")]
    AlreadyPublished,

    #[error("spawn {name} failed: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, HookError>;
