//! Shared wire and disk formats for netacct: the binary daily-log record
//! codec used by the storage engine and the reporter, and the JSON control
//! frame accepted on the daemon's Unix socket.

mod control;
mod records;

pub use control::ControlRequest;
pub use records::{
    open_log, write_record, IpEntry, LogRecord, RecordError, RecordHeader, RecordReader,
    HEADER_BYTES, IP_ENTRY_BYTES, IP_ENTRY_VERSION_V4,
};
