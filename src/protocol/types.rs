/// Transaction status indicator carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I' - Idle (not in a transaction block)
    ///
    /// The proxy never runs a transaction of its own, so this is the only status it reports.
    Idle,
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
        }
    }
}

/// Error and notice message field type codes.
/// See: https://www.postgresql.org/docs/current/protocol-error-fields.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorFieldCode {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    Severity = b'S',
    /// Severity (non-localized): Same as Severity but never localized
    SeverityNonLocalized = b'V',
    /// SQLSTATE code
    SqlState = b'C',
    /// Primary human-readable error message
    Message = b'M',
}

impl ErrorFieldCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// SQLSTATE codes sent when a connection is refused during startup.
pub mod sql_state {
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const IDLE_SESSION_TIMEOUT: &str = "57P05";
}

/// Human-readable name of a frontend message tag, for logging.
pub fn frontend_tag_name(tag: u8) -> &'static str {
    match tag {
        b'B' => "Bind",
        b'C' => "Close",
        b'c' => "CopyDone",
        b'd' => "CopyData",
        b'D' => "Describe",
        b'E' => "Execute",
        b'f' => "CopyFail",
        b'F' => "FunctionCall",
        b'H' => "Flush",
        b'p' => "PasswordMessage",
        b'P' => "Parse",
        b'Q' => "Query",
        b'S' => "Sync",
        b'X' => "Terminate",
        _ => "Unknown",
    }
}
