/// Error code registry for rostersync
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Authentication errors
/// - 3000-3999: Storage errors
/// - 4000-4999: Remote API errors
/// - 5000-5999: Run lifecycle errors
/// - 6000-6999: Data integrity errors
/// - 9000-9999: Other errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1002;
    pub const CONFIG_VALIDATION_FAILED: u16 = 1003;

    // Authentication errors (2000-2999)
    pub const AUTH_FAILED: u16 = 2000;
    pub const AUTH_TOKEN_EXPIRED: u16 = 2001;

    // Storage errors (3000-3999)
    pub const STORAGE_GENERIC: u16 = 3000;
    pub const STORAGE_IO_ERROR: u16 = 3001;
    pub const STORAGE_LOCK_BUSY: u16 = 3002;
    pub const STORAGE_SERIALIZATION_ERROR: u16 = 3003;
    pub const STORAGE_BACKEND_ERROR: u16 = 3004;

    // Remote API errors (4000-4999)
    pub const API_TRANSIENT: u16 = 4000;
    pub const API_LISTING_FAILED: u16 = 4001;

    // Run lifecycle errors (5000-5999)
    pub const RUN_PARTIAL_FAILURE: u16 = 5000;
    pub const RUN_INTERRUPTED: u16 = 5001;
    pub const RUN_INVALID_TRANSITION: u16 = 5002;
    pub const RUN_NOT_FOUND: u16 = 5003;

    // Data integrity errors (6000-6999)
    pub const DATA_INTEGRITY_VIOLATION: u16 = 6000;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
}

/// Get a human-readable description of an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1002 => "Failed to parse configuration",
        1003 => "Configuration validation failed",

        2000 => "Authentication with the remote API failed",
        2001 => "Bearer token has expired",

        3000 => "Generic storage error",
        3001 => "Storage I/O error",
        3002 => "Store is locked by another run",
        3003 => "Storage serialization error",
        3004 => "Storage backend error",

        4000 => "Transient network failure",
        4001 => "Listing phase failed",

        5000 => "Run phase failed partway",
        5001 => "Run was interrupted",
        5002 => "Invalid run state transition",
        5003 => "Run not found",

        6000 => "Data integrity violation",

        _ => "Unknown error",
    }
}

/// Map an error code to a process exit status
///
/// The category digit becomes the exit status so scripts can tell an
/// authentication failure (2) from a storage failure (3) without parsing output.
pub fn exit_status(code: u16) -> i32 {
    match code / 1000 {
        category @ 1..=6 => category as i32,
        _ => 9,
    }
}
