//! Result codes shared by the server and the client
//!
//! Non-negative codes are reported by the server in the message header.
//! Negative codes are generated on the client side.

/// Client generated a value the server could not parse.
pub const PARSE_ERROR: i32 = -2;
/// No usable replica for the partition.
pub const INVALID_NODE_ERROR: i32 = -3;
/// Connection pool limit reached.
pub const NO_MORE_CONNECTIONS: i32 = -7;
/// Server is not reachable.
pub const SERVER_NOT_AVAILABLE: i32 = -8;
/// Generic client failure.
pub const CLIENT_ERROR: i32 = -1;

pub const OK: i32 = 0;
pub const SERVER_ERROR: i32 = 1;
pub const KEY_NOT_FOUND_ERROR: i32 = 2;
pub const GENERATION_ERROR: i32 = 3;
pub const PARAMETER_ERROR: i32 = 4;
pub const KEY_EXISTS_ERROR: i32 = 5;
pub const BIN_EXISTS_ERROR: i32 = 6;
pub const CLUSTER_KEY_MISMATCH: i32 = 7;
pub const SERVER_MEM_ERROR: i32 = 8;
pub const TIMEOUT: i32 = 9;
pub const PARTITION_UNAVAILABLE: i32 = 11;
pub const BIN_TYPE_ERROR: i32 = 12;
pub const RECORD_TOO_BIG: i32 = 13;
pub const KEY_BUSY: i32 = 14;
pub const DEVICE_OVERLOAD: i32 = 18;
pub const FILTERED_OUT: i32 = 27;
pub const INVALID_NAMESPACE: i32 = 20;
pub const NOT_AUTHENTICATED: i32 = 80;
pub const INVALID_USER: i32 = 60;
pub const INVALID_PASSWORD: i32 = 62;
pub const EXPIRED_SESSION: i32 = 63;
pub const INVALID_CREDENTIAL: i32 = 65;

/// Short description for a result code.
pub fn describe(code: i32) -> &'static str {
    match code {
        PARSE_ERROR => "Parse error",
        INVALID_NODE_ERROR => "Invalid node",
        NO_MORE_CONNECTIONS => "No more available connections",
        SERVER_NOT_AVAILABLE => "Server not available",
        CLIENT_ERROR => "Client error",
        OK => "OK",
        SERVER_ERROR => "Server error",
        KEY_NOT_FOUND_ERROR => "Key not found",
        GENERATION_ERROR => "Generation error",
        PARAMETER_ERROR => "Parameter error",
        KEY_EXISTS_ERROR => "Key already exists",
        BIN_EXISTS_ERROR => "Bin already exists",
        CLUSTER_KEY_MISMATCH => "Cluster key mismatch",
        SERVER_MEM_ERROR => "Server memory error",
        TIMEOUT => "Timeout",
        PARTITION_UNAVAILABLE => "Partition unavailable",
        BIN_TYPE_ERROR => "Bin type error",
        RECORD_TOO_BIG => "Record too big",
        KEY_BUSY => "Hot key",
        DEVICE_OVERLOAD => "Device overload",
        FILTERED_OUT => "Transaction filtered out",
        INVALID_NAMESPACE => "Namespace not found",
        NOT_AUTHENTICATED => "Not authenticated",
        INVALID_USER => "Invalid user",
        INVALID_PASSWORD => "Invalid password",
        EXPIRED_SESSION => "Login session expired",
        INVALID_CREDENTIAL => "Invalid credential",
        _ => "Unknown result code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_known_and_unknown() {
        assert_eq!(describe(TIMEOUT), "Timeout");
        assert_eq!(describe(KEY_NOT_FOUND_ERROR), "Key not found");
        assert_eq!(describe(12345), "Unknown result code");
    }
}
