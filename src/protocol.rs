//! Shared protocol constants for the treefetch wire format

// Default listening ports
pub const PRIMARY_PORT: u16 = 65001;
pub const MIRROR_PORT: u16 = 65002;

// Handshake
pub const PROBE: &[u8; 4] = b"test";
pub const ACK: &str = "Successful connection";
pub const REDIRECT_PREFIX: &str = "REDIRECT:";

// Plain text replies
pub const QUIT_ACK: &str = "quit";
pub const FILE_NOT_FOUND: &str = "File not found";
pub const INVALID_COMMAND: &str = "Invalid command\n";
pub const HOME_UNREADABLE: &str = "Error: home directory unreadable";

// Receivers read plain text and command lines up to this many bytes
pub const MAX_TEXT_LEN: usize = 1024;

// Archive framing
pub const LENGTH_HEADER_LEN: usize = 8;
pub const COMPLETION_MARKER: &[u8; 12] = b"Tar received";

// Any declared length at or below this means "no archive follows".
// This is the interoperable contract, not a literal zero.
pub const NO_ARCHIVE_THRESHOLD: i64 = 50;

// Guards the receive buffer allocation against a corrupt header
pub const MAX_ARCHIVE_SIZE: i64 = 4 * 1024 * 1024 * 1024;

// Name of the archive written on the client side
pub const LOCAL_ARCHIVE_NAME: &str = "temp.tar.zst";

// findfile never descends further than this below the home root
pub const MAX_FIND_DEPTH: usize = 20;

// Admission policy: connections below this count are always served
pub const ADMIT_FIRST: u64 = 4;
// Above this count, only even-numbered connections are served
pub const ADMIT_ALTERNATE_AFTER: u64 = 7;

// A primary follows at most this many redirects
pub const MAX_REDIRECTS: usize = 1;

pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5000;

    // Time allowed for the acknowledgment or redirect after the probe (ms)
    pub const HANDSHAKE_MS: u64 = 5000;
}
