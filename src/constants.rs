// -
// Flat key layout

/// Separator written after a fixed field name
pub(crate) const FIELD_SEPARATOR: char = ':';
/// Separator written after a runtime identifier
pub(crate) const ID_SEPARATOR: char = ',';
/// Single-level wildcard used in templates and scan patterns
pub const WILDCARD: &str = "*";
/// Schema placeholder prefix marking a hash-of-named-children branch
pub(crate) const PLACEHOLDER_PREFIX: char = '$';
/// Type tag prefix marking a value-in-key leaf
pub(crate) const VALUE_IN_KEY_PREFIX: char = '&';
/// Minimum number of segments of a decodable key (`branch:id,leaf:`)
pub(crate) const MIN_KEY_SEGMENTS: usize = 3;

// -
// Keyspace notifications

pub(crate) const KEYSPACE_PREFIX: &str = "__keyspace@";
pub(crate) const KEYSPACE_ANY_DB: &str = "__keyspace@*__:";

// -
// Value encoding

/// Blob header: 0xFF never occurs in UTF-8 so blobs never decode as text
pub(crate) const BLOB_MAGIC: [u8; 3] = [0xFF, b'D', b'V'];
pub(crate) const BLOB_VERSION: u8 = 1;

// -
// Scan

pub(crate) const SCAN_COUNT: usize = 1000;

// -
// Locks

/// Schema scope holding the three lock keys
pub(crate) const LOCK_SCOPE: &str = "Lock";
pub(crate) const LOCK_VALUE_FIELD: &str = "Value";
pub(crate) const LOCK_QUEUE_FIELD: &str = "Queue";
pub(crate) const LOCK_ALIVE_FIELD: &str = "Alive";
/// Queue score = level * 10^13 + arrival millis
pub(crate) const QUEUE_LEVEL_FACTOR: u64 = 10_000_000_000_000;
