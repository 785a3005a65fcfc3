/// Constants used throughout the kiln codebase
// Configuration file name looked up in the working directory
pub const CONFIG_FILENAME: &str = "kiln.json";

// Default state directory (signature history lives here)
pub const DEFAULT_STATE_DIR: &str = ".kiln";

// Default cache directory name below the state directory
pub const DEFAULT_CACHE_DIR: &str = "cache";

// Signature history file name
pub const SIGNATURE_HISTORY_FILE: &str = "signatures.json";

// Environment variable names
pub const KILN_PARALLELISM_VAR: &str = "KILN_PARALLELISM";
pub const KILN_CONTINUE_AFTER_ERRORS_VAR: &str = "KILN_CONTINUE_AFTER_ERRORS";
pub const KILN_CACHE_ENABLED_VAR: &str = "KILN_CACHE_ENABLED";
pub const KILN_CACHE_DIR_VAR: &str = "KILN_CACHE_DIR";
pub const KILN_CACHE_SIZE_LIMIT_VAR: &str = "KILN_CACHE_SIZE_LIMIT";
pub const KILN_SIGNATURE_MODE_VAR: &str = "KILN_SIGNATURE_MODE";
pub const KILN_DEPENDENCY_VALIDATION_VAR: &str = "KILN_DEPENDENCY_VALIDATION";
pub const KILN_LOG_VAR: &str = "KILN_LOG";

// On-disk format versions. Bump on incompatible layout changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;
pub const SIGNATURE_HISTORY_VERSION: u32 = 1;
pub const SIGNATURE_FORMAT_VERSION: u32 = 1;

// Timeouts
pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TERMINATION_GRACE_MS: u64 = 2_000;

// Number of discovered-dependency sets remembered per base cache key
pub const MAX_DEPENDENCY_SETS_PER_KEY: usize = 8;
