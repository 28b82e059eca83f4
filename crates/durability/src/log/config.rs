//! File log configuration.

use crate::format::PAGE_SIZE;

/// File log configuration parameters.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Size of the log file in pages, the two header pages included
    /// (default: 2048, i.e. 8MB).
    ///
    /// The file is preallocated at creation and never grows.
    pub log_pages: u64,

    /// File name inside the object manager directory (default: `objmgr.log`).
    pub file_name: String,

    /// Whether forced writes call `sync_data` (default: true).
    ///
    /// Turning this off keeps the page layout of forced writes but gives up
    /// durability across power loss; only useful for tests and benchmarks.
    pub sync_on_force: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_pages: 2048,
            file_name: "objmgr.log".to_string(),
            sync_on_force: true,
        }
    }
}

impl LogConfig {
    /// Create a new log configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the file size in pages (builder pattern).
    pub fn with_log_pages(mut self, pages: u64) -> Self {
        self.log_pages = pages;
        self
    }

    /// Set the file name (builder pattern).
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Set whether forced writes sync (builder pattern).
    pub fn with_sync_on_force(mut self, sync: bool) -> Self {
        self.sync_on_force = sync;
        self
    }

    /// Size of the log file in bytes.
    pub fn file_size(&self) -> u64 {
        self.log_pages * PAGE_SIZE as u64
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), LogConfigError> {
        if self.log_pages < 8 {
            return Err(LogConfigError::TooFewPages(self.log_pages));
        }
        if self.file_name.is_empty() || self.file_name.contains(std::path::MAIN_SEPARATOR) {
            return Err(LogConfigError::BadFileName(self.file_name.clone()));
        }
        Ok(())
    }

    /// Create a configuration for testing (small file, no sync).
    pub fn for_testing() -> Self {
        LogConfig {
            log_pages: 64,
            file_name: "objmgr.log".to_string(),
            sync_on_force: false,
        }
    }
}

/// Log configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogConfigError {
    /// Fewer pages than the two header pages plus a usable data area.
    #[error("Log must have at least 8 pages, got {0}")]
    TooFewPages(u64),

    /// The file name is empty or contains a path separator.
    #[error("Invalid log file name: {0:?}")]
    BadFileName(String),
}

impl From<LogConfigError> for objmgr_core::Error {
    fn from(e: LogConfigError) -> Self {
        objmgr_core::Error::Config(e.to_string())
    }
}
