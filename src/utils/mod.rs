// housekeeper/src/utils/mod.rs
pub mod logger;

use anyhow::{Context, Result};
use std::path::PathBuf;
use which::which;

/// Finds `name` in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
            name
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_executable_missing() {
        let err = find_executable("housekeeper-no-such-binary").unwrap_err();
        assert!(err.to_string().contains("housekeeper-no-such-binary"));
    }
}
