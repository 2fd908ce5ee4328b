//! Entry-name validation.
//!
//! Entry names are relative paths with `/`-separated components, so hosts
//! can scope documents and tarballs into subdirectories of the storage root.
//! Valid entry names:
//! - Must be non-empty
//! - Must not contain NUL or `\`
//! - Must not start or end with `/` (no absolute paths)
//! - Components must be non-empty (no consecutive slashes)
//! - Components must not be `.` or `..`
//! - Components must not start with `.` (reserved for staging files)
//! - Components must not end with `.lock` (reserved for lock markers)
//!
//! A validated name always resolves strictly beneath the storage root and
//! can never collide with the auxiliary lock/staging namespaces.

use wharf_locking::LOCK_SUFFIX;

use crate::error::{Result, StorageError};

/// Characters that are forbidden anywhere in an entry name.
const FORBIDDEN_CHARS: &[char] = &['\\', '\0'];

/// Validate an entry name, returning `Ok(())` if valid.
///
/// # Examples
///
/// ```
/// use wharf_storage::validate_entry_name;
///
/// assert!(validate_entry_name("package.json").is_ok());
/// assert!(validate_entry_name("_storage/package4").is_ok());
/// assert!(validate_entry_name("../escape").is_err());
/// assert!(validate_entry_name(".tmp-123").is_err());
/// ```
pub fn validate_entry_name(name: &str) -> Result<()> {
    let err = |reason: String| {
        Err(StorageError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return err("entry name must not be empty".into());
    }

    for ch in FORBIDDEN_CHARS {
        if name.contains(*ch) {
            return err(format!("contains forbidden character: {ch:?}"));
        }
    }

    if name.starts_with('/') {
        return err("must not be an absolute path".into());
    }

    if name.ends_with('/') {
        return err("must not end with '/'".into());
    }

    for component in name.split('/') {
        if component.is_empty() {
            return err("must not contain consecutive slashes '//'".into());
        }
        if component == "." || component == ".." {
            return err("must not contain relative path components".into());
        }
        // Leading dots are reserved for write-staging files.
        if component.starts_with('.') {
            return err("components must not start with '.'".into());
        }
        // The `.lock` suffix is reserved for lock markers.
        if component.ends_with(LOCK_SUFFIX) {
            return err("components must not end with '.lock'".into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in [
            "package.json",
            "pkg-1.0.0.tgz",
            "readme-test-0.0.0.tgz",
            "package4",
            "with spaces",
            "lock", // only the suffix form is reserved
        ] {
            assert!(validate_entry_name(name).is_ok(), "rejected {name:?}");
        }
    }

    #[test]
    fn accepts_nested_names() {
        for name in [
            "_storage/package4",
            "_storage/_createWriteStream/new-readme-0.0.0.tgz",
            "scope/pkg/package.json",
        ] {
            assert!(validate_entry_name(name).is_ok(), "rejected {name:?}");
        }
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        for name in ["../up", "a/../b", "a/..", "/abs", "/abs/b", "..", ".", ""] {
            assert!(validate_entry_name(name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn rejects_malformed_separators() {
        for name in ["a//b", "a/", "a\\b"] {
            assert!(validate_entry_name(name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn rejects_reserved_namespaces_in_any_component() {
        assert!(validate_entry_name("manifest.lock").is_err());
        assert!(validate_entry_name("nested/manifest.lock").is_err());
        assert!(validate_entry_name(".tmp-abc").is_err());
        assert!(validate_entry_name("nested/.tmp-abc").is_err());
        assert!(validate_entry_name(".hidden").is_err());
        assert!(validate_entry_name("nested/.hidden/file").is_err());
    }

    #[test]
    fn rejects_nul() {
        assert!(validate_entry_name("bad\0name").is_err());
    }
}
