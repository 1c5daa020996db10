//! Resource accessor port - where changelog documents come from

use crate::domain::result::Result;

/// Read-only access to changelog documents by logical path
///
/// Paths use `/` as separator regardless of platform.
pub trait ResourceAccessor: Send + Sync {
    /// Raw bytes of the resource at `path`
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Paths of the files directly inside directory `dir`, sorted
    fn list(&self, dir: &str) -> Result<Vec<String>>;
}
