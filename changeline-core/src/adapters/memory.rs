//! In-memory resource accessor, for embedded changelogs and tests

use std::collections::BTreeMap;

use crate::domain::result::{Error, Result};
use crate::ports::ResourceAccessor;

#[derive(Debug, Clone, Default)]
pub struct MemoryAccessor {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file, builder style
    pub fn with(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }
}

impl ResourceAccessor for MemoryAccessor {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::parse(path, "file not found"))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = match dir.trim_end_matches('/') {
            "" => String::new(),
            d => format!("{}/", d),
        };
        Ok(self
            .files
            .keys()
            .filter(|path| {
                path.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_is_one_level_and_sorted() {
        let accessor = MemoryAccessor::new()
            .with("db/b.json", "{}")
            .with("db/a.json", "{}")
            .with("db/nested/c.json", "{}")
            .with("other.json", "{}");

        assert_eq!(accessor.list("db").unwrap(), vec!["db/a.json", "db/b.json"]);
        assert_eq!(accessor.list("").unwrap(), vec!["other.json"]);
        assert!(accessor.read("db/zzz.json").is_err());
    }
}
