use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::domain::{RegressionFile, SuiteName};
use crate::error::{Error, Result};

/// Every known suite, keyed by name. Filled once by the loader and read-only
/// afterwards; clones share the same definitions.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    files: HashMap<SuiteName, Arc<RegressionFile>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, file: RegressionFile) -> Result<()> {
        if self.files.contains_key(&file.name) {
            return Err(Error::DuplicateSuite(file.name));
        }
        debug!(
            suite = %file.name,
            statements = file.statements.len(),
            depends_on = file.depends_on.len(),
            "Registered suite"
        );
        self.files.insert(file.name.clone(), Arc::new(file));
        Ok(())
    }

    pub fn register_all<I>(&mut self, files: I) -> Result<()>
    where
        I: IntoIterator<Item = RegressionFile>,
    {
        for file in files {
            self.register(file)?;
        }
        Ok(())
    }

    pub fn lookup(&self, name: &SuiteName) -> Option<Arc<RegressionFile>> {
        self.files.get(name).cloned()
    }

    /// Resolves a user-supplied name, failing loudly when it is not registered.
    pub fn get(&self, name: &str) -> Result<Arc<RegressionFile>> {
        let suite = SuiteName::new(name)?;
        self.lookup(&suite)
            .ok_or_else(|| Error::UnknownSuite(name.to_string()))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<SuiteName> {
        let mut names: Vec<SuiteName> = self.files.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegressionFile>> {
        self.files.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RegressionFileStatement;

    fn name(s: &str) -> SuiteName {
        SuiteName::new(s).unwrap()
    }

    fn suite(s: &str) -> RegressionFile {
        RegressionFile::new(name(s)).statement(RegressionFileStatement::void("SELECT 1;"))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        registry.register(suite("case")).unwrap();

        let found = registry.lookup(&name("case")).unwrap();
        assert_eq!(found.name, name("case"));
        assert!(registry.lookup(&name("int4")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_duplicate_fails() {
        let mut registry = Registry::new();
        registry.register(suite("case")).unwrap();

        let err = registry.register(suite("case")).unwrap_err();
        assert!(matches!(err, Error::DuplicateSuite(n) if n == name("case")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registration_order_irrelevant() {
        let mut registry = Registry::new();
        registry
            .register(RegressionFile::new(name("int4")).depends_on([name("test_setup")]))
            .unwrap();
        registry.register(suite("test_setup")).unwrap();

        assert!(registry.lookup(&name("int4")).is_some());
        assert!(registry.lookup(&name("test_setup")).is_some());
    }

    #[test]
    fn test_get_unknown_is_error() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(Error::UnknownSuite(n)) if n == "missing"
        ));
        assert!(matches!(
            registry.get("bad name"),
            Err(Error::InvalidSuiteName(_))
        ));
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = Registry::new();
        registry
            .register_all(vec![suite("int4"), suite("case"), suite("boolean")])
            .unwrap();
        assert_eq!(
            registry.names(),
            vec![name("boolean"), name("case"), name("int4")]
        );
    }

    #[test]
    fn test_clones_share_definitions() {
        let mut registry = Registry::new();
        registry.register(suite("case")).unwrap();
        let clone = registry.clone();

        let a = registry.lookup(&name("case")).unwrap();
        let b = clone.lookup(&name("case")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
