use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::{Error, Result};

static DATA_PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{data:([^}]+)\}\}").expect("DATA_PLACEHOLDER_REGEX pattern is valid")
});

/// Directory holding the on-disk files that fixtures `COPY` from. Statements refer
/// to them as `{{data:NAME}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFolder {
    root: PathBuf,
}

impl DataFolder {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self, name: &str) -> Result<String> {
        let relative = Path::new(name);
        if name.contains('\0') {
            return Err(Error::Loader(format!("Data file name contains null byte: {:?}", name)));
        }
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::Loader(format!(
                "Data file must stay inside the data folder: {}",
                name
            )));
        }
        Ok(self.root.join(relative).to_string_lossy().into_owned())
    }

    /// Replaces every `{{data:NAME}}` with the absolute path of `NAME`.
    pub fn substitute<'a>(&self, sql: &'a str) -> Result<Cow<'a, str>> {
        if !has_data_placeholder(sql) {
            return Ok(Cow::Borrowed(sql));
        }
        let mut failure = None;
        let replaced = DATA_PLACEHOLDER_REGEX.replace_all(sql, |caps: &Captures| {
            match self.absolute_path(caps[1].trim()) {
                Ok(path) => path,
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(Cow::Owned(replaced.into_owned())),
        }
    }
}

pub fn has_data_placeholder(sql: &str) -> bool {
    DATA_PLACEHOLDER_REGEX.is_match(sql)
}
