use std::path::Path;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

pub const LATEST_VERSION: &str = "latest";

/// Where schema templates come from
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SchemaConfig {
    /// API version used by store handles, `latest` picks the highest loaded
    #[serde(default = "default_version")]
    pub version: String,

    /// Directory holding one sub-directory of `<Scope>.json` files per
    /// version. Empty means the templates compiled into the crate.
    #[serde(default)]
    pub dir: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            dir: String::new(),
        }
    }
}

impl SchemaConfig {
    pub fn uses_builtin(&self) -> bool {
        self.dir.trim().is_empty()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "schema.version cannot be empty".into(),
            )));
        }
        if !self.uses_builtin() && !Path::new(&self.dir).is_dir() {
            return Err(Error::Config(ConfigError::Message(format!(
                "schema.dir {} is not a directory",
                self.dir
            ))));
        }
        Ok(())
    }
}

fn default_version() -> String {
    LATEST_VERSION.to_string()
}
