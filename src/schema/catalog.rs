use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use tracing::info;

use super::SchemaTemplate;
use crate::config::SchemaConfig;
use crate::config::LATEST_VERSION;
use crate::Error;
use crate::Result;
use crate::SchemaError;

const BUILTIN_VERSION: &str = "1.0";

const BUILTIN_SCOPES: &[(&str, &str)] = &[
    ("Lock", include_str!("../../schemas/1.0/Lock.json")),
    ("Node", include_str!("../../schemas/1.0/Node.json")),
    ("Package", include_str!("../../schemas/1.0/Package.json")),
    ("Robot", include_str!("../../schemas/1.0/Robot.json")),
    ("SharedDataEntry", include_str!("../../schemas/1.0/SharedDataEntry.json")),
    ("Var", include_str!("../../schemas/1.0/Var.json")),
];

/// Schema templates per API version. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    versions: BTreeMap<String, Arc<SchemaTemplate>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Templates compiled into the crate
    pub fn builtin() -> Result<Self> {
        let mut template = SchemaTemplate::new(BUILTIN_VERSION);
        for (scope, content) in BUILTIN_SCOPES {
            template.add_scope_json(scope, content)?;
        }
        let mut catalog = Self::new();
        catalog.insert(template);
        Ok(catalog)
    }

    /// Loads `<dir>/<version>/<Scope>.json` files.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut catalog = Self::new();

        for entry in fs::read_dir(dir).map_err(|e| Error::Fatal(format!("read {}: {e}", dir.display())))? {
            let entry = entry.map_err(|e| Error::Fatal(e.to_string()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(version) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let mut template = SchemaTemplate::new(version);
            for file in fs::read_dir(&path).map_err(|e| Error::Fatal(format!("read {}: {e}", path.display())))? {
                let file = file.map_err(|e| Error::Fatal(e.to_string()))?.path();
                if file.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(scope) = file.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let content = fs::read_to_string(&file)
                    .map_err(|e| Error::Fatal(format!("read {}: {e}", file.display())))?;
                template.add_scope_json(scope, &content)?;
                debug!(version, scope, "loaded schema template");
            }
            catalog.insert(template);
        }

        if catalog.versions.is_empty() {
            return Err(SchemaError::InvalidTemplate {
                name: dir.display().to_string(),
                reason: "no schema versions found".to_string(),
            }
            .into());
        }
        info!(versions = ?catalog.versions.keys().collect::<Vec<_>>(), "schema catalog loaded");
        Ok(catalog)
    }

    pub fn from_config(config: &SchemaConfig) -> Result<Self> {
        let catalog = if config.uses_builtin() {
            Self::builtin()?
        } else {
            Self::from_dir(&config.dir)?
        };
        // Fail early on an unknown configured version
        catalog.template(&config.version)?;
        Ok(catalog)
    }

    pub fn insert(
        &mut self,
        template: SchemaTemplate,
    ) {
        self.versions.insert(template.version().to_string(), Arc::new(template));
    }

    /// `latest` resolves to the highest version.
    pub fn template(
        &self,
        version: &str,
    ) -> std::result::Result<Arc<SchemaTemplate>, SchemaError> {
        if version == LATEST_VERSION {
            return self.latest();
        }
        self.versions
            .get(version)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownVersion(version.to_string()))
    }

    pub fn latest(&self) -> std::result::Result<Arc<SchemaTemplate>, SchemaError> {
        self.versions
            .iter()
            .max_by(|(a, _), (b, _)| compare_versions(a, b))
            .map(|(_, t)| t.clone())
            .ok_or_else(|| SchemaError::UnknownVersion(LATEST_VERSION.to_string()))
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }
}

/// Dotted numeric comparison, `"1.10" > "1.9"`.
pub(super) fn compare_versions(
    a: &str,
    b: &str,
) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

