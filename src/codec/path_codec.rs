//! Document ⇄ flat key translation.
//!
//! A fixed field name contributes `name:` to the key, a runtime identifier
//! contributes `id,`. Leaves terminate the key; value-in-key leaves append
//! their value after the final separator and store an empty placeholder.
//!
//! ```text
//! {"Node": {"n1": {"PortsInst": {"p1": {"Template": "T"}}}}}
//!   → ("Node:n1,PortsInst:p1,Template:", "T", str)
//! ```

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use super::Document;
use super::Value;
use crate::constants::FIELD_SEPARATOR;
use crate::constants::ID_SEPARATOR;
use crate::constants::MIN_KEY_SEGMENTS;
use crate::constants::WILDCARD;
use crate::schema::Branch;
use crate::schema::SchemaNode;
use crate::schema::SchemaTemplate;
use crate::schema::TypeKind;
use crate::schema::TypeTag;
use crate::SchemaError;

/// One flat key with the value stored under it and its schema tag
#[derive(Debug, Clone, PartialEq)]
pub struct KeyTriple {
    pub key: String,
    pub value: Value,
    pub tag: TypeTag,
}

impl KeyTriple {
    /// Key up to and including the last separator. For value-in-key leaves
    /// this strips the value.
    pub fn base_key(&self) -> &str {
        match self.key.rfind([FIELD_SEPARATOR, ID_SEPARATOR]) {
            Some(idx) => &self.key[..=idx],
            None => &self.key,
        }
    }

    /// Value carried by the key itself, if any
    pub fn key_value(&self) -> Option<&str> {
        if !self.tag.value_in_key {
            return None;
        }
        Some(&self.key[self.base_key().len()..])
    }
}

/// Bidirectional translator bound to one schema version
#[derive(Debug, Clone)]
pub struct PathCodec {
    template: Arc<SchemaTemplate>,
}

impl PathCodec {
    pub fn new(template: Arc<SchemaTemplate>) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &Arc<SchemaTemplate> {
        &self.template
    }

    /// Flattens `document` into key triples in traversal order.
    ///
    /// With `validate = false` the document is treated as a search pattern:
    /// leaf types are not checked and a `"*"` value in a branch position
    /// emits a subtree pattern.
    pub fn encode(
        &self,
        document: &Document,
        validate: bool,
    ) -> Result<Vec<KeyTriple>, SchemaError> {
        let mut out = Vec::new();
        Walker {
            validate,
            out: &mut out,
        }
        .branch(document.as_map(), self.template.root(), "")?;
        trace!(keys = out.len(), validate, "encoded document");
        Ok(out)
    }

    /// Rebuilds a document from flat keys. Schema-free: both separators
    /// split the key, a non-empty final segment is the in-key value.
    pub fn decode<I, K>(entries: I) -> Result<Document, SchemaError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut root: BTreeMap<String, Value> = BTreeMap::new();
        for (key, value) in entries {
            insert_key(&mut root, key.as_ref(), value)?;
        }
        Ok(Document::from(root))
    }

    /// `{scope: <template with every identifier and leaf set to "*">}`
    pub fn wildcard_template(
        &self,
        scope: &str,
    ) -> Result<Document, SchemaError> {
        let node = self.template.scope(scope)?;
        let mut doc = Document::new();
        doc.insert(scope, node.wildcard());
        Ok(doc)
    }

    /// Search document for named arguments.
    ///
    /// `Name` (or the scope name itself) selects the scope identifier. Any
    /// other argument replaces the first field of that name found in
    /// pre-order: a leaf takes the value, a branch passes it down as the
    /// identifier of the level below. Everything else stays `*`.
    pub fn args_to_search_template(
        &self,
        scope: &str,
        args: &[(&str, &str)],
    ) -> Result<Document, SchemaError> {
        let node = self.template.scope(scope)?;

        let mut lookup: BTreeMap<&str, &str> = BTreeMap::new();
        for (name, value) in args {
            lookup.entry(*name).or_insert(*value);
        }
        let scope_id = lookup.get("Name").or_else(|| lookup.get(scope)).map(|v| v.to_string());

        let mut used: HashSet<&str> = HashSet::new();
        used.insert("Name");
        used.insert(scope);

        let mut doc = Document::new();
        doc.insert(scope, substitute(node, scope_id, &lookup, &mut used));
        Ok(doc)
    }

    /// Schema tag of the leaf a concrete key points at
    pub fn leaf_tag(
        &self,
        key: &str,
    ) -> Option<TypeTag> {
        let mut branch = self.template.root();
        let mut rest = key;
        while let Some(idx) = rest.find([FIELD_SEPARATOR, ID_SEPARATOR]) {
            let segment = &rest[..idx];
            let separator = rest[idx..].chars().next()?;
            rest = &rest[idx + 1..];

            let next = if separator == FIELD_SEPARATOR {
                branch.fields.get(segment)
            } else {
                branch.placeholder.as_ref().map(|(_, node)| node.as_ref())
            };
            match next? {
                SchemaNode::Leaf(tag) => return Some(*tag),
                SchemaNode::Branch(b) => branch = b,
            }
        }
        None
    }
}

struct Walker<'a> {
    validate: bool,
    out: &'a mut Vec<KeyTriple>,
}

impl Walker<'_> {
    fn branch(
        &mut self,
        entries: &BTreeMap<String, Value>,
        branch: &Branch,
        prefix: &str,
    ) -> Result<(), SchemaError> {
        for (name, value) in entries {
            let Some((node, is_identifier)) = branch.child(name) else {
                return Err(SchemaError::UnknownField {
                    path: prefix.to_string(),
                    field: name.clone(),
                });
            };
            let key = if is_identifier {
                self.check_identifier(name, prefix)?;
                format!("{prefix}{name}{ID_SEPARATOR}")
            } else {
                format!("{prefix}{name}{FIELD_SEPARATOR}")
            };
            self.node(value, node, key)?;
        }
        Ok(())
    }

    fn node(
        &mut self,
        value: &Value,
        node: &SchemaNode,
        key: String,
    ) -> Result<(), SchemaError> {
        match node {
            SchemaNode::Branch(branch) => match value {
                Value::Map(entries) => self.branch(entries, branch, &key),
                v if !self.validate && v.is_wildcard() => {
                    self.out.push(KeyTriple {
                        key: format!("{key}{WILDCARD}"),
                        value: value.clone(),
                        tag: TypeTag::new(TypeKind::Any),
                    });
                    Ok(())
                }
                other => Err(SchemaError::WrongType {
                    path: key,
                    expected: "map".to_string(),
                    found: other.kind_name(),
                }),
            },
            SchemaNode::Leaf(tag) => self.leaf(value, *tag, key),
        }
    }

    fn leaf(
        &mut self,
        value: &Value,
        tag: TypeTag,
        key: String,
    ) -> Result<(), SchemaError> {
        if self.validate {
            tag.check(value, &key)?;
        }

        if !tag.value_in_key {
            self.out.push(KeyTriple {
                key,
                value: value.clone(),
                tag,
            });
            return Ok(());
        }

        let Some(text) = value.scalar_text() else {
            return Err(SchemaError::WrongType {
                path: key,
                expected: tag.to_string(),
                found: value.kind_name(),
            });
        };
        self.check_identifier(&text, &key)?;
        self.out.push(KeyTriple {
            key: format!("{key}{text}"),
            value: Value::placeholder(),
            tag,
        });
        Ok(())
    }

    fn check_identifier(
        &self,
        identifier: &str,
        path: &str,
    ) -> Result<(), SchemaError> {
        let invalid = identifier.is_empty() || identifier.contains([FIELD_SEPARATOR, ID_SEPARATOR]);
        if invalid {
            return Err(SchemaError::InvalidIdentifier {
                path: path.to_string(),
                identifier: identifier.to_string(),
            });
        }
        Ok(())
    }
}

fn substitute<'a>(
    node: &'a SchemaNode,
    carried: Option<String>,
    args: &BTreeMap<&'a str, &'a str>,
    used: &mut HashSet<&'a str>,
) -> Value {
    let branch = match node {
        SchemaNode::Leaf(_) => return Value::Str(carried.unwrap_or_else(|| WILDCARD.to_string())),
        SchemaNode::Branch(branch) => branch,
    };

    let mut map = BTreeMap::new();
    for (name, child) in &branch.fields {
        let arg = take_arg(name, args, used);
        let value = match child {
            SchemaNode::Leaf(_) => Value::Str(arg.unwrap_or_else(|| WILDCARD.to_string())),
            SchemaNode::Branch(_) => substitute(child, arg, args, used),
        };
        map.insert(name.clone(), value);
    }
    if let Some((_, child)) = &branch.placeholder {
        let id = carried.unwrap_or_else(|| WILDCARD.to_string());
        map.insert(id, substitute(child, None, args, used));
    }
    Value::Map(map)
}

fn take_arg<'a>(
    name: &'a str,
    args: &BTreeMap<&'a str, &'a str>,
    used: &mut HashSet<&'a str>,
) -> Option<String> {
    let value = args.get(name)?;
    if !used.insert(name) {
        return None;
    }
    Some(value.to_string())
}

fn split_key(key: &str) -> Vec<&str> {
    key.split([FIELD_SEPARATOR, ID_SEPARATOR]).collect()
}

fn malformed(
    key: &str,
    reason: &str,
) -> SchemaError {
    SchemaError::MalformedKey {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn insert_key(
    root: &mut BTreeMap<String, Value>,
    key: &str,
    value: Value,
) -> Result<(), SchemaError> {
    let pieces = split_key(key);
    if pieces.len() < MIN_KEY_SEGMENTS {
        return Err(malformed(key, "fewer than 3 segments"));
    }

    let (last, path) = pieces.split_last().ok_or_else(|| malformed(key, "empty key"))?;
    let (leaf, parents) = path.split_last().ok_or_else(|| malformed(key, "empty key"))?;
    if path.iter().any(|p| p.is_empty()) {
        return Err(malformed(key, "empty segment"));
    }

    let mut current = root;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        match entry {
            Value::Map(next) => current = next,
            _ => return Err(malformed(key, "segment already holds a value")),
        }
    }

    if let Some(Value::Map(_)) = current.get(*leaf) {
        return Err(malformed(key, "leaf collides with a nested structure"));
    }
    let value = if last.is_empty() {
        value
    } else {
        Value::Str(last.to_string())
    };
    current.insert(leaf.to_string(), value);
    Ok(())
}
