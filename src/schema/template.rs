use std::collections::BTreeMap;
use std::fmt;

use crate::codec::Value;
use crate::constants::PLACEHOLDER_PREFIX;
use crate::constants::VALUE_IN_KEY_PREFIX;
use crate::SchemaError;

/// Primitive type of a schema leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Str,
    Bool,
    Int,
    Float,
    Hash,
    List,
    Any,
}

impl TypeKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "str" | "string" => Some(TypeKind::Str),
            "bool" => Some(TypeKind::Bool),
            "int" => Some(TypeKind::Int),
            "float" => Some(TypeKind::Float),
            "hash" => Some(TypeKind::Hash),
            "list" => Some(TypeKind::List),
            "any" => Some(TypeKind::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Str => "str",
            TypeKind::Bool => "bool",
            TypeKind::Int => "int",
            TypeKind::Float => "float",
            TypeKind::Hash => "hash",
            TypeKind::List => "list",
            TypeKind::Any => "any",
        }
    }

    /// Hash fields, list elements and `any` leaves are stored as text only
    /// when they are strings.
    pub fn is_container(&self) -> bool {
        matches!(self, TypeKind::Hash | TypeKind::List | TypeKind::Any)
    }

    fn accepts(
        &self,
        value: &Value,
    ) -> bool {
        match (self, value) {
            (TypeKind::Any, _) => true,
            (TypeKind::Str, Value::Str(_)) => true,
            (TypeKind::Bool, Value::Bool(_)) => true,
            (TypeKind::Int, Value::Int(_)) => true,
            (TypeKind::Float, Value::Float(_)) => true,
            (TypeKind::Hash, Value::Map(_)) => true,
            (TypeKind::List, Value::List(_)) => true,
            _ => false,
        }
    }
}

/// Leaf type tag, e.g. `str` or the value-in-key form `&str`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    pub kind: TypeKind,
    pub value_in_key: bool,
}

impl TypeTag {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            value_in_key: false,
        }
    }

    pub fn in_key(kind: TypeKind) -> Self {
        Self {
            kind,
            value_in_key: true,
        }
    }

    pub fn parse(
        raw: &str,
        path: &str,
    ) -> Result<Self, SchemaError> {
        let (value_in_key, name) = match raw.strip_prefix(VALUE_IN_KEY_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let kind = TypeKind::parse(name).ok_or_else(|| SchemaError::UnknownTypeTag {
            path: path.to_string(),
            tag: raw.to_string(),
        })?;
        if value_in_key && kind.is_container() && kind != TypeKind::Any {
            return Err(SchemaError::UnknownTypeTag {
                path: path.to_string(),
                tag: raw.to_string(),
            });
        }
        Ok(Self { kind, value_in_key })
    }

    /// Checks a document value against the tag
    pub fn check(
        &self,
        value: &Value,
        path: &str,
    ) -> Result<(), SchemaError> {
        if self.kind.accepts(value) {
            return Ok(());
        }
        Err(SchemaError::WrongType {
            path: path.to_string(),
            expected: self.to_string(),
            found: value.kind_name(),
        })
    }
}

impl fmt::Display for TypeTag {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.value_in_key {
            write!(f, "{}{}", VALUE_IN_KEY_PREFIX, self.kind.as_str())
        } else {
            f.write_str(self.kind.as_str())
        }
    }
}

/// A branch of the template: fixed fields plus an optional placeholder
/// whose children are runtime identifiers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Branch {
    pub fields: BTreeMap<String, SchemaNode>,
    pub placeholder: Option<(String, Box<SchemaNode>)>,
}

impl Branch {
    /// Resolves a document field: exact names win over the placeholder.
    pub fn child(
        &self,
        name: &str,
    ) -> Option<(&SchemaNode, bool)> {
        if let Some(node) = self.fields.get(name) {
            return Some((node, false));
        }
        self.placeholder.as_ref().map(|(_, node)| (node.as_ref(), true))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Leaf(TypeTag),
    Branch(Branch),
}

impl SchemaNode {
    /// Parses one node of a JSON template.
    pub fn from_json(
        value: &serde_json::Value,
        path: &str,
    ) -> Result<Self, SchemaError> {
        match value {
            serde_json::Value::String(tag) => Ok(SchemaNode::Leaf(TypeTag::parse(tag, path)?)),
            serde_json::Value::Object(entries) => {
                let mut branch = Branch::default();
                for (name, child) in entries {
                    let child_path = format!("{path}/{name}");
                    let node = SchemaNode::from_json(child, &child_path)?;
                    if name.starts_with(PLACEHOLDER_PREFIX) {
                        if let Some((existing, _)) = &branch.placeholder {
                            return Err(SchemaError::InvalidTemplate {
                                name: path.to_string(),
                                reason: format!("two placeholders '{existing}' and '{name}'"),
                            });
                        }
                        branch.placeholder = Some((name.clone(), Box::new(node)));
                    } else {
                        branch.fields.insert(name.clone(), node);
                    }
                }
                Ok(SchemaNode::Branch(branch))
            }
            other => Err(SchemaError::InvalidTemplate {
                name: path.to_string(),
                reason: format!("expected a type tag or an object, found {other}"),
            }),
        }
    }

    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            SchemaNode::Branch(b) => Some(b),
            SchemaNode::Leaf(_) => None,
        }
    }

    /// Every identifier and leaf value replaced by `*`
    pub fn wildcard(&self) -> Value {
        match self {
            SchemaNode::Leaf(_) => Value::Str(crate::constants::WILDCARD.to_string()),
            SchemaNode::Branch(branch) => {
                let mut map: BTreeMap<String, Value> = branch
                    .fields
                    .iter()
                    .map(|(name, child)| (name.clone(), child.wildcard()))
                    .collect();
                if let Some((_, child)) = &branch.placeholder {
                    map.insert(crate::constants::WILDCARD.to_string(), child.wildcard());
                }
                Value::Map(map)
            }
        }
    }
}

/// All scope templates of one API version
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaTemplate {
    version: String,
    root: Branch,
}

impl SchemaTemplate {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            root: Branch::default(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn root(&self) -> &Branch {
        &self.root
    }

    /// Registers a scope from the content of a `<Scope>.json` file, which
    /// wraps the scope template in a top-level `schema` member.
    pub fn add_scope_json(
        &mut self,
        scope: &str,
        content: &str,
    ) -> Result<(), SchemaError> {
        let parsed: serde_json::Value =
            serde_json::from_str(content).map_err(|e| SchemaError::InvalidTemplate {
                name: scope.to_string(),
                reason: e.to_string(),
            })?;
        let body = parsed.get("schema").ok_or_else(|| SchemaError::InvalidTemplate {
            name: scope.to_string(),
            reason: "missing top-level 'schema' member".to_string(),
        })?;
        self.add_scope(scope, SchemaNode::from_json(body, scope)?);
        Ok(())
    }

    pub fn add_scope(
        &mut self,
        scope: &str,
        node: SchemaNode,
    ) {
        self.root.fields.insert(scope.to_string(), node);
    }

    /// Builds a template from a JSON object keyed by scope name.
    pub fn from_json(
        version: impl Into<String>,
        value: &serde_json::Value,
    ) -> Result<Self, SchemaError> {
        let version = version.into();
        match SchemaNode::from_json(value, "")? {
            SchemaNode::Branch(root) if root.placeholder.is_none() => Ok(Self { version, root }),
            _ => Err(SchemaError::InvalidTemplate {
                name: version,
                reason: "top level must map scope names to templates".to_string(),
            }),
        }
    }

    pub fn scope(
        &self,
        scope: &str,
    ) -> Result<&SchemaNode, SchemaError> {
        self.root
            .fields
            .get(scope)
            .ok_or_else(|| SchemaError::UnknownScope(scope.to_string()))
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.root.fields.keys().map(String::as_str)
    }
}
