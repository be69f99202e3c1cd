//! The type classifier: turns any supported output type into an [`OutputTypeSpec`].
//!
//! A [`TypeDescriptor`] describes the value a user hands in as output type. [`classify`] tries a
//! fixed chain of recognizers and stops at the first one that matches, so a container of integers
//! is never mistaken for an integer and an enum is never mistaken for a literal set.
use std::fmt::{Debug, Display};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::automaton::Automaton;
use crate::terms;

/// The primitive types with a canonical text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Primitive {
    #[allow(missing_docs)]
    Int,
    #[allow(missing_docs)]
    Float,
    #[allow(missing_docs)]
    Str,
    #[allow(missing_docs)]
    Bool,
    #[allow(missing_docs)]
    Date,
    #[allow(missing_docs)]
    Time,
    #[allow(missing_docs)]
    DateTime,
}

impl Primitive {
    /// The regular expression of the primitive's text form.
    pub fn pattern(self) -> &'static str {
        match self {
            Primitive::Int => terms::INTEGER,
            Primitive::Float => terms::NUMBER,
            Primitive::Str => terms::STRING,
            Primitive::Bool => terms::BOOLEAN,
            Primitive::Date => terms::DATE,
            Primitive::Time => terms::TIME,
            Primitive::DateTime => terms::DATETIME,
        }
    }

    fn json_schema(self) -> Value {
        match self {
            Primitive::Int => json!({"type": "integer"}),
            Primitive::Float => json!({"type": "number"}),
            Primitive::Str => json!({"type": "string"}),
            Primitive::Bool => json!({"type": "boolean"}),
            Primitive::Date => json!({"type": "string", "format": "date"}),
            Primitive::Time => json!({"type": "string", "format": "time"}),
            Primitive::DateTime => json!({"type": "string", "format": "date-time"}),
        }
    }
}

/// An enumeration with named members.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumType {
    /// The name of the enumeration.
    pub name: String,
    /// The members as `(name, value)` pairs, in declaration order.
    pub members: Vec<(String, Value)>,
}

impl EnumType {
    /// Creates an enumeration whose member values are their names.
    pub fn from_names<S: Into<String>>(name: impl Into<String>, names: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            members: names
                .into_iter()
                .map(|n| {
                    let n = n.into();
                    (n.clone(), Value::String(n))
                })
                .collect(),
        }
    }
}

/// The flavor of a native record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructKind {
    /// A plain data class.
    Dataclass,
    /// A typed dictionary.
    TypedDict,
    /// A validated model class.
    Model,
}

/// A field of a [`StructType`].
#[derive(Debug, Clone)]
pub struct Field {
    /// The field name.
    pub name: String,
    /// The field type.
    pub ty: TypeDescriptor,
    /// The default value. Fields with a default are optional.
    pub default: Option<Value>,
}

impl Field {
    /// A required field.
    pub fn new(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    /// An optional field with a default value.
    pub fn with_default(name: impl Into<String>, ty: TypeDescriptor, default: Value) -> Self {
        Self {
            name: name.into(),
            ty,
            default: Some(default),
        }
    }
}

/// A native record type with named fields.
#[derive(Debug, Clone)]
pub struct StructType {
    /// The type name, used as the schema title.
    pub name: String,
    /// Which kind of record this is.
    pub kind: StructKind,
    /// The fields in declaration order.
    pub fields: Vec<Field>,
}

impl StructType {
    /// Creates a record type.
    pub fn new(name: impl Into<String>, kind: StructKind, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            kind,
            fields,
        }
    }

    /// The JSON schema of the record. Nested records are placed under `$defs`.
    pub fn json_schema(&self) -> Result<Value, UnsupportedTypeError> {
        let mut defs = Map::new();
        let body = struct_body(self, &mut defs)?;
        if defs.is_empty() {
            return Ok(Value::Object(body));
        }
        let mut schema = Map::new();
        schema.insert("$defs".to_string(), Value::Object(defs));
        schema.extend(body);
        Ok(Value::Object(schema))
    }
}

/// The capability of producing a JSON schema.
///
/// Anything implementing it is accepted as an output type, whatever library it comes from.
pub trait ToJsonSchema: Debug + Send + Sync {
    /// Produces the JSON schema.
    fn to_json_schema(&self) -> Value;
    /// The name reported in error messages.
    fn type_name(&self) -> String {
        "JsonSchema".to_string()
    }
}

/// A description of a user-supplied output type.
#[derive(Debug, Clone)]
pub enum TypeDescriptor {
    /// A primitive type.
    Primitive(Primitive),
    /// The none type.
    None,
    /// A type with attached metadata, such as a description.
    Annotated {
        /// The annotated type.
        inner: Box<TypeDescriptor>,
        /// A description recorded in the JSON schema.
        description: Option<String>,
    },
    /// A distinct name for another type.
    NewType {
        /// The new name.
        name: String,
        /// The underlying type.
        inner: Box<TypeDescriptor>,
    },
    /// A homogeneous list.
    List(Box<TypeDescriptor>),
    /// A fixed-length tuple.
    Tuple(Vec<TypeDescriptor>),
    /// A dictionary with typed keys and values.
    Dict(Box<TypeDescriptor>, Box<TypeDescriptor>),
    /// An unparameterized dictionary.
    Mapping,
    /// One of several types.
    Union(Vec<TypeDescriptor>),
    /// One of several literal values.
    Literal(Vec<Value>),
    /// An enumeration.
    Enum(EnumType),
    /// A native record type.
    Struct(StructType),
    /// An object that can produce a JSON schema.
    Schema(Arc<dyn ToJsonSchema>),
    /// A JSON schema.
    JsonSchema(Value),
    /// A regular expression.
    Regex(String),
    /// A context-free grammar.
    Cfg(String),
    /// An already compiled automaton.
    Automaton(Arc<Automaton>),
    /// Any other type, by name.
    Opaque(String),
}

/// The classified form of an output type, ready for pattern compilation.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputTypeSpec {
    /// A primitive with a canonical text form.
    Primitive(Primitive),
    /// An enumeration; its member values are the choices.
    Enum(EnumType),
    /// A JSON schema.
    JsonSchema(Value),
    /// A regular expression.
    Regex(String),
    /// A context-free grammar in EBNF-like text.
    Cfg(String),
    /// A set of literal strings.
    Choice(Vec<String>),
    /// A native record type.
    NativeStruct(StructType),
    /// An already compiled automaton.
    Automaton(Arc<Automaton>),
}

impl PartialEq for StructType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.json_schema().ok() == other.json_schema().ok()
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("The type `{type_name}` is not supported: {reason}")]
/// The error returned when an output type matches no recognized shape.
pub struct UnsupportedTypeError {
    /// The name of the offending type.
    pub type_name: String,
    /// Why it was rejected.
    pub reason: String,
}

impl UnsupportedTypeError {
    fn new(ty: &TypeDescriptor, reason: impl Into<String>) -> Self {
        Self {
            type_name: ty.to_string(),
            reason: reason.into(),
        }
    }
}

impl Display for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join(types: &[TypeDescriptor]) -> String {
            types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            TypeDescriptor::Primitive(p) => write!(f, "{p}"),
            TypeDescriptor::None => write!(f, "NoneType"),
            TypeDescriptor::Annotated { inner, .. } => write!(f, "Annotated[{inner}]"),
            TypeDescriptor::NewType { name, .. } => write!(f, "{name}"),
            TypeDescriptor::List(item) => write!(f, "List[{item}]"),
            TypeDescriptor::Tuple(items) => write!(f, "Tuple[{}]", join(items)),
            TypeDescriptor::Dict(k, v) => write!(f, "Dict[{k}, {v}]"),
            TypeDescriptor::Mapping => write!(f, "dict"),
            TypeDescriptor::Union(types) => write!(f, "Union[{}]", join(types)),
            TypeDescriptor::Literal(values) => {
                let values: Vec<String> = values.iter().map(Value::to_string).collect();
                write!(f, "Literal[{}]", values.join(", "))
            }
            TypeDescriptor::Enum(e) => write!(f, "{}", e.name),
            TypeDescriptor::Struct(s) => write!(f, "{}", s.name),
            TypeDescriptor::Schema(s) => write!(f, "{}", s.type_name()),
            TypeDescriptor::JsonSchema(_) => write!(f, "JsonSchema"),
            TypeDescriptor::Regex(_) => write!(f, "Regex"),
            TypeDescriptor::Cfg(_) => write!(f, "CFG"),
            TypeDescriptor::Automaton(_) => write!(f, "Automaton"),
            TypeDescriptor::Opaque(name) => write!(f, "{name}"),
        }
    }
}

impl TypeDescriptor {
    /// Strips `Annotated` and `NewType` wrappers.
    pub fn unwrap_aliases(&self) -> &TypeDescriptor {
        match self {
            TypeDescriptor::Annotated { inner, .. } | TypeDescriptor::NewType { inner, .. } => {
                inner.unwrap_aliases()
            }
            other => other,
        }
    }

    fn primitive(&self) -> Option<Primitive> {
        match self.unwrap_aliases() {
            TypeDescriptor::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    /// The JSON schema of the type.
    ///
    /// # Errors
    ///
    /// Returns an [`UnsupportedTypeError`] for types without a JSON representation, such as
    /// grammars, automata or opaque types.
    pub fn json_schema(&self) -> Result<Value, UnsupportedTypeError> {
        if let TypeDescriptor::Struct(s) = self {
            return s.json_schema();
        }
        let mut defs = Map::new();
        let schema = type_schema(self, &mut defs)?;
        if defs.is_empty() {
            return Ok(schema);
        }
        let mut with_defs = Map::new();
        with_defs.insert("$defs".to_string(), Value::Object(defs));
        match schema {
            Value::Object(body) => with_defs.extend(body),
            other => {
                with_defs.insert("allOf".to_string(), Value::Array(vec![other]));
            }
        }
        Ok(Value::Object(with_defs))
    }
}

/// `snake_case` to `Title Case`.
fn title_case(name: &str) -> String {
    name.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn struct_body(s: &StructType, defs: &mut Map<String, Value>) -> Result<Map<String, Value>, UnsupportedTypeError> {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in s.fields.iter() {
        let schema = type_schema(&field.ty, defs)?;
        let mut property = Map::new();
        if let Some(default) = &field.default {
            property.insert("default".to_string(), default.clone());
        }
        match schema {
            // References stay bare so the target's own title applies.
            Value::Object(schema) if schema.contains_key("$ref") => property.extend(schema),
            Value::Object(schema) => {
                property.insert("title".to_string(), Value::String(title_case(&field.name)));
                property.extend(schema);
            }
            other => {
                property.insert("title".to_string(), Value::String(title_case(&field.name)));
                property.insert("allOf".to_string(), Value::Array(vec![other]));
            }
        }
        properties.insert(field.name.clone(), Value::Object(property));
        if field.default.is_none() {
            required.push(Value::String(field.name.clone()));
        }
    }
    let mut body = Map::new();
    body.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        body.insert("required".to_string(), Value::Array(required));
    }
    body.insert("title".to_string(), Value::String(s.name.clone()));
    body.insert("type".to_string(), Value::String("object".to_string()));
    Ok(body)
}

fn type_schema(ty: &TypeDescriptor, defs: &mut Map<String, Value>) -> Result<Value, UnsupportedTypeError> {
    Ok(match ty {
        TypeDescriptor::Primitive(p) => p.json_schema(),
        TypeDescriptor::None => json!({"type": "null"}),
        TypeDescriptor::Annotated { inner, description } => {
            let mut schema = type_schema(inner, defs)?;
            if let (Some(description), Value::Object(object)) = (description, &mut schema) {
                object.insert("description".to_string(), Value::String(description.clone()));
            }
            schema
        }
        TypeDescriptor::NewType { inner, .. } => type_schema(inner, defs)?,
        TypeDescriptor::List(item) => json!({"type": "array", "items": type_schema(item, defs)?}),
        TypeDescriptor::Tuple(items) => {
            let prefix = items
                .iter()
                .map(|item| type_schema(item, defs))
                .collect::<Result<Vec<_>, _>>()?;
            json!({
                "type": "array",
                "prefixItems": prefix,
                "minItems": items.len(),
                "maxItems": items.len()
            })
        }
        TypeDescriptor::Dict(key, value) => {
            if key.primitive() != Some(Primitive::Str) {
                return Err(UnsupportedTypeError::new(
                    ty,
                    "JSON object keys must be strings",
                ));
            }
            json!({"type": "object", "additionalProperties": type_schema(value, defs)?})
        }
        TypeDescriptor::Mapping => json!({"type": "object"}),
        TypeDescriptor::Union(types) => {
            let alternatives = types
                .iter()
                .map(|t| type_schema(t, defs))
                .collect::<Result<Vec<_>, _>>()?;
            json!({"anyOf": alternatives})
        }
        TypeDescriptor::Literal(values) => json!({"enum": values}),
        TypeDescriptor::Enum(e) => {
            let values: Vec<&Value> = e.members.iter().map(|(_, v)| v).collect();
            json!({"title": e.name, "enum": values})
        }
        TypeDescriptor::Struct(s) => {
            if !defs.contains_key(&s.name) {
                // Reserve the slot first so self references terminate.
                defs.insert(s.name.clone(), Value::Null);
                let body = struct_body(s, defs)?;
                defs.insert(s.name.clone(), Value::Object(body));
            }
            json!({"$ref": format!("#/$defs/{}", s.name)})
        }
        TypeDescriptor::Schema(source) => source.to_json_schema(),
        TypeDescriptor::JsonSchema(schema) => schema.clone(),
        TypeDescriptor::Regex(pattern) => json!({"type": "string", "pattern": pattern}),
        TypeDescriptor::Cfg(_) | TypeDescriptor::Automaton(_) | TypeDescriptor::Opaque(_) => {
            return Err(UnsupportedTypeError::new(
                ty,
                "it has no JSON schema representation",
            ))
        }
    })
}

/// The text of a literal choice: strings verbatim, anything else as compact JSON.
pub(crate) fn choice_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Classifies an output type.
///
/// Recognizers are tried in a fixed order: primitives, compiled automata, regex / grammar /
/// JSON schema terms, enums, literal sets, native records, schema producers, then containers.
///
/// # Errors
///
/// Returns an [`UnsupportedTypeError`] naming the type when no recognizer matches.
pub fn classify(ty: &TypeDescriptor) -> Result<OutputTypeSpec, UnsupportedTypeError> {
    if let Some(primitive) = ty.primitive() {
        return Ok(OutputTypeSpec::Primitive(primitive));
    }
    let unwrapped = ty.unwrap_aliases();
    match unwrapped {
        TypeDescriptor::Automaton(automaton) => Ok(OutputTypeSpec::Automaton(automaton.clone())),
        TypeDescriptor::Regex(pattern) => Ok(OutputTypeSpec::Regex(pattern.clone())),
        TypeDescriptor::Cfg(grammar) => Ok(OutputTypeSpec::Cfg(grammar.clone())),
        TypeDescriptor::JsonSchema(schema) => Ok(OutputTypeSpec::JsonSchema(schema.clone())),
        TypeDescriptor::Enum(e) => Ok(OutputTypeSpec::Enum(e.clone())),
        TypeDescriptor::Literal(values) => Ok(OutputTypeSpec::Choice(
            values.iter().map(choice_text).collect(),
        )),
        TypeDescriptor::Struct(s) => Ok(OutputTypeSpec::NativeStruct(s.clone())),
        TypeDescriptor::Schema(source) => Ok(OutputTypeSpec::JsonSchema(source.to_json_schema())),
        TypeDescriptor::List(_)
        | TypeDescriptor::Tuple(_)
        | TypeDescriptor::Dict(_, _)
        | TypeDescriptor::Mapping
        | TypeDescriptor::Union(_)
        | TypeDescriptor::None => Ok(OutputTypeSpec::JsonSchema(ty.json_schema()?)),
        TypeDescriptor::Opaque(_)
        | TypeDescriptor::Primitive(_)
        | TypeDescriptor::Annotated { .. }
        | TypeDescriptor::NewType { .. } => Err(UnsupportedTypeError::new(
            ty,
            "it matches no supported output type",
        )),
    }
}

/// Whether the type is `int`, possibly annotated or renamed.
pub fn is_int(ty: &TypeDescriptor) -> bool {
    ty.primitive() == Some(Primitive::Int)
}

/// Whether the type is `float`, possibly annotated or renamed.
pub fn is_float(ty: &TypeDescriptor) -> bool {
    ty.primitive() == Some(Primitive::Float)
}

/// Whether the type is `str`, possibly annotated or renamed.
pub fn is_str(ty: &TypeDescriptor) -> bool {
    ty.primitive() == Some(Primitive::Str)
}

/// Whether the type is `bool`, possibly annotated or renamed.
pub fn is_bool(ty: &TypeDescriptor) -> bool {
    ty.primitive() == Some(Primitive::Bool)
}

/// Whether the type is a date, possibly annotated or renamed.
pub fn is_date(ty: &TypeDescriptor) -> bool {
    ty.primitive() == Some(Primitive::Date)
}

/// Whether the type is a time of day, possibly annotated or renamed.
pub fn is_time(ty: &TypeDescriptor) -> bool {
    ty.primitive() == Some(Primitive::Time)
}

/// Whether the type is a date and time, possibly annotated or renamed.
pub fn is_datetime(ty: &TypeDescriptor) -> bool {
    ty.primitive() == Some(Primitive::DateTime)
}

/// Whether the type is the bare, unparameterized dictionary.
pub fn is_native_dict(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Mapping)
}

/// Whether the type is a dictionary with typed keys and values.
pub fn is_typing_dict(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Dict(_, _))
}

/// Whether the type is a list with a typed element.
pub fn is_typing_list(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::List(_))
}

/// Whether the type is a tuple with typed positions.
pub fn is_typing_tuple(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Tuple(_))
}

/// Whether the type is a union of alternatives.
pub fn is_union(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Union(_))
}

/// Whether the type is a fixed set of literal values.
pub fn is_literal(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Literal(_))
}

/// Whether the type is an enumeration.
pub fn is_enum(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Enum(_))
}

fn is_struct_of_kind(ty: &TypeDescriptor, kind: StructKind) -> bool {
    matches!(ty, TypeDescriptor::Struct(s) if s.kind == kind)
}

/// Whether the type is a record declared as a dataclass.
pub fn is_dataclass(ty: &TypeDescriptor) -> bool {
    is_struct_of_kind(ty, StructKind::Dataclass)
}

/// Whether the type is a record declared as a typed dictionary.
pub fn is_typed_dict(ty: &TypeDescriptor) -> bool {
    is_struct_of_kind(ty, StructKind::TypedDict)
}

/// Whether the type is a record declared as a validated model.
pub fn is_model(ty: &TypeDescriptor) -> bool {
    is_struct_of_kind(ty, StructKind::Model)
}

/// Whether the type exposes the [`ToJsonSchema`] capability.
pub fn is_schema_source(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Schema(_))
}

/// Whether the type is a prebuilt automaton.
pub fn is_automaton(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Automaton(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(kind: StructKind) -> StructType {
        StructType::new(
            "User",
            kind,
            vec![
                Field::new("user_id", TypeDescriptor::Primitive(Primitive::Int)),
                Field::new("name", TypeDescriptor::Primitive(Primitive::Str)),
            ],
        )
    }

    fn annotated(p: Primitive) -> TypeDescriptor {
        TypeDescriptor::Annotated {
            inner: Box::new(TypeDescriptor::Primitive(p)),
            description: Some("some metadata".to_string()),
        }
    }

    fn new_type(p: Primitive) -> TypeDescriptor {
        TypeDescriptor::NewType {
            name: "UserId".to_string(),
            inner: Box::new(TypeDescriptor::Primitive(p)),
        }
    }

    #[test]
    fn primitive_predicates_see_through_wrappers() {
        let int = TypeDescriptor::Primitive(Primitive::Int);
        assert!(is_int(&int));
        assert!(!is_int(&TypeDescriptor::Primitive(Primitive::Float)));
        assert!(!is_int(&TypeDescriptor::List(Box::new(int.clone()))));
        assert!(!is_int(&TypeDescriptor::Dict(Box::new(int.clone()), Box::new(int.clone()))));
        assert!(is_int(&annotated(Primitive::Int)));
        assert!(!is_int(&annotated(Primitive::Str)));
        assert!(is_int(&new_type(Primitive::Int)));
        assert!(!is_int(&new_type(Primitive::Str)));
        assert!(is_str(&new_type(Primitive::Str)));
        assert!(is_bool(&annotated(Primitive::Bool)));
        assert!(is_float(&new_type(Primitive::Float)));
        assert!(is_datetime(&TypeDescriptor::Primitive(Primitive::DateTime)));
        assert!(!is_date(&TypeDescriptor::Primitive(Primitive::DateTime)));
        assert!(!is_time(&TypeDescriptor::Primitive(Primitive::Date)));
    }

    #[test]
    fn container_predicates() {
        let int = || Box::new(TypeDescriptor::Primitive(Primitive::Int));
        assert!(is_native_dict(&TypeDescriptor::Mapping));
        assert!(!is_native_dict(&TypeDescriptor::Dict(int(), int())));
        assert!(is_typing_dict(&TypeDescriptor::Dict(int(), int())));
        assert!(!is_typing_dict(&TypeDescriptor::Mapping));
        assert!(is_typing_list(&TypeDescriptor::List(int())));
        assert!(is_typing_tuple(&TypeDescriptor::Tuple(vec![*int()])));
        assert!(is_union(&TypeDescriptor::Union(vec![*int(), TypeDescriptor::None])));
        let literal = TypeDescriptor::Literal(vec![Value::from("a"), Value::from("b")]);
        assert!(is_literal(&literal));
        assert!(!is_union(&literal));
        assert!(!is_enum(&literal));
    }

    #[test]
    fn struct_kinds_are_distinct() {
        let dataclass = TypeDescriptor::Struct(user(StructKind::Dataclass));
        let typed_dict = TypeDescriptor::Struct(user(StructKind::TypedDict));
        let model = TypeDescriptor::Struct(user(StructKind::Model));
        assert!(is_dataclass(&dataclass) && !is_dataclass(&typed_dict) && !is_dataclass(&model));
        assert!(is_typed_dict(&typed_dict) && !is_typed_dict(&model));
        assert!(is_model(&model) && !is_model(&TypeDescriptor::Mapping));
    }

    #[test]
    fn struct_schema_layout() {
        let expected = json!({
            "properties": {
                "user_id": {"title": "User Id", "type": "integer"},
                "name": {"title": "Name", "type": "string"}
            },
            "required": ["user_id", "name"],
            "title": "User",
            "type": "object"
        });
        for kind in [StructKind::Dataclass, StructKind::TypedDict, StructKind::Model] {
            let schema = user(kind).json_schema().unwrap();
            assert_eq!(schema, expected);
            assert_eq!(schema.to_string(), expected.to_string());
        }
    }

    #[test]
    fn nested_structs_use_defs() {
        let address = StructType::new(
            "Address",
            StructKind::Model,
            vec![Field::new("city", TypeDescriptor::Primitive(Primitive::Str))],
        );
        let person = StructType::new(
            "Person",
            StructKind::Model,
            vec![
                Field::new("home", TypeDescriptor::Struct(address)),
                Field::with_default("age", TypeDescriptor::Primitive(Primitive::Int), json!(0)),
            ],
        );
        let schema = person.json_schema().unwrap();
        assert_eq!(schema["$defs"]["Address"]["title"], "Address");
        assert_eq!(schema["properties"]["home"], json!({"$ref": "#/$defs/Address"}));
        assert_eq!(schema["properties"]["age"]["default"], 0);
        assert_eq!(schema["required"], json!(["home"]));
    }

    #[test]
    fn classification_priority() {
        let list = TypeDescriptor::List(Box::new(TypeDescriptor::Primitive(Primitive::Int)));
        assert_eq!(
            classify(&list).unwrap(),
            OutputTypeSpec::JsonSchema(json!({"type": "array", "items": {"type": "integer"}}))
        );
        assert_eq!(
            classify(&annotated(Primitive::Int)).unwrap(),
            OutputTypeSpec::Primitive(Primitive::Int)
        );
        let literal = TypeDescriptor::Literal(vec![json!("Foo"), json!("Bar"), json!(3)]);
        assert_eq!(
            classify(&literal).unwrap(),
            OutputTypeSpec::Choice(vec!["Foo".to_string(), "Bar".to_string(), "3".to_string()])
        );
        let colors = EnumType::from_names("Color", ["red", "green"]);
        assert_eq!(
            classify(&TypeDescriptor::Enum(colors.clone())).unwrap(),
            OutputTypeSpec::Enum(colors)
        );
        assert!(matches!(
            classify(&TypeDescriptor::Struct(user(StructKind::Model))).unwrap(),
            OutputTypeSpec::NativeStruct(_)
        ));
        assert_eq!(
            classify(&TypeDescriptor::Regex("[0-9]".to_string())).unwrap(),
            OutputTypeSpec::Regex("[0-9]".to_string())
        );
    }

    #[test]
    fn schema_capability_is_duck_typed() {
        #[derive(Debug)]
        struct Fixed;
        impl ToJsonSchema for Fixed {
            fn to_json_schema(&self) -> Value {
                json!({"type": "boolean"})
            }
        }
        let ty = TypeDescriptor::Schema(Arc::new(Fixed));
        assert!(is_schema_source(&ty));
        assert_eq!(
            classify(&ty).unwrap(),
            OutputTypeSpec::JsonSchema(json!({"type": "boolean"}))
        );
    }

    #[test]
    fn unsupported_types_are_named() {
        let err = classify(&TypeDescriptor::Opaque("socket".to_string())).unwrap_err();
        assert_eq!(err.type_name, "socket");
        let dict = TypeDescriptor::Dict(
            Box::new(TypeDescriptor::Primitive(Primitive::Int)),
            Box::new(TypeDescriptor::Primitive(Primitive::Str)),
        );
        let err = classify(&dict).unwrap_err();
        assert_eq!(err.type_name, "Dict[int, str]");
        let list_of_grammars = TypeDescriptor::List(Box::new(TypeDescriptor::Cfg(String::new())));
        assert_eq!(classify(&list_of_grammars).unwrap_err().type_name, "CFG");
    }

    #[test]
    fn primitive_names() {
        assert_eq!(Primitive::Int.to_string(), "int");
        assert_eq!(Primitive::DateTime.to_string(), "datetime");
        assert_eq!("str".parse::<Primitive>().unwrap(), Primitive::Str);
    }
}
