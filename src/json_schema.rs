//! JSON Schema to regular expression compilation.
//!
//! The produced pattern accepts the compact serializations of the instances of a schema, with the
//! configured whitespace pattern allowed between tokens. Object properties keep the order in which
//! the schema declares them.
use ahash::AHashMap;
use serde_json::{Map, Value};

use crate::config::JsonSchemaConfig;
use crate::pattern::CompilePatternError;

/// A JSON string.
pub const STRING: &str = r#""(?:[^"\\\x00-\x1F\x7F-\x9F]|\\["\\/bfnrt]|\\u[0-9a-fA-F]{4})*""#;
/// A single character inside a JSON string.
pub const STRING_INNER: &str = r#"(?:[^"\\\x00-\x1F\x7F-\x9F]|\\["\\/bfnrt]|\\u[0-9a-fA-F]{4})"#;
/// A JSON integer.
pub const INTEGER: &str = r"-?(?:0|[1-9][0-9]*)";
/// A JSON number.
pub const NUMBER: &str = r"-?(?:0|[1-9][0-9]*)(?:\.[0-9]+)?(?:[eE][+-]?[0-9]+)?";
/// A JSON number that is not negative.
pub const NON_NEGATIVE_NUMBER: &str = r"(?:0|[1-9][0-9]*)(?:\.[0-9]+)?(?:[eE][+-]?[0-9]+)?";
/// A JSON boolean.
pub const BOOLEAN: &str = r"(?:true|false)";
/// The JSON null.
pub const NULL: &str = r"null";

const DATE_TIME: &str = r#""(?:-?(?:[1-9][0-9]*)?[0-9]{4})-(?:1[0-2]|0[1-9])-(?:3[01]|0[1-9]|[12][0-9])T(?:2[0-3]|[01][0-9]):(?:[0-5][0-9]):(?:[0-5][0-9])(?:\.[0-9]{3})?(?:Z)?""#;
const DATE: &str = r#""(?:[0-9]{4})-(?:0[1-9]|1[0-2])-(?:0[1-9]|[1-2][0-9]|3[0-1])""#;
const TIME: &str = r#""(?:2[0-3]|[01][0-9]):(?:[0-5][0-9]):(?:[0-5][0-9])(?:\.[0-9]+)?(?:Z)?""#;
const UUID: &str = r#""[a-fA-F0-9]{8}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{12}""#;

/// Parses `schema` as JSON and compiles it with [`schema_to_regex`].
pub fn schema_str_to_regex(
    schema: &str,
    config: &JsonSchemaConfig,
) -> Result<String, CompilePatternError> {
    let value: Value = serde_json::from_str(schema)
        .map_err(|e| CompilePatternError::InvalidSchema(e.to_string()))?;
    schema_to_regex(&value, config)
}

/// Compiles a JSON schema into a regular expression.
///
/// A `$ref` may be expanded inside itself at most [`JsonSchemaConfig::max_recursion_depth`]
/// times. Past that limit, branches an instance may leave out are dropped from the pattern:
/// optional properties, the items of arrays that may be empty and `anyOf` alternatives.
///
/// # Errors
///
/// Returns [`CompilePatternError::SchemaTooComplex`] when a required branch recurses past the
/// limit, [`CompilePatternError::InvalidSchema`] for malformed schemas and
/// [`CompilePatternError::UnsupportedSchema`] for keywords that cannot be expressed.
pub fn schema_to_regex(
    schema: &Value,
    config: &JsonSchemaConfig,
) -> Result<String, CompilePatternError> {
    let mut compiler = SchemaCompiler {
        root: schema,
        whitespace: config.whitespace(),
        config,
        expanding: AHashMap::default(),
    };
    compiler.compile(schema)
}

struct SchemaCompiler<'a> {
    root: &'a Value,
    whitespace: &'a str,
    config: &'a JsonSchemaConfig,
    expanding: AHashMap<String, usize>,
}

impl<'a> SchemaCompiler<'a> {
    fn compile(&mut self, schema: &'a Value) -> Result<String, CompilePatternError> {
        let object = match schema {
            Value::Bool(true) => return Ok(self.any_value(self.config.any_value_depth)),
            Value::Bool(false) => {
                return Err(CompilePatternError::InvalidSchema(
                    "the `false` schema accepts no instance".to_string(),
                ))
            }
            Value::Object(object) => object,
            other => {
                return Err(CompilePatternError::InvalidSchema(format!(
                    "expected an object or a boolean, found `{other}`"
                )))
            }
        };
        if let Some(reference) = object.get("$ref") {
            return self.compile_ref(reference);
        }
        if let Some(values) = object.get("enum") {
            let values = values.as_array().ok_or_else(|| {
                CompilePatternError::InvalidSchema("`enum` must be an array".to_string())
            })?;
            if values.is_empty() {
                return Err(CompilePatternError::InvalidSchema(
                    "`enum` must not be empty".to_string(),
                ));
            }
            let choices: Vec<String> = values.iter().map(literal).collect();
            return Ok(group(&choices));
        }
        if let Some(value) = object.get("const") {
            return Ok(literal(value));
        }
        for keyword in ["anyOf", "oneOf"] {
            if let Some(subschemas) = object.get(keyword) {
                let subschemas = subschemas.as_array().ok_or_else(|| {
                    CompilePatternError::InvalidSchema(format!("`{keyword}` must be an array"))
                })?;
                // A branch that recurses too deeply is dropped unless it is the only way out.
                let mut alternatives = Vec::with_capacity(subschemas.len());
                let mut too_complex = None;
                for subschema in subschemas {
                    match self.compile(subschema) {
                        Ok(alternative) => alternatives.push(alternative),
                        Err(e @ CompilePatternError::SchemaTooComplex { .. }) => {
                            too_complex = Some(e)
                        }
                        Err(e) => return Err(e),
                    }
                }
                return match too_complex {
                    Some(e) if alternatives.is_empty() => Err(e),
                    _ => Ok(group(&alternatives)),
                };
            }
        }
        if let Some(subschemas) = object.get("allOf") {
            return match subschemas.as_array().map(Vec::as_slice) {
                Some([single]) => self.compile(single),
                _ => Err(CompilePatternError::UnsupportedSchema(
                    "`allOf` with more than one subschema".to_string(),
                )),
            };
        }
        match object.get("type") {
            Some(Value::String(name)) => self.compile_type(name, object),
            Some(Value::Array(names)) => {
                let alternatives = names
                    .iter()
                    .map(|name| match name {
                        Value::String(name) => self.compile_type(name, object),
                        other => Err(CompilePatternError::InvalidSchema(format!(
                            "`{other}` is not a type name"
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(group(&alternatives))
            }
            Some(other) => Err(CompilePatternError::InvalidSchema(format!(
                "`{other}` is not a type name"
            ))),
            None if object.contains_key("properties") => self.compile_object(object),
            None if object.contains_key("items") || object.contains_key("prefixItems") => {
                self.compile_array(object)
            }
            None => Ok(self.any_value(self.config.any_value_depth)),
        }
    }

    fn compile_ref(&mut self, reference: &Value) -> Result<String, CompilePatternError> {
        let reference = reference.as_str().ok_or_else(|| {
            CompilePatternError::InvalidSchema("`$ref` must be a string".to_string())
        })?;
        let target = match reference {
            "#" => Some(self.root),
            _ => reference
                .strip_prefix('#')
                .and_then(|pointer| self.root.pointer(pointer)),
        }
        .ok_or_else(|| {
            CompilePatternError::InvalidSchema(format!("cannot resolve `$ref` `{reference}`"))
        })?;
        let max_depth = self.config.max_recursion_depth;
        let depth = self.expanding.entry(reference.to_string()).or_insert(0);
        if *depth >= max_depth {
            return Err(CompilePatternError::SchemaTooComplex {
                reference: reference.to_string(),
                max_depth,
            });
        }
        *depth += 1;
        let result = self.compile(target);
        if let Some(depth) = self.expanding.get_mut(reference) {
            *depth -= 1;
        }
        result
    }

    /// Compiles a subschema an instance may leave out, or `None` when it recurses too deeply.
    fn compile_optional(
        &mut self,
        schema: &'a Value,
    ) -> Result<Option<String>, CompilePatternError> {
        match self.compile(schema) {
            Ok(pattern) => Ok(Some(pattern)),
            Err(CompilePatternError::SchemaTooComplex { reference, .. }) => {
                log::debug!("Dropped an optional branch recursing through `{reference}`.");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn compile_type(
        &mut self,
        name: &str,
        object: &'a Map<String, Value>,
    ) -> Result<String, CompilePatternError> {
        match name {
            "string" => self.compile_string(object),
            "integer" => compile_integer(object),
            "number" => Ok(compile_number(object)),
            "boolean" => Ok(BOOLEAN.to_string()),
            "null" => Ok(NULL.to_string()),
            "array" => self.compile_array(object),
            "object" => self.compile_object(object),
            other => Err(CompilePatternError::UnsupportedSchema(format!(
                "unknown type `{other}`"
            ))),
        }
    }

    fn compile_string(
        &mut self,
        object: &Map<String, Value>,
    ) -> Result<String, CompilePatternError> {
        if let Some(pattern) = object.get("pattern") {
            let pattern = pattern.as_str().ok_or_else(|| {
                CompilePatternError::InvalidSchema("`pattern` must be a string".to_string())
            })?;
            let inner = pattern.strip_prefix('^').unwrap_or(pattern);
            let inner = inner.strip_suffix('$').unwrap_or(inner);
            return Ok(format!(r#""(?:{inner})""#));
        }
        if let Some(format) = object.get("format").and_then(Value::as_str) {
            return match format {
                "date-time" => Ok(DATE_TIME.to_string()),
                "date" => Ok(DATE.to_string()),
                "time" => Ok(TIME.to_string()),
                "uuid" => Ok(UUID.to_string()),
                other => Err(CompilePatternError::UnsupportedSchema(format!(
                    "string format `{other}`"
                ))),
            };
        }
        let min_length = usize_keyword(object, "minLength")?;
        let max_length = usize_keyword(object, "maxLength")?;
        check_bounds(min_length.unwrap_or(0), max_length, "minLength", "maxLength")?;
        Ok(match (min_length, max_length) {
            (None, None) => STRING.to_string(),
            (min, max) => format!(
                r#""{STRING_INNER}{}""#,
                quantifier(min.unwrap_or(0), max)
            ),
        })
    }

    fn compile_array(&mut self, object: &'a Map<String, Value>) -> Result<String, CompilePatternError> {
        let ws = self.whitespace;
        if let Some(prefix) = object.get("prefixItems") {
            let prefix = prefix.as_array().ok_or_else(|| {
                CompilePatternError::InvalidSchema("`prefixItems` must be an array".to_string())
            })?;
            let items = prefix
                .iter()
                .map(|s| self.compile(s))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(format!(
                r"\[{ws}{}{ws}\]",
                items.join(&format!("{ws},{ws}"))
            ));
        }
        let min_items = usize_keyword(object, "minItems")?.unwrap_or(0);
        let max_items = usize_keyword(object, "maxItems")?;
        check_bounds(min_items, max_items, "minItems", "maxItems")?;
        let item = match object.get("items") {
            Some(items) if min_items == 0 => match self.compile_optional(items)? {
                Some(item) => item,
                None => return Ok(format!(r"\[{ws}\]")),
            },
            Some(items) => self.compile(items)?,
            None => self.any_value(self.config.any_value_depth.saturating_sub(1)),
        };
        Ok(repeated_in_brackets(
            &item,
            (r"\[", r"\]"),
            ws,
            min_items,
            max_items,
        ))
    }

    fn compile_object(&mut self, object: &'a Map<String, Value>) -> Result<String, CompilePatternError> {
        let ws = self.whitespace;
        let properties = match object.get("properties") {
            Some(Value::Object(properties)) if !properties.is_empty() => properties,
            Some(Value::Object(_)) | None => return self.compile_free_form_object(object),
            Some(_) => {
                return Err(CompilePatternError::InvalidSchema(
                    "`properties` must be an object".to_string(),
                ))
            }
        };
        let required: Vec<&str> = object
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let mut subpatterns = Vec::with_capacity(properties.len());
        let mut is_required = Vec::with_capacity(properties.len());
        for (name, schema) in properties.iter() {
            let required = required.contains(&name.as_str());
            let value = if required {
                self.compile(schema)?
            } else {
                match self.compile_optional(schema)? {
                    Some(value) => value,
                    None => continue,
                }
            };
            let key = literal(&Value::String(name.clone()));
            subpatterns.push(format!("{ws}{key}{ws}:{ws}{value}"));
            is_required.push(required);
        }
        let mut pattern = String::from(r"\{");
        match is_required.iter().rposition(|&r| r) {
            Some(last_required) => {
                for (i, subpattern) in subpatterns.iter().enumerate() {
                    let subpattern = if i < last_required {
                        format!("{subpattern}{ws},")
                    } else if i > last_required {
                        format!("{ws},{subpattern}")
                    } else {
                        subpattern.clone()
                    };
                    if is_required[i] {
                        pattern.push_str(&subpattern);
                    } else {
                        pattern.push_str(&format!("(?:{subpattern})?"));
                    }
                }
            }
            None => {
                // The first property present decides where commas go.
                let alternatives: Vec<String> = (0..subpatterns.len())
                    .map(|i| {
                        let mut alternative = String::new();
                        for before in &subpatterns[..i] {
                            alternative.push_str(&format!("(?:{before}{ws},)?"));
                        }
                        alternative.push_str(&subpatterns[i]);
                        for after in &subpatterns[i + 1..] {
                            alternative.push_str(&format!("(?:{ws},{after})?"));
                        }
                        alternative
                    })
                    .collect();
                pattern.push_str(&format!("(?:{})?", alternatives.join("|")));
            }
        }
        pattern.push_str(&format!(r"{ws}\}}"));
        Ok(pattern)
    }

    fn compile_free_form_object(
        &mut self,
        object: &'a Map<String, Value>,
    ) -> Result<String, CompilePatternError> {
        let ws = self.whitespace;
        let empty = format!(r"\{{{ws}\}}");
        let min_properties = usize_keyword(object, "minProperties")?.unwrap_or(0);
        let max_properties = usize_keyword(object, "maxProperties")?;
        let value = match object.get("additionalProperties") {
            Some(Value::Bool(false)) => return Ok(empty),
            None | Some(Value::Bool(true)) => {
                self.any_value(self.config.any_value_depth.saturating_sub(1))
            }
            Some(schema) if min_properties == 0 => match self.compile_optional(schema)? {
                Some(value) => value,
                None => return Ok(empty),
            },
            Some(schema) => self.compile(schema)?,
        };
        check_bounds(min_properties, max_properties, "minProperties", "maxProperties")?;
        let entry = format!("{STRING}{ws}:{ws}{value}");
        Ok(repeated_in_brackets(
            &entry,
            (r"\{", r"\}"),
            ws,
            min_properties,
            max_properties,
        ))
    }

    /// Any JSON value whose arrays and objects nest at most `depth` levels.
    fn any_value(&self, depth: usize) -> String {
        let ws = self.whitespace;
        let mut alternatives = vec![
            STRING.to_string(),
            NUMBER.to_string(),
            BOOLEAN.to_string(),
            NULL.to_string(),
        ];
        if depth > 0 {
            let inner = self.any_value(depth - 1);
            alternatives.push(repeated_in_brackets(&inner, (r"\[", r"\]"), ws, 0, None));
            let entry = format!("{STRING}{ws}:{ws}{inner}");
            alternatives.push(repeated_in_brackets(&entry, (r"\{", r"\}"), ws, 0, None));
        }
        group(&alternatives)
    }
}

/// `open element (, element)* close` with the number of elements bounded.
fn repeated_in_brackets(
    element: &str,
    (open, close): (&str, &str),
    ws: &str,
    min: usize,
    max: Option<usize>,
) -> String {
    if max == Some(0) {
        return format!("{open}{ws}{close}");
    }
    let more = quantifier(min.saturating_sub(1), max.map(|max| max - 1));
    let body = format!("{element}(?:{ws},{ws}{element}){more}");
    if min == 0 {
        format!("{open}{ws}(?:{body})?{ws}{close}")
    } else {
        format!("{open}{ws}{body}{ws}{close}")
    }
}

fn quantifier(min: usize, max: Option<usize>) -> String {
    match (min, max) {
        (0, None) => "*".to_string(),
        (1, None) => "+".to_string(),
        (min, None) => format!("{{{min},}}"),
        (min, Some(max)) if min == max => format!("{{{min}}}"),
        (min, Some(max)) => format!("{{{min},{max}}}"),
    }
}

fn group(alternatives: &[String]) -> String {
    match alternatives {
        [single] => single.clone(),
        _ => format!("(?:{})", alternatives.join("|")),
    }
}

/// The compact JSON serialization of `value`, escaped.
fn literal(value: &Value) -> String {
    regex_syntax::escape(&value.to_string())
}

fn usize_keyword(
    object: &Map<String, Value>,
    keyword: &str,
) -> Result<Option<usize>, CompilePatternError> {
    object
        .get(keyword)
        .map(|v| {
            v.as_u64().map(|v| v as usize).ok_or_else(|| {
                CompilePatternError::InvalidSchema(format!(
                    "`{keyword}` must be a non-negative integer"
                ))
            })
        })
        .transpose()
}

fn check_bounds(
    min: usize,
    max: Option<usize>,
    min_keyword: &str,
    max_keyword: &str,
) -> Result<(), CompilePatternError> {
    match max {
        Some(max) if max < min => Err(CompilePatternError::InvalidSchema(format!(
            "`{min_keyword}` ({min}) is greater than `{max_keyword}` ({max})"
        ))),
        _ => Ok(()),
    }
}

/// The inclusive integer bounds implied by `minimum`, `maximum` and their exclusive forms.
fn integer_bounds(
    object: &Map<String, Value>,
) -> Result<(Option<i128>, Option<i128>), CompilePatternError> {
    fn bound(value: &Value, keyword: &str) -> Result<f64, CompilePatternError> {
        value.as_f64().ok_or_else(|| {
            CompilePatternError::InvalidSchema(format!("`{keyword}` must be a number"))
        })
    }
    let mut lower: Option<i128> = None;
    let mut upper: Option<i128> = None;
    if let Some(v) = object.get("minimum") {
        lower = Some(v.as_i64().map_or_else(|| bound(v, "minimum").map(|f| f.ceil() as i128), |i| Ok(i as i128))?);
    }
    if let Some(v) = object.get("exclusiveMinimum") {
        let exclusive = v.as_i64().map_or_else(
            || bound(v, "exclusiveMinimum").map(|f| f.floor() as i128 + 1),
            |i| Ok(i as i128 + 1),
        )?;
        lower = Some(lower.map_or(exclusive, |l| l.max(exclusive)));
    }
    if let Some(v) = object.get("maximum") {
        upper = Some(v.as_i64().map_or_else(|| bound(v, "maximum").map(|f| f.floor() as i128), |i| Ok(i as i128))?);
    }
    if let Some(v) = object.get("exclusiveMaximum") {
        let exclusive = v.as_i64().map_or_else(
            || bound(v, "exclusiveMaximum").map(|f| f.ceil() as i128 - 1),
            |i| Ok(i as i128 - 1),
        )?;
        upper = Some(upper.map_or(exclusive, |u| u.min(exclusive)));
    }
    Ok((lower, upper))
}

fn compile_integer(object: &Map<String, Value>) -> Result<String, CompilePatternError> {
    let (lower, upper) = integer_bounds(object)?;
    if let (Some(lower), Some(upper)) = (lower, upper) {
        if lower > upper {
            return Err(CompilePatternError::InvalidSchema(format!(
                "no integer lies between {lower} and {upper}"
            )));
        }
    }
    Ok(integer_range(lower, upper))
}

fn compile_number(object: &Map<String, Value>) -> String {
    let non_negative = ["minimum", "exclusiveMinimum"]
        .iter()
        .filter_map(|keyword| object.get(*keyword).and_then(Value::as_f64))
        .any(|bound| bound >= 0.0);
    if non_negative {
        NON_NEGATIVE_NUMBER.to_string()
    } else {
        NUMBER.to_string()
    }
}

/// Integers in `lower..=upper`, either side unbounded when `None`.
pub(crate) fn integer_range(lower: Option<i128>, upper: Option<i128>) -> String {
    if lower.is_none() && upper.is_none() {
        return INTEGER.to_string();
    }
    let mut alternatives = Vec::new();
    // Negative integers, written as `-` followed by their magnitude.
    if lower.map_or(true, |l| l < 0) {
        let smallest_magnitude = upper.map_or(1, |u| if u < 0 { -u } else { 1 });
        let largest_magnitude = lower.map(|l| -l as u128);
        alternatives.push(format!(
            "-{}",
            magnitude_range(smallest_magnitude as u128, largest_magnitude)
        ));
    }
    if upper.map_or(true, |u| u >= 0) {
        let smallest = lower.map_or(0, |l| l.max(0));
        alternatives.push(magnitude_range(smallest as u128, upper.map(|u| u as u128)));
    }
    group(&alternatives)
}

fn magnitude_range(lower: u128, upper: Option<u128>) -> String {
    match upper {
        Some(upper) => bounded_range(lower, upper),
        None => {
            let digits = digit_count(lower);
            let same_length = bounded_range(lower, 10u128.pow(digits) - 1);
            let longer = format!("[1-9][0-9]{{{digits},}}");
            group(&[same_length, longer])
        }
    }
}

fn digit_count(n: u128) -> u32 {
    n.checked_ilog10().map_or(1, |log| log + 1)
}

fn bounded_range(lower: u128, upper: u128) -> String {
    let mut alternatives = Vec::new();
    for digits in digit_count(lower)..=digit_count(upper) {
        let floor = if digits == 1 { 0 } else { 10u128.pow(digits - 1) };
        let ceiling = 10u128.pow(digits) - 1;
        let from = lower.max(floor);
        let to = upper.min(ceiling);
        alternatives.push(same_length_range(
            from.to_string().as_bytes(),
            to.to_string().as_bytes(),
        ));
    }
    group(&alternatives)
}

/// Decimal strings of equal length between `lower` and `upper`, digit by digit.
fn same_length_range(lower: &[u8], upper: &[u8]) -> String {
    let (first_low, first_high) = (lower[0], upper[0]);
    if lower.len() == 1 {
        return digit_class(first_low, first_high);
    }
    let (rest_low, rest_high) = (&lower[1..], &upper[1..]);
    if first_low == first_high {
        return format!("{}{}", first_low as char, same_length_range(rest_low, rest_high));
    }
    let remaining = rest_low.len();
    let mut alternatives = Vec::new();
    let mut middle_low = first_low + 1;
    let mut middle_high = first_high - 1;
    if rest_low.iter().all(|&d| d == b'0') {
        middle_low = first_low;
    } else {
        let nines = vec![b'9'; remaining];
        alternatives.push(format!(
            "{}{}",
            first_low as char,
            same_length_range(rest_low, &nines)
        ));
    }
    let upper_alternative = if rest_high.iter().all(|&d| d == b'9') {
        middle_high = first_high;
        None
    } else {
        let zeros = vec![b'0'; remaining];
        Some(format!(
            "{}{}",
            first_high as char,
            same_length_range(&zeros, rest_high)
        ))
    };
    if middle_low <= middle_high {
        alternatives.push(format!(
            "{}[0-9]{}",
            digit_class(middle_low, middle_high),
            quantifier(remaining, Some(remaining))
        ));
    }
    alternatives.extend(upper_alternative);
    group(&alternatives)
}

fn digit_class(low: u8, high: u8) -> String {
    if low == high {
        (low as char).to_string()
    } else {
        format!("[{}-{}]", low as char, high as char)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::automaton::Automaton;
    use crate::config::RegexConfig;

    fn compile(schema: Value) -> String {
        schema_to_regex(&schema, &JsonSchemaConfig::default()).unwrap()
    }

    fn automaton(schema: Value) -> Automaton {
        Automaton::new(&compile(schema), &RegexConfig::default()).unwrap()
    }

    #[test]
    fn age_object() {
        let schema = json!({
            "type": "object",
            "properties": {"age": {"type": "integer"}},
            "required": ["age"]
        });
        insta::assert_snapshot!(compile(schema.clone()), @r#"\{[ ]?"age"[ ]?:[ ]?-?(?:0|[1-9][0-9]*)[ ]?\}"#);
        let automaton = automaton(schema);
        assert!(automaton.accepts(br#"{"age":42}"#));
        assert!(automaton.accepts(br#"{ "age" : -3 }"#));
        assert!(!automaton.accepts(br#"{"age":4.2}"#));
        assert!(!automaton.accepts(br#"{"age":1,"name":"x"}"#));
        assert!(!automaton.accepts(br#"{}"#));
    }

    #[test]
    fn optional_properties_place_commas_correctly() {
        let automaton = automaton(json!({
            "type": "object",
            "properties": {
                "a": {"type": "boolean"},
                "b": {"type": "null"},
                "c": {"type": "boolean"}
            },
            "required": ["b"]
        }));
        for accepted in [
            r#"{"b":null}"#,
            r#"{"a":true,"b":null}"#,
            r#"{"b":null,"c":false}"#,
            r#"{"a":true,"b":null,"c":false}"#,
        ] {
            assert!(automaton.accepts(accepted.as_bytes()), "{accepted}");
        }
        for rejected in [r#"{"a":true}"#, r#"{,"b":null}"#, r#"{"b":null,}"#] {
            assert!(!automaton.accepts(rejected.as_bytes()), "{rejected}");
        }
    }

    #[test]
    fn all_optional_properties() {
        let automaton = automaton(json!({
            "type": "object",
            "properties": {"x": {"type": "integer"}, "y": {"type": "integer"}}
        }));
        for accepted in [r#"{}"#, r#"{"x":1}"#, r#"{"y":2}"#, r#"{"x":1,"y":2}"#] {
            assert!(automaton.accepts(accepted.as_bytes()), "{accepted}");
        }
        assert!(!automaton.accepts(br#"{"y":2,"x":1}"#));
        assert!(!automaton.accepts(br#"{,}"#));
    }

    #[test]
    fn accepted_instances_parse_and_validate() {
        let automaton = automaton(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "maxLength": 3},
                "tags": {"type": "array", "items": {"enum": ["x", "y"]}, "minItems": 1, "maxItems": 2}
            },
            "required": ["name", "tags"]
        }));
        let text = r#"{"name":"bob","tags":["y","x"]}"#;
        assert!(automaton.accepts(text.as_bytes()));
        let parsed: Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed["tags"].as_array().unwrap().len(), 2);
        assert!(!automaton.accepts(br#"{"name":"bobby","tags":["x"]}"#));
        assert!(!automaton.accepts(br#"{"name":"bo","tags":[]}"#));
        assert!(!automaton.accepts(br#"{"name":"bo","tags":["x","y","x"]}"#));
        assert!(!automaton.accepts(br#"{"name":"bo","tags":["z"]}"#));
    }

    #[test]
    fn string_escapes_and_formats() {
        let strings = automaton(json!({"type": "string"}));
        assert!(strings.accepts(r#""a\"b\\cé""#.as_bytes()));
        assert!(!strings.accepts(b"\"a\nb\""));
        let uuid = automaton(json!({"type": "string", "format": "uuid"}));
        assert!(uuid.accepts(br#""123e4567-e89b-12d3-a456-426614174000""#));
        let date = automaton(json!({"type": "string", "format": "date"}));
        assert!(date.accepts(br#""2024-01-31""#));
        assert!(!date.accepts(br#""2024-01-32""#));
        let pattern = automaton(json!({"type": "string", "pattern": "^[a-z]+$"}));
        assert!(pattern.accepts(br#""abc""#));
        assert!(!pattern.accepts(br#""ABC""#));
    }

    #[test]
    fn integer_ranges() {
        let check = |schema: Value, range: std::ops::RangeInclusive<i64>| {
            let automaton = automaton(schema);
            for n in -1200..=1200 {
                assert_eq!(
                    automaton.accepts(n.to_string().as_bytes()),
                    range.contains(&n),
                    "{n}"
                );
            }
        };
        check(json!({"type": "integer", "minimum": 7, "maximum": 1042}), 7..=1042);
        check(json!({"type": "integer", "minimum": -305, "maximum": 19}), -305..=19);
        check(json!({"type": "integer", "minimum": -99, "maximum": -10}), -99..=-10);
        check(
            json!({"type": "integer", "exclusiveMinimum": 0, "exclusiveMaximum": 100}),
            1..=99,
        );
        check(json!({"type": "integer", "minimum": 35}), 35..=i64::MAX);
        check(json!({"type": "integer", "maximum": -4}), i64::MIN..=-4);
        check(json!({"type": "integer", "minimum": -12}), -12..=i64::MAX);
    }

    #[test]
    fn non_negative_numbers() {
        let automaton = automaton(json!({"type": "number", "minimum": 0}));
        assert!(automaton.accepts(b"0.5"));
        assert!(!automaton.accepts(b"-0.5"));
    }

    #[test]
    fn unions_type_lists_and_constants() {
        let automaton = automaton(json!({
            "anyOf": [{"type": "integer"}, {"type": ["string", "null"]}, {"const": {"k": [1, 2]}}]
        }));
        for accepted in ["12", r#""s""#, "null", r#"{"k":[1,2]}"#] {
            assert!(automaton.accepts(accepted.as_bytes()), "{accepted}");
        }
        assert!(!automaton.accepts(b"true"));
    }

    #[test]
    fn references_and_recursion_limit() {
        let schema = json!({
            "$defs": {"point": {"type": "object", "properties": {"x": {"type": "integer"}}, "required": ["x"]}},
            "type": "array",
            "items": {"$ref": "#/$defs/point"}
        });
        assert!(automaton(schema).accepts(br#"[{"x":1},{"x":2}]"#));

        let required_child = json!({
            "type": "object",
            "properties": {"child": {"$ref": "#"}},
            "required": ["child"]
        });
        let result = schema_to_regex(&required_child, &JsonSchemaConfig::default());
        assert!(matches!(
            result,
            Err(CompilePatternError::SchemaTooComplex { max_depth: 3, .. })
        ));
        let unresolved = json!({"$ref": "#/$defs/missing"});
        assert!(matches!(
            schema_to_regex(&unresolved, &JsonSchemaConfig::default()),
            Err(CompilePatternError::InvalidSchema(_))
        ));
    }

    #[test]
    fn optional_recursion_stops_at_the_limit() {
        let tree = automaton(json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "child": {"$ref": "#"}},
            "required": ["name"]
        }));
        assert!(tree.accepts(br#"{"name":"a"}"#));
        assert!(tree.accepts(br#"{"name":"a","child":{"name":"b","child":{"name":"c","child":{"name":"d"}}}}"#));
        assert!(!tree.accepts(
            br#"{"name":"a","child":{"name":"b","child":{"name":"c","child":{"name":"d","child":{"name":"e"}}}}}"#
        ));

        let nested = automaton(json!({"type": "array", "items": {"$ref": "#"}}));
        assert!(nested.accepts(b"[]"));
        assert!(nested.accepts(b"[[[]],[]]"));
        assert!(nested.accepts(b"[[[[]]]]"));
        assert!(!nested.accepts(b"[[[[[]]]]]"));

        let list = automaton(json!({
            "anyOf": [
                {"type": "null"},
                {"type": "object", "properties": {"next": {"$ref": "#"}}, "required": ["next"]}
            ]
        }));
        assert!(list.accepts(b"null"));
        assert!(list.accepts(br#"{"next":{"next":null}}"#));

        let free_form = automaton(json!({"type": "object", "additionalProperties": {"$ref": "#"}}));
        assert!(free_form.accepts(br#"{"a":{"b":{}}}"#));

        let shallow = JsonSchemaConfig {
            max_recursion_depth: 0,
            ..Default::default()
        };
        let regex = schema_to_regex(&json!({"type": "array", "items": {"$ref": "#"}}), &shallow).unwrap();
        insta::assert_snapshot!(regex, @r"\[[ ]?\]");
    }

    #[test]
    fn free_form_values() {
        let any = automaton(json!({}));
        assert!(any.accepts(br#"{"a":[1,"b",null]}"#));
        assert!(!any.accepts(br#"[[[1]]]"#));
        let map = automaton(json!({"type": "object", "additionalProperties": {"type": "integer"}}));
        assert!(map.accepts(br#"{"a":1,"b":2}"#));
        assert!(!map.accepts(br#"{"a":"x"}"#));
    }

    #[test]
    fn custom_whitespace() {
        let config = JsonSchemaConfig {
            whitespace_pattern: Some(String::new()),
            ..Default::default()
        };
        let regex = schema_to_regex(&json!({"type": "array", "items": {"type": "boolean"}}), &config).unwrap();
        insta::assert_snapshot!(regex, @r"\[(?:(?:true|false)(?:,(?:true|false))*)?\]");
    }

    #[test]
    fn unsupported_keywords() {
        assert!(matches!(
            schema_to_regex(&json!({"type": "string", "format": "email"}), &JsonSchemaConfig::default()),
            Err(CompilePatternError::UnsupportedSchema(_))
        ));
        assert!(matches!(
            schema_str_to_regex("{", &JsonSchemaConfig::default()),
            Err(CompilePatternError::InvalidSchema(_))
        ));
    }
}
