//! The pattern compiler: lowers an [`OutputTypeSpec`] into a [`CompiledPattern`].
use std::sync::Arc;

use regex_syntax::ast::ErrorKind;
use regex_syntax::hir::Look;
use serde_json::Value;

use crate::automaton::Automaton;
use crate::config::Config;
use crate::json_schema;
use crate::types::{choice_text, OutputTypeSpec};

/// The error type for pattern compilation.
#[derive(Debug, thiserror::Error)]
pub enum CompilePatternError {
    /// The regular expression uses a feature a byte-level DFA walk cannot honour.
    #[error("The regular expression `{pattern}` uses {feature}, which is not supported.")]
    UnsupportedPattern {
        /// The offending pattern.
        pattern: String,
        /// The unsupported feature.
        feature: String,
    },
    /// The regular expression is malformed.
    #[error("Invalid regular expression: {0}")]
    InvalidRegex(#[from] regex_syntax::Error),
    /// A `$ref` is expanded inside itself too many times.
    #[error("The reference `{reference}` is nested deeper than the maximum of {max_depth}.")]
    SchemaTooComplex {
        /// The reference that recursed.
        reference: String,
        /// The configured maximum depth.
        max_depth: usize,
    },
    /// The JSON schema is malformed.
    #[error("Invalid JSON schema: {0}")]
    InvalidSchema(String),
    /// The JSON schema uses a keyword that cannot be compiled.
    #[error("Unsupported JSON schema feature: {0}")]
    UnsupportedSchema(String),
    /// A choice or an enumeration without alternatives.
    #[error("A choice needs at least one alternative.")]
    EmptyChoice,
}

/// A normalized constraint, ready for automaton or parser construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompiledPattern {
    /// A regular expression matched against the whole output.
    Regex(String),
    /// A context-free grammar in EBNF-like text.
    Grammar(String),
    /// An automaton built elsewhere.
    Automaton(Arc<Automaton>),
}

/// Checks that `pattern` is a regular expression a byte-level DFA can enforce.
///
/// # Errors
///
/// Backreferences, look-around, word boundaries and multi-line anchors yield
/// [`CompilePatternError::UnsupportedPattern`]; other syntax errors yield
/// [`CompilePatternError::InvalidRegex`].
pub fn validate_regex(pattern: &str) -> Result<(), CompilePatternError> {
    let unsupported = |feature: &str| CompilePatternError::UnsupportedPattern {
        pattern: pattern.to_string(),
        feature: feature.to_string(),
    };
    let hir = match regex_syntax::Parser::new().parse(pattern) {
        Ok(hir) => hir,
        Err(regex_syntax::Error::Parse(e)) => {
            return Err(match e.kind() {
                ErrorKind::UnsupportedBackreference => unsupported("a backreference"),
                ErrorKind::UnsupportedLookAround => unsupported("look-around"),
                _ => CompilePatternError::InvalidRegex(regex_syntax::Error::Parse(e)),
            })
        }
        Err(e) => return Err(e.into()),
    };
    for look in hir.properties().look_set().iter() {
        match look {
            Look::Start | Look::End => {}
            Look::StartLF | Look::EndLF | Look::StartCRLF | Look::EndCRLF => {
                return Err(unsupported("a multi-line anchor"))
            }
            _ => return Err(unsupported("a word boundary")),
        }
    }
    Ok(())
}

/// An alternation of the escaped literals, in the given order.
pub fn choice_regex<S: AsRef<str>>(choices: &[S]) -> Result<String, CompilePatternError> {
    if choices.is_empty() {
        return Err(CompilePatternError::EmptyChoice);
    }
    let escaped: Vec<String> = choices
        .iter()
        .map(|c| regex_syntax::escape(c.as_ref()))
        .collect();
    Ok(format!("(?:{})", escaped.join("|")))
}

/// Compiles an output type specification.
///
/// Equal specifications always compile to equal patterns. Grammars are passed through as text
/// and parsed when a processor is created.
pub fn compile(spec: &OutputTypeSpec, config: &Config) -> Result<CompiledPattern, CompilePatternError> {
    let regex = match spec {
        OutputTypeSpec::Primitive(primitive) => primitive.pattern().to_string(),
        OutputTypeSpec::Enum(e) => {
            let choices: Vec<String> = e.members.iter().map(|(_, v)| choice_text(v)).collect();
            choice_regex(&choices)?
        }
        OutputTypeSpec::Choice(choices) => choice_regex(choices)?,
        OutputTypeSpec::JsonSchema(Value::String(text)) => {
            json_schema::schema_str_to_regex(text, &config.json_schema_config)?
        }
        OutputTypeSpec::JsonSchema(schema) => {
            json_schema::schema_to_regex(schema, &config.json_schema_config)?
        }
        OutputTypeSpec::NativeStruct(s) => {
            let schema = s
                .json_schema()
                .map_err(|e| CompilePatternError::UnsupportedSchema(e.to_string()))?;
            json_schema::schema_to_regex(&schema, &config.json_schema_config)?
        }
        OutputTypeSpec::Regex(pattern) => {
            validate_regex(pattern)?;
            pattern.clone()
        }
        OutputTypeSpec::Cfg(grammar) => return Ok(CompiledPattern::Grammar(grammar.clone())),
        OutputTypeSpec::Automaton(automaton) => {
            return Ok(CompiledPattern::Automaton(automaton.clone()))
        }
    };
    Ok(CompiledPattern::Regex(regex))
}
