//! The configuration module of the kstruct crate.
use serde::{Deserialize, Serialize};

/// The default whitespace pattern inserted between JSON tokens.
pub const DEFAULT_WHITESPACE_PATTERN: &str = r"[ ]?";

/// The configuration used by [`LogitsProcessor`](crate::processor::LogitsProcessor) construction.
/// This should suffice most scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Config {
    /// The configuration of the regular expressions.
    pub regex_config: RegexConfig,
    /// The configuration of the JSON schema to regex compilation.
    pub json_schema_config: JsonSchemaConfig,
    /// The configuration of the logits processors.
    pub processor_config: ProcessorConfig,
    /// The start nonterminal of context-free grammars.
    /// The default is `start`.
    pub start_nonterminal: String,
}

/// The configuration of regular expressions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Copy, Default)]
pub struct RegexConfig {
    /// The maximum memory usage in bytes allowed when compiling the regex.
    /// If the memory usage exceeds this limit, an error will be returned.
    /// The default is `None`, which means no limit for dfa.
    pub max_memory_usage: Option<usize>,
    /// The maximum length in bytes of a regular expression.
    /// The default is `None`, which means no limit.
    pub max_pattern_length: Option<usize>,
}

/// The configuration of the JSON schema compiler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JsonSchemaConfig {
    /// The pattern matched between JSON tokens.
    /// `None` means [`DEFAULT_WHITESPACE_PATTERN`].
    pub whitespace_pattern: Option<String>,
    /// How many times a `$ref` may be expanded inside itself before the schema is
    /// rejected as too complex. The default is 3.
    pub max_recursion_depth: usize,
    /// How deeply nested the arrays and objects of an unconstrained JSON value may be.
    /// The default is 2.
    pub any_value_depth: usize,
}

/// The configuration of the logits processors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Copy)]
pub struct ProcessorConfig {
    /// Whether automata and token transition indices are shared through
    /// [`CompilationCache::global`](crate::cache::CompilationCache::global).
    /// It is enabled by default.
    pub cache_enabled: bool,
}

impl Default for JsonSchemaConfig {
    fn default() -> Self {
        Self {
            whitespace_pattern: None,
            max_recursion_depth: 3,
            any_value_depth: 2,
        }
    }
}

impl JsonSchemaConfig {
    /// Returns the whitespace pattern in effect.
    pub fn whitespace(&self) -> &str {
        self.whitespace_pattern
            .as_deref()
            .unwrap_or(DEFAULT_WHITESPACE_PATTERN)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            regex_config: RegexConfig::default(),
            json_schema_config: JsonSchemaConfig::default(),
            processor_config: ProcessorConfig::default(),
            start_nonterminal: "start".to_string(),
        }
    }
}
