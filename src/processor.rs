//! The main module that contains the [`LogitsProcessor`] struct and its related types.
use std::sync::Arc;

use fixedbitset_stack::FixedBitSet;

use crate::automaton::{Automaton, BuildAutomatonError};
use crate::cache::CompilationCache;
use crate::config::Config;
use crate::fsm_processor::FsmProcessor;
use crate::grammar::{CreateGrammarError, Grammar};
use crate::grammar_processor::GrammarProcessor;
use crate::index::{BuildIndexError, TokenTransitionIndex};
use crate::pattern::{self, CompilePatternError, CompiledPattern};
use crate::processor_like::{
    sealed, AcceptTokenError, AcceptTokenResult, GenerationState, MaskLogitsError, ProcessorLike,
    UpdateLogitsError, WriteBufferError,
};
use crate::types::{self, OutputTypeSpec, TypeDescriptor, UnsupportedTypeError};
use crate::vocabulary::{CreateVocabularyError, Vocabulary};

#[derive(Debug, Clone)]
/// An enum over the processor implementations.
pub(crate) enum ProcessorUnion {
    /// Regular constraints: regex, JSON schema, choices, primitives.
    Fsm(FsmProcessor),
    /// Context-free constraints.
    Grammar(GrammarProcessor),
}

#[derive(Debug, Clone)]
/// The main struct that wraps the processor implementations so the user does not have to pick one.
pub struct LogitsProcessor {
    union: ProcessorUnion,
}

#[derive(Debug, thiserror::Error)]
/// Represents the error type for the [`LogitsProcessor`] creation.
pub enum CreateProcessorError {
    #[error("{0}")] // inherits the error message from the wrapped error
    /// A wrapper for the [`UnsupportedTypeError`] error type.
    UnsupportedType(#[from] UnsupportedTypeError),
    #[error("{0}")]
    /// A wrapper for the [`CompilePatternError`] error type.
    Pattern(#[from] CompilePatternError),
    #[error("{0}")]
    /// A wrapper for the [`BuildAutomatonError`] error type.
    Automaton(#[from] BuildAutomatonError),
    #[error("{0}")]
    /// A wrapper for the [`BuildIndexError`] error type.
    Index(#[from] BuildIndexError),
    #[error("{0}")]
    /// A wrapper for the [`CreateGrammarError`] error type.
    Grammar(#[from] CreateGrammarError),
    #[error("{0}")]
    /// A wrapper for the [`CreateVocabularyError`] error type.
    Vocabulary(#[from] CreateVocabularyError),
}

impl LogitsProcessor {
    /// Creates a [`LogitsProcessor`] for any supported output type with the default [`Config`].
    ///
    /// # Errors
    ///
    /// Returns a [`CreateProcessorError`] when the type is unsupported or its constraint cannot be built.
    pub fn new(
        output_type: &TypeDescriptor,
        vocabulary: Arc<Vocabulary>,
    ) -> Result<LogitsProcessor, CreateProcessorError> {
        Self::with_config(output_type, vocabulary, &Config::default())
    }

    /// Creates a [`LogitsProcessor`] for any supported output type.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateProcessorError`] when the type is unsupported or its constraint cannot be built.
    pub fn with_config(
        output_type: &TypeDescriptor,
        vocabulary: Arc<Vocabulary>,
        config: &Config,
    ) -> Result<LogitsProcessor, CreateProcessorError> {
        let spec = types::classify(output_type)?;
        Self::from_output_type_spec(&spec, vocabulary, config)
    }

    /// Creates a [`LogitsProcessor`] from a classified output type.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateProcessorError`] when the constraint cannot be built.
    pub fn from_output_type_spec(
        spec: &OutputTypeSpec,
        vocabulary: Arc<Vocabulary>,
        config: &Config,
    ) -> Result<LogitsProcessor, CreateProcessorError> {
        let compiled = pattern::compile(spec, config)?;
        Self::from_compiled_pattern(&compiled, vocabulary, config)
    }

    /// Creates a [`LogitsProcessor`] from a compiled pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateProcessorError`] when the automaton, index or grammar cannot be built.
    pub fn from_compiled_pattern(
        compiled: &CompiledPattern,
        vocabulary: Arc<Vocabulary>,
        config: &Config,
    ) -> Result<LogitsProcessor, CreateProcessorError> {
        match compiled {
            CompiledPattern::Regex(regex) => {
                let automaton = if config.processor_config.cache_enabled {
                    CompilationCache::global().automaton(regex, &config.regex_config)?
                } else {
                    Arc::new(Automaton::new(regex, &config.regex_config)?)
                };
                Self::from_automaton(automaton, vocabulary, config)
            }
            CompiledPattern::Grammar(text) => Self::from_grammar(text, vocabulary, config),
            CompiledPattern::Automaton(automaton) => {
                Self::from_automaton(automaton.clone(), vocabulary, config)
            }
        }
    }

    /// Creates a [`LogitsProcessor`] from a regular expression.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateProcessorError`] when the regex is invalid or unsupported, or no token
    /// sequence matches it.
    pub fn from_regex(
        regex: &str,
        vocabulary: Arc<Vocabulary>,
        config: &Config,
    ) -> Result<LogitsProcessor, CreateProcessorError> {
        pattern::validate_regex(regex)?;
        Self::from_compiled_pattern(&CompiledPattern::Regex(regex.to_string()), vocabulary, config)
    }

    /// Creates a [`LogitsProcessor`] from an already built automaton.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateProcessorError`] when no token sequence matches the automaton.
    pub fn from_automaton(
        automaton: Arc<Automaton>,
        vocabulary: Arc<Vocabulary>,
        config: &Config,
    ) -> Result<LogitsProcessor, CreateProcessorError> {
        let index = if config.processor_config.cache_enabled {
            CompilationCache::global().index(&automaton, &vocabulary)?
        } else {
            Arc::new(TokenTransitionIndex::new(automaton, &vocabulary)?)
        };
        Ok(Self {
            union: ProcessorUnion::Fsm(FsmProcessor::new(index, vocabulary)),
        })
    }

    /// Creates a [`LogitsProcessor`] from grammar text. The start nonterminal is taken from `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateProcessorError`] when the grammar is invalid.
    pub fn from_grammar(
        grammar: &str,
        vocabulary: Arc<Vocabulary>,
        config: &Config,
    ) -> Result<LogitsProcessor, CreateProcessorError> {
        let grammar = if config.processor_config.cache_enabled {
            CompilationCache::global().grammar(
                grammar,
                &config.start_nonterminal,
                &config.regex_config,
            )?
        } else {
            Arc::new(Grammar::new(
                grammar,
                &config.start_nonterminal,
                &config.regex_config,
            )?)
        };
        Ok(Self {
            union: ProcessorUnion::Grammar(GrammarProcessor::new(
                grammar,
                vocabulary,
                config.processor_config,
            )),
        })
    }

    /// The token transition index, if the constraint is regular.
    pub fn index(&self) -> Option<&Arc<TokenTransitionIndex>> {
        match &self.union {
            ProcessorUnion::Fsm(processor) => Some(processor.index()),
            ProcessorUnion::Grammar(_) => None,
        }
    }
}

macro_rules! match_processor_union {
    ($e:path[$s:expr$(,$p:ident)*]) => {
        match $s {
            ProcessorUnion::Fsm(processor) => $e(processor, $($p,)*),
            ProcessorUnion::Grammar(processor) => $e(processor, $($p,)*),
        }
    }
}

impl sealed::Sealed for LogitsProcessor {}

impl ProcessorLike for LogitsProcessor {
    fn try_accept_new_token(
        &mut self,
        token_id: u32,
    ) -> Result<AcceptTokenResult, AcceptTokenError> {
        match_processor_union!(ProcessorLike::try_accept_new_token[&mut self.union, token_id])
    }

    fn try_accept_new_bytes(
        &mut self,
        bytes: &[u8],
    ) -> Result<AcceptTokenResult, AcceptTokenError> {
        match_processor_union!(ProcessorLike::try_accept_new_bytes[&mut self.union, bytes])
    }

    fn compute_allowed_token_ids(&mut self) {
        match_processor_union!(ProcessorLike::compute_allowed_token_ids[&mut self.union])
    }

    fn mask_logits(&self, logits: &mut [f32]) -> Result<(), MaskLogitsError> {
        match_processor_union!(ProcessorLike::mask_logits[&self.union, logits])
    }

    fn update_logits(
        &mut self,
        token_id: u32,
        logits: &mut [f32],
    ) -> Result<AcceptTokenResult, UpdateLogitsError> {
        match_processor_union!(ProcessorLike::update_logits[&mut self.union, token_id, logits])
    }

    fn allowed_token_ids_from_last_computation(&self) -> &FixedBitSet {
        match_processor_union!(ProcessorLike::allowed_token_ids_from_last_computation[&self.union])
    }

    fn write_disallowed_token_ids_to_buffer(
        &self,
        buffer: &mut [usize],
    ) -> Result<(), WriteBufferError> {
        match_processor_union!(ProcessorLike::write_disallowed_token_ids_to_buffer[&self.union, buffer])
    }

    fn write_allowed_token_ids_to_buffer(
        &self,
        buffer: &mut [usize],
    ) -> Result<(), WriteBufferError> {
        match_processor_union!(ProcessorLike::write_allowed_token_ids_to_buffer[&self.union, buffer])
    }

    fn is_finished(&self) -> bool {
        match_processor_union!(ProcessorLike::is_finished[&self.union])
    }

    fn reset(&mut self) {
        match_processor_union!(ProcessorLike::reset[&mut self.union])
    }

    fn generation_state(&self) -> GenerationState {
        match_processor_union!(ProcessorLike::generation_state[&self.union])
    }

    fn generated_token_ids(&self) -> &[u32] {
        match_processor_union!(ProcessorLike::generated_token_ids[&self.union])
    }

    fn into_boxed_processor(self) -> Box<dyn ProcessorLike> {
        match_processor_union!(ProcessorLike::into_boxed_processor[self.union])
    }

    fn vocab(&self) -> Arc<Vocabulary> {
        match_processor_union!(ProcessorLike::vocab[&self.union])
    }
}
