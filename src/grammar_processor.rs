//! The logits processor backed by an [`EarleyRecognizer`].
use std::sync::Arc;

use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;

use crate::config::ProcessorConfig;
use crate::earley::EarleyRecognizer;
use crate::grammar::Grammar;
use crate::processor_like::{
    apply_mask, sealed, AcceptTokenError, AcceptTokenResult, GenerationState, MaskLogitsError,
    ProcessorLike,
};
use crate::utils;
use crate::vocabulary::Vocabulary;

/// How many consumed prefixes a [`GrammarProcessor`] memoizes at most.
pub const MAX_CACHED_PREFIXES: usize = 1024;

/// Enforces a context-free constraint.
///
/// The permitted tokens are found by walking the vocabulary through the recognizer, sharing
/// the walk of common token prefixes. When the cache is enabled, the result is memoized by the
/// bytes consumed so far and survives [`reset`](ProcessorLike::reset). The memo holds at most
/// [`MAX_CACHED_PREFIXES`] prefixes; the longest ones go first since every generation starts
/// from the short ones.
#[derive(Debug, Clone)]
pub struct GrammarProcessor {
    recognizer: EarleyRecognizer,
    vocabulary: Arc<Vocabulary>,
    config: ProcessorConfig,
    state: GenerationState,
    consumed: Vec<u8>,
    generated: Vec<u32>,
    allowed_token_ids: FixedBitSet,
    cache: AHashMap<Vec<u8>, FixedBitSet>,
    cache_capacity: usize,
}

impl GrammarProcessor {
    /// Creates a processor in the initial state.
    pub fn new(grammar: Arc<Grammar>, vocabulary: Arc<Vocabulary>, config: ProcessorConfig) -> Self {
        let mut processor = Self {
            recognizer: EarleyRecognizer::new(grammar),
            allowed_token_ids: FixedBitSet::with_capacity(vocabulary.vocab_size()),
            vocabulary,
            config,
            state: GenerationState::Initial,
            consumed: Vec::new(),
            generated: Vec::new(),
            cache: AHashMap::default(),
            cache_capacity: MAX_CACHED_PREFIXES,
        };
        processor.compute_allowed_token_ids();
        processor
    }

    /// The grammar this processor enforces.
    pub fn grammar(&self) -> &Arc<Grammar> {
        self.recognizer.grammar()
    }

    fn check_acceptable(&self) -> Result<(), AcceptTokenError> {
        match self.state {
            GenerationState::Accepted => Err(AcceptTokenError::Finished),
            GenerationState::Rejected => Err(AcceptTokenError::Rejected),
            _ => Ok(()),
        }
    }

    fn reject(&mut self, what: std::fmt::Arguments) -> AcceptTokenError {
        log::error!(
            "{} was rejected after {} bytes of output.",
            what,
            self.consumed.len()
        );
        self.state = GenerationState::Rejected;
        AcceptTokenError::Rejected
    }

    fn consume(&mut self, bytes: &[u8]) -> Result<AcceptTokenResult, ()> {
        if bytes.is_empty() || !self.recognizer.feed_bytes(bytes) {
            return Err(());
        }
        self.consumed.extend_from_slice(bytes);
        if self.recognizer.is_accepting() && !self.recognizer.can_continue() {
            self.state = GenerationState::Accepted;
            Ok(AcceptTokenResult::Finished)
        } else {
            self.state = GenerationState::Active(self.recognizer.consumed_len() as u32);
            Ok(AcceptTokenResult::Ongoing)
        }
    }

    fn memoize(&mut self, allowed: &FixedBitSet) {
        if self.cache.len() >= self.cache_capacity {
            let longest = self.cache.keys().max_by_key(|prefix| prefix.len()).cloned();
            match longest {
                Some(longest) if longest.len() > self.consumed.len() => {
                    self.cache.remove(&longest);
                }
                _ => return,
            }
        }
        self.cache.insert(self.consumed.clone(), allowed.clone());
    }

    fn walk_vocabulary(&mut self) -> FixedBitSet {
        let vocabulary = self.vocabulary.clone();
        let mut allowed = FixedBitSet::with_capacity(vocabulary.vocab_size());
        let base = self.recognizer.checkpoint();
        for first_byte in 0..=u8::MAX {
            let token_ids = vocabulary.tokens_from_first_byte(first_byte);
            if token_ids.is_empty() {
                continue;
            }
            self.recognizer.restore(base);
            if !self.recognizer.feed_byte(first_byte) {
                continue;
            }
            let mut previous: &[u8] = &[first_byte];
            let mut i = 0;
            while i < token_ids.len() {
                let token_id = token_ids[i];
                let bytes = vocabulary.token_bytes(token_id);
                let shared = utils::common_prefix_len(previous, bytes)
                    .min(self.recognizer.checkpoint() - base);
                self.recognizer.restore(base + shared);
                let failed_at = bytes[shared..]
                    .iter()
                    .position(|&byte| !self.recognizer.feed_byte(byte))
                    .map(|k| shared + k);
                previous = bytes;
                i += 1;
                match failed_at {
                    Some(k) => {
                        let failing_prefix = &bytes[..=k];
                        i += token_ids[i..].partition_point(|&id| {
                            vocabulary.token_bytes(id).starts_with(failing_prefix)
                        });
                    }
                    None => {
                        allowed.insert(token_id as usize);
                    }
                }
            }
        }
        self.recognizer.restore(base);
        allowed
    }
}

impl sealed::Sealed for GrammarProcessor {}

impl ProcessorLike for GrammarProcessor {
    fn try_accept_new_token(
        &mut self,
        token_id: u32,
    ) -> Result<AcceptTokenResult, AcceptTokenError> {
        self.check_acceptable()?;
        if self.vocabulary.token(token_id).is_none() {
            return Err(AcceptTokenError::UnknownTokenID);
        }
        if Some(token_id) == self.vocabulary.eos_token_id() {
            if !self.recognizer.is_accepting() {
                return Err(self.reject(format_args!("The EOS token")));
            }
            self.generated.push(token_id);
            self.state = GenerationState::Accepted;
            return Ok(AcceptTokenResult::Finished);
        }
        let vocabulary = self.vocabulary.clone();
        match self.consume(vocabulary.token_bytes(token_id)) {
            Ok(result) => {
                self.generated.push(token_id);
                Ok(result)
            }
            Err(()) => Err(self.reject(format_args!("Token ID {token_id}"))),
        }
    }

    fn try_accept_new_bytes(
        &mut self,
        bytes: &[u8],
    ) -> Result<AcceptTokenResult, AcceptTokenError> {
        self.check_acceptable()?;
        self.consume(bytes)
            .map_err(|()| self.reject(format_args!("The bytes \"{}\"", bytes.escape_ascii())))
    }

    fn compute_allowed_token_ids(&mut self) {
        match self.state {
            GenerationState::Initial | GenerationState::Active(_) => {
                let cached = if self.config.cache_enabled {
                    self.cache.get(&self.consumed).cloned()
                } else {
                    None
                };
                let mut allowed = match cached {
                    Some(allowed) => allowed,
                    None => {
                        let allowed = self.walk_vocabulary();
                        if self.config.cache_enabled {
                            self.memoize(&allowed);
                        }
                        allowed
                    }
                };
                if let Some(eos) = self.vocabulary.eos_token_id() {
                    if self.recognizer.is_accepting() {
                        allowed.insert(eos as usize);
                    }
                }
                self.allowed_token_ids = allowed;
            }
            GenerationState::Accepted => {
                self.allowed_token_ids.clear();
                if let Some(eos) = self.vocabulary.eos_token_id() {
                    self.allowed_token_ids.insert(eos as usize);
                }
            }
            GenerationState::Rejected => self.allowed_token_ids.clear(),
        }
    }

    fn mask_logits(&self, logits: &mut [f32]) -> Result<(), MaskLogitsError> {
        apply_mask(
            &self.allowed_token_ids,
            self.vocabulary.vocab_size(),
            self.is_finished(),
            logits,
        )
    }

    fn allowed_token_ids_from_last_computation(&self) -> &FixedBitSet {
        &self.allowed_token_ids
    }

    fn is_finished(&self) -> bool {
        self.state == GenerationState::Accepted
    }

    fn reset(&mut self) {
        self.recognizer.reset();
        self.state = GenerationState::Initial;
        self.consumed.clear();
        self.generated.clear();
        self.compute_allowed_token_ids();
    }

    fn generation_state(&self) -> GenerationState {
        self.state
    }

    fn generated_token_ids(&self) -> &[u32] {
        &self.generated
    }

    fn into_boxed_processor(self) -> Box<dyn ProcessorLike> {
        Box::new(self)
    }

    fn vocab(&self) -> Arc<Vocabulary> {
        self.vocabulary.clone()
    }
}
