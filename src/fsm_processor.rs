//! The logits processor backed by a [`TokenTransitionIndex`].
use std::sync::Arc;

use fixedbitset_stack::FixedBitSet;

use crate::index::TokenTransitionIndex;
use crate::processor_like::{
    apply_mask, sealed, AcceptTokenError, AcceptTokenResult, GenerationState, MaskLogitsError,
    ProcessorLike,
};
use crate::vocabulary::Vocabulary;

/// Enforces a regular constraint: every step is a lookup in the precomputed index.
#[derive(Debug, Clone)]
pub struct FsmProcessor {
    index: Arc<TokenTransitionIndex>,
    vocabulary: Arc<Vocabulary>,
    state: GenerationState,
    current: u32,
    generated: Vec<u32>,
    allowed_token_ids: FixedBitSet,
}

impl FsmProcessor {
    /// Creates a processor in the initial state.
    ///
    /// The index must have been built for `vocabulary`; use
    /// [`LogitsProcessor`](crate::processor::LogitsProcessor) constructors for a checked path.
    pub fn new(index: Arc<TokenTransitionIndex>, vocabulary: Arc<Vocabulary>) -> Self {
        let current = index.initial_state();
        let allowed_token_ids = index.allowed_token_ids(current).clone();
        Self {
            index,
            vocabulary,
            state: GenerationState::Initial,
            current,
            generated: Vec::new(),
            allowed_token_ids,
        }
    }

    /// The index this processor walks.
    pub fn index(&self) -> &Arc<TokenTransitionIndex> {
        &self.index
    }

    /// The current automaton state.
    pub fn current_state(&self) -> u32 {
        self.current
    }

    fn check_acceptable(&self, token_id: u32) -> Result<(), AcceptTokenError> {
        match self.state {
            GenerationState::Accepted => Err(AcceptTokenError::Finished),
            GenerationState::Rejected => Err(AcceptTokenError::Rejected),
            _ if self.vocabulary.token(token_id).is_none() => Err(AcceptTokenError::UnknownTokenID),
            _ => Ok(()),
        }
    }

    fn reject(&mut self, what: std::fmt::Arguments) -> AcceptTokenError {
        log::error!(
            "{} was rejected in automaton state {} of `{}`.",
            what,
            self.current,
            self.index.automaton().pattern()
        );
        self.state = GenerationState::Rejected;
        AcceptTokenError::Rejected
    }

    fn advance(&mut self, next: u32) -> AcceptTokenResult {
        self.current = next;
        if self.index.is_accepting(next) && self.index.has_no_continuation(next) {
            self.state = GenerationState::Accepted;
            AcceptTokenResult::Finished
        } else {
            self.state = GenerationState::Active(next);
            AcceptTokenResult::Ongoing
        }
    }
}

impl sealed::Sealed for FsmProcessor {}

impl ProcessorLike for FsmProcessor {
    fn try_accept_new_token(
        &mut self,
        token_id: u32,
    ) -> Result<AcceptTokenResult, AcceptTokenError> {
        self.check_acceptable(token_id)?;
        if Some(token_id) == self.index.eos_token_id() {
            if !self.index.is_accepting(self.current) {
                return Err(self.reject(format_args!("The EOS token")));
            }
            self.generated.push(token_id);
            self.state = GenerationState::Accepted;
            return Ok(AcceptTokenResult::Finished);
        }
        match self.index.next_state(self.current, token_id) {
            Some(next) => {
                self.generated.push(token_id);
                Ok(self.advance(next))
            }
            None => Err(self.reject(format_args!("Token ID {token_id}"))),
        }
    }

    fn try_accept_new_bytes(
        &mut self,
        bytes: &[u8],
    ) -> Result<AcceptTokenResult, AcceptTokenError> {
        match self.state {
            GenerationState::Accepted => return Err(AcceptTokenError::Finished),
            GenerationState::Rejected => return Err(AcceptTokenError::Rejected),
            _ => {}
        }
        // Raw bytes may stop inside what the vocabulary spells as one token, but the state they
        // reach must still lead to acceptance through whole tokens.
        match self.index.automaton().walk(self.current, bytes) {
            Some(next) if self.index.is_live(next) => Ok(self.advance(next)),
            _ => Err(self.reject(format_args!("The bytes \"{}\"", bytes.escape_ascii()))),
        }
    }

    fn compute_allowed_token_ids(&mut self) {
        match self.state {
            GenerationState::Initial | GenerationState::Active(_) => {
                self.allowed_token_ids = self.index.allowed_token_ids(self.current).clone();
            }
            GenerationState::Accepted => {
                self.allowed_token_ids.clear();
                if let Some(eos) = self.index.eos_token_id() {
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
        self.current = self.index.initial_state();
        self.state = GenerationState::Initial;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::Automaton;
    use crate::config::RegexConfig;
    use crate::processor_like::{UpdateLogitsError, WriteBufferError};

    fn processor(pattern: &str, tokens: &[&str], eos: Option<u32>) -> FsmProcessor {
        let mut vocabulary =
            Vocabulary::from_token_strings(tokens.iter().enumerate().map(|(i, t)| (i as u32, *t)))
                .unwrap();
        if let Some(eos) = eos {
            vocabulary = vocabulary.with_eos_token_id(eos).unwrap();
        }
        let automaton = Arc::new(Automaton::new(pattern, &RegexConfig::default()).unwrap());
        let index = TokenTransitionIndex::new(automaton, &vocabulary).unwrap();
        FsmProcessor::new(Arc::new(index), Arc::new(vocabulary))
    }

    #[test]
    fn digit_scenario() {
        let mut p = processor("[0-9]", &["0", "1", "a", "12", "</s>"], Some(4));
        let mut logits = vec![1.0; 5];
        p.mask_logits(&mut logits).unwrap();
        assert_eq!(
            logits,
            vec![1.0, 1.0, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY]
        );
        assert_eq!(p.try_accept_new_token(1), Ok(AcceptTokenResult::Finished));
        assert!(p.is_finished());
        assert_eq!(p.try_accept_new_token(0), Err(AcceptTokenError::Finished));
        p.compute_allowed_token_ids();
        assert_eq!(
            crate::utils::get_display_form_from_bitset(p.allowed_token_ids_from_last_computation()),
            vec![4]
        );
    }

    #[test]
    fn eos_finishes_only_when_accepting() {
        let mut p = processor("[0-9]+", &["1", "2", "</s>"], Some(2));
        assert_eq!(p.try_accept_new_token(2), Err(AcceptTokenError::Rejected));
        assert_eq!(p.generation_state(), GenerationState::Rejected);
        assert_eq!(p.try_accept_new_token(0), Err(AcceptTokenError::Rejected));
        p.reset();
        assert_eq!(p.generation_state(), GenerationState::Initial);
        assert_eq!(p.try_accept_new_token(0), Ok(AcceptTokenResult::Ongoing));
        assert!(matches!(p.generation_state(), GenerationState::Active(_)));
        assert_eq!(p.try_accept_new_token(2), Ok(AcceptTokenResult::Finished));
        assert_eq!(p.generated_token_ids(), &[0, 2]);
    }

    #[test]
    fn update_logits_accepts_then_masks() {
        let mut p = processor("ab|ac", &["a", "b", "c", "d"], None);
        let mut logits = vec![0.5; 6];
        assert_eq!(p.update_logits(0, &mut logits), Ok(AcceptTokenResult::Ongoing));
        assert_eq!(
            logits,
            vec![
                f32::NEG_INFINITY,
                0.5,
                0.5,
                f32::NEG_INFINITY,
                f32::NEG_INFINITY,
                f32::NEG_INFINITY
            ]
        );
        assert_eq!(p.update_logits(9, &mut logits), Err(UpdateLogitsError::UnknownTokenID));
        let mut short = vec![0.0; 3];
        assert_eq!(p.update_logits(1, &mut short), Ok(AcceptTokenResult::Finished));
        p.reset();
        p.try_accept_new_token(0).unwrap();
        p.compute_allowed_token_ids();
        assert_eq!(p.mask_logits(&mut short), Err(MaskLogitsError::InvalidLogitsLength));
    }

    #[test]
    fn bytes_walk_the_automaton() {
        let mut p = processor("hello( world)?", &["hel", "lo", " ", "world", "</s>"], Some(4));
        assert_eq!(p.try_accept_new_bytes(b"hel"), Ok(AcceptTokenResult::Ongoing));
        assert_eq!(p.try_accept_new_bytes(b"lo"), Ok(AcceptTokenResult::Ongoing));
        assert_eq!(p.try_accept_new_token(2), Ok(AcceptTokenResult::Ongoing));
        assert_eq!(p.try_accept_new_bytes(b"world"), Ok(AcceptTokenResult::Finished));
        p.reset();
        assert_eq!(p.try_accept_new_bytes(b"help"), Err(AcceptTokenError::Rejected));
    }

    #[test]
    fn bytes_must_leave_a_token_path() {
        let mut p = processor("hello( world)?", &["hel", "lo", " ", "world", "</s>"], Some(4));
        // "he" is a prefix of the pattern, but no token spells the "llo" that must follow.
        assert_eq!(p.try_accept_new_bytes(b"he"), Err(AcceptTokenError::Rejected));
        assert_eq!(p.generation_state(), GenerationState::Rejected);
        p.reset();
        assert_eq!(p.try_accept_new_bytes(b"hello w"), Err(AcceptTokenError::Rejected));
        p.reset();
        assert_eq!(p.try_accept_new_bytes(b"hello"), Ok(AcceptTokenResult::Ongoing));
    }

    #[test]
    fn write_buffers() {
        let p = processor("[ab]", &["a", "b", "c"], None);
        let mut buffer = [0usize; 3];
        p.write_allowed_token_ids_to_buffer(&mut buffer).unwrap();
        assert_eq!(buffer, [0, 1, usize::MAX]);
        p.write_disallowed_token_ids_to_buffer(&mut buffer).unwrap();
        assert_eq!(buffer, [2, usize::MAX, usize::MAX]);
        let mut tiny = [0usize; 1];
        assert_eq!(
            p.write_allowed_token_ids_to_buffer(&mut tiny),
            Err(WriteBufferError::BufferTooSmall)
        );
    }
}
