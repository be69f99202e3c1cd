//! This module contains the [`ProcessorLike`] trait, which defines the behavior of a logits processor.

use std::sync::Arc;

use displaydoc::Display;
use fixedbitset_stack::FixedBitSet;

use crate::vocabulary::Vocabulary;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the error when a [`ProcessorLike`] tries to accept a token.
pub enum AcceptTokenError {
    /// The input token id does not exist in the vocabulary of the [`ProcessorLike`].
    UnknownTokenID,
    /// The input token id is rejected and the [`ProcessorLike`] is now in the rejected state.
    Rejected,
    /// The [`ProcessorLike`] is finished. No more tokens can be accepted.
    Finished,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the result after a [`ProcessorLike`] successfully accepts a token.
pub enum AcceptTokenResult {
    /// The token is accepted and the [`ProcessorLike`] can accept more tokens.
    Ongoing,
    /// The [`ProcessorLike`] is finished and no more tokens can be accepted.
    Finished,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the error when a [`ProcessorLike`] tries to mask logits.
pub enum MaskLogitsError {
    /// The input logits array is shorter than the vocabulary.
    InvalidLogitsLength,
    /// No token is permitted although the generation is unfinished.
    NoValidContinuation,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the error when a [`ProcessorLike`] tries to write token ids to a buffer.
pub enum WriteBufferError {
    /// The buffer is not large enough to hold all the token IDs.
    BufferTooSmall,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the error when a [`ProcessorLike`] tries to update logits.
pub enum UpdateLogitsError {
    /// The input token id does not exist in the vocabulary of the [`ProcessorLike`].
    UnknownTokenID,
    /// The input token id is rejected and the [`ProcessorLike`] is now in the rejected state.
    Rejected,
    /// The [`ProcessorLike`] is finished. No more tokens can be accepted.
    Finished,
    /// The input logits array is shorter than the vocabulary.
    InvalidLogitsLength,
    /// No token is permitted although the generation is unfinished.
    NoValidContinuation,
}

impl From<AcceptTokenError> for UpdateLogitsError {
    fn from(e: AcceptTokenError) -> Self {
        match e {
            AcceptTokenError::UnknownTokenID => UpdateLogitsError::UnknownTokenID,
            AcceptTokenError::Rejected => UpdateLogitsError::Rejected,
            AcceptTokenError::Finished => UpdateLogitsError::Finished,
        }
    }
}

impl From<MaskLogitsError> for UpdateLogitsError {
    fn from(e: MaskLogitsError) -> Self {
        match e {
            MaskLogitsError::InvalidLogitsLength => UpdateLogitsError::InvalidLogitsLength,
            MaskLogitsError::NoValidContinuation => UpdateLogitsError::NoValidContinuation,
        }
    }
}

/// The lifecycle of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationState {
    /// No token has been accepted yet.
    Initial,
    /// Tokens have been accepted. For automaton-backed processors the value is the current
    /// automaton state; for grammar-backed processors it is the number of consumed bytes.
    Active(u32),
    /// The output is complete.
    Accepted,
    /// A token violated the constraint. Only [`ProcessorLike::reset`] leaves this state.
    Rejected,
}

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// A trait that defines the behavior of a [`ProcessorLike`] object.
pub trait ProcessorLike: sealed::Sealed {
    /// Tries to accept a new token with the given token ID.
    ///
    /// # Arguments
    ///
    /// * `token_id` - The ID of the token to be accepted.
    ///
    /// # Returns
    ///
    /// * [`AcceptTokenResult`] - The result of accepting the token.
    ///
    /// # Errors
    ///
    /// Returns an [`AcceptTokenError`] when a token is not accepted. Check the error type docs for more details.
    /// A rejected token moves the processor to [`GenerationState::Rejected`].
    fn try_accept_new_token(
        &mut self,
        token_id: u32,
    ) -> Result<AcceptTokenResult, AcceptTokenError>;

    /// Tries to accept new bytes, as if a token spelling them was emitted.
    ///
    /// # Errors
    ///
    /// Returns an [`AcceptTokenError`] when the bytes are not accepted. Check the error type docs for more details.
    fn try_accept_new_bytes(&mut self, bytes: &[u8])
        -> Result<AcceptTokenResult, AcceptTokenError>;

    /// Computes the allowed token IDs based on current states.
    fn compute_allowed_token_ids(&mut self);

    /// Masks the logits based on last computed token IDs.
    /// These token IDs can also be obtained from [`ProcessorLike::allowed_token_ids_from_last_computation`].
    ///
    /// Last computation is the last [`ProcessorLike::compute_allowed_token_ids`] or [`ProcessorLike::update_logits`] called.
    /// [`ProcessorLike::try_accept_new_token`] does not compute the allowed token IDs and hence does not affect the masking.
    ///
    /// Entries past the vocabulary size are masked as well, since models often pad their output layer.
    ///
    /// # Errors
    ///
    /// Returns a [`MaskLogitsError`] when the logits array is shorter than the vocabulary, or when no token is
    /// permitted in an unfinished state. The logits array is not updated in either case.
    fn mask_logits(&self, logits: &mut [f32]) -> Result<(), MaskLogitsError>;

    /// Try to accept the token ID and if succeeds, update the given logits array.
    ///
    /// # Errors
    ///
    /// Returns an [`UpdateLogitsError`] when the logits is not updated. Check the error type docs for more details.
    fn update_logits(
        &mut self,
        token_id: u32,
        logits: &mut [f32],
    ) -> Result<AcceptTokenResult, UpdateLogitsError> {
        let result = self.try_accept_new_token(token_id)?;
        if result == AcceptTokenResult::Finished {
            return Ok(result);
        }
        self.compute_allowed_token_ids();
        self.mask_logits(logits)?;
        Ok(result)
    }

    /// Gets the allowed token IDs since last computation.
    fn allowed_token_ids_from_last_computation(&self) -> &FixedBitSet;

    /// Writes the disallowed token IDs to the front of the buffer.
    /// If the buffer is longer than needed, the entry after the last ID is set to `usize::MAX`.
    fn write_disallowed_token_ids_to_buffer(
        &self,
        buffer: &mut [usize],
    ) -> Result<(), WriteBufferError> {
        let allowed = self.allowed_token_ids_from_last_computation();
        let vocab_size = self.vocab().vocab_size();
        write_to_buffer(
            (0..vocab_size).filter(|&id| !allowed.contains(id)),
            vocab_size - allowed.count_ones(..).min(vocab_size),
            buffer,
        )
    }

    /// Writes the allowed token IDs to the front of the buffer.
    /// If the buffer is longer than needed, the entry after the last ID is set to `usize::MAX`.
    fn write_allowed_token_ids_to_buffer(
        &self,
        buffer: &mut [usize],
    ) -> Result<(), WriteBufferError> {
        let allowed = self.allowed_token_ids_from_last_computation();
        write_to_buffer(allowed.ones(), allowed.count_ones(..), buffer)
    }

    /// Checks if the processor is finished.
    fn is_finished(&self) -> bool;
    /// Resets the processor to its initial state. Compiled automata, indices and grammars are kept.
    fn reset(&mut self);
    /// The current [`GenerationState`].
    fn generation_state(&self) -> GenerationState;
    /// The token IDs accepted since the last reset.
    fn generated_token_ids(&self) -> &[u32];
    /// Converts the processor to a boxed processor.
    fn into_boxed_processor(self) -> Box<dyn ProcessorLike>;
    /// Gets the vocabulary of the processor.
    fn vocab(&self) -> Arc<Vocabulary>;
}

fn write_to_buffer(
    ids: impl Iterator<Item = usize>,
    count: usize,
    buffer: &mut [usize],
) -> Result<(), WriteBufferError> {
    if buffer.len() < count {
        return Err(WriteBufferError::BufferTooSmall);
    }
    for (slot, id) in buffer.iter_mut().zip(ids) {
        *slot = id;
    }
    if let Some(slot) = buffer.get_mut(count) {
        *slot = usize::MAX;
    }
    Ok(())
}

/// Sets every entry that is not in `allowed` to negative infinity.
pub(crate) fn apply_mask(
    allowed: &FixedBitSet,
    vocab_size: usize,
    finished: bool,
    logits: &mut [f32],
) -> Result<(), MaskLogitsError> {
    if logits.len() < vocab_size {
        return Err(MaskLogitsError::InvalidLogitsLength);
    }
    if !finished && allowed.count_ones(..) == 0 {
        log::error!("No token is permitted in an unfinished generation.");
        return Err(MaskLogitsError::NoValidContinuation);
    }
    for (token_id, logit) in logits.iter_mut().enumerate() {
        if token_id >= vocab_size || !allowed.contains(token_id) {
            *logit = f32::NEG_INFINITY;
        }
    }
    Ok(())
}
