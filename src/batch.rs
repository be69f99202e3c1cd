//! Batched decoding: one independent [`LogitsProcessor`] per row.
use crate::processor::LogitsProcessor;
use crate::processor_like::{ProcessorLike, UpdateLogitsError};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
/// The error type for [`BatchLogitsProcessor::process`].
pub enum BatchProcessError {
    /// The number of sequences differs from the batch size seen on the first call.
    #[error("The batch has {actual} rows, but {expected} rows were processed before.")]
    BatchSizeChanged {
        /// The batch size of the first call.
        expected: usize,
        /// The batch size of this call.
        actual: usize,
    },
    /// The flat logits buffer cannot be split evenly into rows.
    #[error("The logits buffer has {len} entries, which cannot be split into {rows} rows.")]
    InvalidLogitsShape {
        /// The number of rows.
        rows: usize,
        /// The length of the buffer.
        len: usize,
    },
    /// A sequence is shorter than on the previous call.
    #[error("Row {row} has {len} tokens, but {seen} tokens were processed before.")]
    SequenceShrank {
        /// The row index.
        row: usize,
        /// The length of the sequence.
        len: usize,
        /// The number of tokens already processed.
        seen: usize,
    },
    /// A row's processor failed.
    #[error("Row {row}: {error}")]
    Row {
        /// The row index.
        row: usize,
        /// The failure.
        error: UpdateLogitsError,
    },
}

/// Applies one constraint to every row of a batch.
///
/// Each call receives the tokens generated so far for every row, prompts excluded. Only the tokens
/// a row has not seen yet are fed to its processor. Rows that are finished are masked down to the
/// EOS token, and their later tokens, typically padding, are ignored.
#[derive(Debug, Clone)]
pub struct BatchLogitsProcessor {
    prototype: LogitsProcessor,
    rows: Vec<LogitsProcessor>,
    seen: Vec<usize>,
}

impl BatchLogitsProcessor {
    /// Creates a batch processor. Rows are cloned from `prototype` on the first call.
    pub fn new(mut prototype: LogitsProcessor) -> Self {
        prototype.reset();
        Self {
            prototype,
            rows: Vec::new(),
            seen: Vec::new(),
        }
    }

    /// Feeds the new tokens of every row and masks `logits`, a row-major `[rows, vocab]` buffer.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchProcessError`] when the batch shape is inconsistent or a row rejects its
    /// tokens or cannot be masked. Rows before the failing one have already been updated.
    pub fn process<S: AsRef<[u32]>>(
        &mut self,
        sequences: &[S],
        logits: &mut [f32],
    ) -> Result<(), BatchProcessError> {
        if self.rows.is_empty() {
            self.rows = vec![self.prototype.clone(); sequences.len()];
            self.seen = vec![0; sequences.len()];
        } else if self.rows.len() != sequences.len() {
            return Err(BatchProcessError::BatchSizeChanged {
                expected: self.rows.len(),
                actual: sequences.len(),
            });
        }
        if sequences.is_empty() {
            return Ok(());
        }
        if logits.len() % sequences.len() != 0 {
            return Err(BatchProcessError::InvalidLogitsShape {
                rows: sequences.len(),
                len: logits.len(),
            });
        }
        let row_len = logits.len() / sequences.len();
        let rows = self
            .rows
            .iter_mut()
            .zip(self.seen.iter_mut())
            .zip(sequences.iter().zip(logits.chunks_mut(row_len)));
        for (row, ((processor, seen), (sequence, row_logits))) in rows.enumerate() {
            let sequence = sequence.as_ref();
            if sequence.len() < *seen {
                return Err(BatchProcessError::SequenceShrank {
                    row,
                    len: sequence.len(),
                    seen: *seen,
                });
            }
            for &token_id in &sequence[*seen..] {
                if processor.is_finished() {
                    break;
                }
                processor
                    .try_accept_new_token(token_id)
                    .map_err(|e| BatchProcessError::Row {
                        row,
                        error: e.into(),
                    })?;
            }
            *seen = sequence.len();
            processor.compute_allowed_token_ids();
            processor
                .mask_logits(row_logits)
                .map_err(|e| BatchProcessError::Row {
                    row,
                    error: e.into(),
                })?;
        }
        Ok(())
    }

    /// The per-row processors; empty before the first call.
    pub fn rows(&self) -> &[LogitsProcessor] {
        &self.rows
    }

    /// Forgets every row so the next call may use a different batch size.
    pub fn reset(&mut self) {
        self.rows.clear();
        self.seen.clear();
    }
}
