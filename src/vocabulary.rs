//! This module contains the `Vocabulary` struct, which represents a language model's vocabulary.
use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;
use serde::Deserialize;
use std::collections::hash_map::Entry;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use crate::utils;

const BYTES_NUM: usize = 257; // 256 + 1 because the offsets need one additional index.
const MAX_VOCABULARY_SIZE: usize = 0x1000000;

/// A wrapper struct that represents a token in bytes in a language model's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[repr(transparent)]
pub struct Token(pub Box<[u8]>);

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token(value.as_bytes().to_vec().into_boxed_slice())
    }
}

/// The struct represents a language model's vocabulary.
///
/// Besides the id ↔ token maps, the vocabulary keeps every matchable token id sorted by the
/// token's bytes, so tokens sharing a prefix are adjacent and tokens sharing a first byte
/// form one contiguous run.
#[derive(Clone)]
pub struct Vocabulary {
    pub(crate) token_to_id: AHashMap<Token, u32>,
    pub(crate) id_to_token: AHashMap<u32, Token>,
    pub(crate) id_to_token_string: AHashMap<u32, String>,
    sorted_token_ids: Vec<u32>,
    first_byte_offsets: Vec<usize>,
    eos_token_id: Option<u32>,
    vocab_size: usize,
    fingerprint: u64,
}

impl Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field(
                "id_to_token_string",
                &utils::get_deterministic_display_form_from_hash_map(
                    &self.id_to_token_string,
                    |(k, v)| (*k, v.clone()),
                ),
            )
            .field("eos_token_id", &self.eos_token_id)
            .field("vocab_size", &self.vocab_size)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for [Vocabulary] creation.
pub enum CreateVocabularyError {
    /// The vocabulary size exceeds the maximum supported size.
    #[error("The vocabulary size is {0}, while the maximum supported is {1}.")]
    VocabularyTooLarge(usize, usize),
    /// The end-of-sequence token id is not part of the vocabulary.
    #[error("The end-of-sequence token ID {0} does not exist in the vocabulary.")]
    UnknownEosTokenID(u32),
}

impl Vocabulary {
    /// Creates a new instance of [Vocabulary].
    ///
    /// # Arguments
    ///
    /// * `id_to_token` - A map from token IDs to tokens.
    /// * `id_to_token_string` - A map from token IDs to tokens in UTF-8 String representation.
    ///     This parameter is necessary because a token's UTF-8 representation may not be equivalent to the UTF-8 string decoded from its bytes,
    ///     vice versa. For example, a token may contain `0xFF` byte.
    pub fn new(
        id_to_token: AHashMap<u32, Token>,
        id_to_token_string: AHashMap<u32, String>,
    ) -> Result<Vocabulary, CreateVocabularyError> {
        if id_to_token.len() >= MAX_VOCABULARY_SIZE {
            return Err(CreateVocabularyError::VocabularyTooLarge(
                id_to_token.len(),
                MAX_VOCABULARY_SIZE,
            ));
        }
        let mut token_to_id = AHashMap::with_capacity(id_to_token.len());
        for (&token_id, token) in id_to_token.iter() {
            match token_to_id.entry(token.clone()) {
                Entry::Occupied(entry) => {
                    log::warn!(
                        "Token ID {} and token ID {} corresponds to the same token. \
                        The second token ID will be ignored when matching tokens to ids.",
                        entry.get(),
                        token_id
                    );
                }
                Entry::Vacant(entry) => {
                    entry.insert(token_id);
                }
            }
        }
        let vocab_size = id_to_token
            .keys()
            .copied()
            .max()
            .map(|x| x + 1)
            .unwrap_or(0) as usize;
        let mut vocabulary = Self {
            token_to_id,
            id_to_token,
            id_to_token_string,
            sorted_token_ids: Vec::new(),
            first_byte_offsets: Vec::new(),
            eos_token_id: None,
            vocab_size,
            fingerprint: 0,
        };
        vocabulary.rebuild_indices();
        vocabulary.check_vocabulary_utf8_support();
        Ok(vocabulary)
    }

    /// Creates a new instance of [Vocabulary] from UTF-8 token strings.
    /// The bytes of every token are the UTF-8 bytes of its string.
    pub fn from_token_strings<S: Into<String>>(
        tokens: impl IntoIterator<Item = (u32, S)>,
    ) -> Result<Vocabulary, CreateVocabularyError> {
        let id_to_token_string: AHashMap<u32, String> =
            tokens.into_iter().map(|(k, v)| (k, v.into())).collect();
        let id_to_token = id_to_token_string
            .iter()
            .map(|(k, v)| (*k, Token::from(v.as_str())))
            .collect();
        Self::new(id_to_token, id_to_token_string)
    }

    /// Designates the end-of-sequence token.
    ///
    /// The EOS token is never matched against a pattern; it is permitted exactly when the
    /// generated text is a complete member of the constrained language.
    pub fn with_eos_token_id(mut self, token_id: u32) -> Result<Vocabulary, CreateVocabularyError> {
        if !self.id_to_token.contains_key(&token_id) {
            return Err(CreateVocabularyError::UnknownEosTokenID(token_id));
        }
        self.eos_token_id = Some(token_id);
        self.rebuild_indices();
        Ok(self)
    }

    fn rebuild_indices(&mut self) {
        let mut sorted: Vec<(&[u8], u32)> = Vec::with_capacity(self.id_to_token.len());
        for (&token_id, token) in self.id_to_token.iter() {
            if Some(token_id) == self.eos_token_id {
                continue;
            }
            if token.0.is_empty() {
                log::warn!(
                    "Token ID {} corresponds to an empty token. The token will be ignored.",
                    token_id
                );
                continue;
            }
            sorted.push((&token.0, token_id));
        }
        sorted.sort_unstable();
        let mut first_byte_offsets = vec![0; BYTES_NUM];
        for (bytes, _) in sorted.iter() {
            first_byte_offsets[bytes[0] as usize + 1] += 1;
        }
        for i in 1..BYTES_NUM {
            first_byte_offsets[i] += first_byte_offsets[i - 1];
        }
        let sorted_token_ids: Vec<u32> = sorted.into_iter().map(|(_, id)| id).collect();
        let mut hasher = utils::stable_hasher();
        let mut ids: Vec<_> = self.id_to_token.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            id.hash(&mut hasher);
            self.id_to_token[&id].hash(&mut hasher);
        }
        self.eos_token_id.hash(&mut hasher);
        self.fingerprint = hasher.finish();
        self.sorted_token_ids = sorted_token_ids;
        self.first_byte_offsets = first_byte_offsets;
    }

    fn check_vocabulary_utf8_support(&self) {
        let mut present = [false; 256];
        for token in self.token_to_id.keys() {
            for &byte in token.0.iter() {
                present[byte as usize] = true;
            }
        }
        // 0xF8..=0xFF never occur in UTF-8.
        let mut not_existing_bytes = FixedBitSet::with_capacity(256);
        for byte in 0..=247usize {
            if !present[byte] {
                not_existing_bytes.insert(byte);
            }
        }
        if not_existing_bytes.count_ones(..) > 0 {
            log::warn!(
                "\
The following bytes are not present in any token: {:?}. \
This likely indicates that the vocabulary loading code is wrong, the tokenizer is doing some creepy processing \
or the tokenizer is not UTF-8 compatible. \
Patterns requiring these bytes cannot be generated.",
                utils::get_display_form_from_bitset(&not_existing_bytes)
            );
        }
    }

    /// Retrieves the token associated with the given token ID.
    ///
    /// # Arguments
    ///
    /// * `token_id` - The ID of the token to retrieve.
    ///
    /// # Returns
    ///
    /// * `Some(&Token)` - The token if it exists.
    /// * `None` - If the token ID is out of range.
    pub fn token(&self, token_id: u32) -> Option<&Token> {
        self.id_to_token.get(&token_id)
    }

    /// Retrieves the token string associated with the given token ID.
    ///
    /// # Arguments
    ///
    /// * `token_id` - The ID of the token to retrieve the string for.
    ///
    /// # Returns
    ///
    /// * `Some(&str)` - The token string if it exists.
    /// * `None` - If the token ID is out of range.
    pub fn token_string(&self, token_id: u32) -> Option<&str> {
        self.id_to_token_string.get(&token_id).map(|x| x.as_str())
    }
}
impl Vocabulary {
    /// Retrieves the token ID associated with the given token.
    ///
    /// # Arguments
    ///
    /// * `token` - The token to retrieve the ID for.
    ///
    /// # Returns
    ///
    /// * `Some(u32)` - The token ID if it exists.
    /// * `None` - If the token does not exist in the vocabulary.
    pub fn token_id(&self, token: &Token) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }
    /// Retrieves the size of the vocabulary, i.e. the largest token ID plus one.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
    /// Retrieves the end-of-sequence token ID, if any.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
    /// A stable hash of the token ids, their bytes and the EOS token id.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
    /// Concatenates the bytes of the given tokens. The EOS token and unknown IDs contribute nothing.
    pub fn decode(&self, token_ids: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for &token_id in token_ids {
            if Some(token_id) == self.eos_token_id {
                continue;
            }
            match self.id_to_token.get(&token_id) {
                Some(token) => bytes.extend_from_slice(&token.0),
                None => log::warn!("Token ID {} is not in the vocabulary.", token_id),
            }
        }
        bytes
    }
    /// Every matchable token ID, sorted by the token's bytes.
    pub(crate) fn sorted_token_ids(&self) -> &[u32] {
        &self.sorted_token_ids
    }
    /// The contiguous run of [`Vocabulary::sorted_token_ids`] whose tokens start with `byte`.
    pub(crate) fn tokens_from_first_byte(&self, byte: u8) -> &[u32] {
        let start = self.first_byte_offsets[byte as usize];
        let end = self.first_byte_offsets[byte as usize + 1];
        &self.sorted_token_ids[start..end]
    }
    /// The bytes of a token known to exist.
    #[inline]
    pub(crate) fn token_bytes(&self, token_id: u32) -> &[u8] {
        self.id_to_token.get(&token_id).map(|t| &t.0[..]).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        Vocabulary::from_token_strings([
            (0, "b"),
            (1, "ab"),
            (2, "a"),
            (3, "abc"),
            (5, "</s>"),
        ])
        .unwrap()
    }

    #[test]
    fn tokens_are_sorted_by_bytes() {
        let vocab = vocab();
        assert_eq!(vocab.sorted_token_ids(), &[5, 2, 1, 3, 0]);
        assert_eq!(vocab.tokens_from_first_byte(b'a'), &[2, 1, 3]);
        assert_eq!(vocab.tokens_from_first_byte(b'z'), &[] as &[u32]);
        assert_eq!(vocab.vocab_size(), 6);
    }

    #[test]
    fn eos_token_is_not_matchable() {
        let vocab = vocab().with_eos_token_id(5).unwrap();
        assert_eq!(vocab.eos_token_id(), Some(5));
        assert!(!vocab.sorted_token_ids().contains(&5));
        assert_eq!(vocab.decode(&[2, 0, 5]), b"ab".to_vec());
        assert!(matches!(
            vocab.with_eos_token_id(42),
            Err(CreateVocabularyError::UnknownEosTokenID(42))
        ));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = vocab();
        let b = vocab();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let c = vocab().with_eos_token_id(5).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
