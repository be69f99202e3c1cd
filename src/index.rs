//! The token transition index: which vocabulary tokens each automaton state permits.
use std::fmt::Debug;
use std::sync::Arc;

use fixedbitset_stack::FixedBitSet;

use crate::automaton::Automaton;
use crate::utils;
use crate::vocabulary::Vocabulary;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
/// The error type for [TokenTransitionIndex] creation.
pub enum BuildIndexError {
    /// No sequence of vocabulary tokens leads from the start state to an accepting state.
    #[error("No sequence of tokens in the vocabulary matches the pattern `{0}`.")]
    NoTokenPath(String),
}

/// For every automaton state, the tokens that keep the walk alive and the states they lead to.
///
/// The EOS token is permitted exactly in accepting states. Tokens leading into states from which
/// no token sequence reaches acceptance are removed, so a masked generation can never get stuck.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenTransitionIndex {
    automaton: Arc<Automaton>,
    transitions: Vec<Vec<(u32, u32)>>,
    allowed: Vec<FixedBitSet>,
    eos_token_id: Option<u32>,
    vocab_size: usize,
    vocab_fingerprint: u64,
}

impl Debug for TokenTransitionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenTransitionIndex")
            .field("automaton", &self.automaton)
            .field(
                "allowed_token_ids",
                &self
                    .allowed
                    .iter()
                    .map(utils::get_display_form_from_bitset)
                    .collect::<Vec<_>>(),
            )
            .field("eos_token_id", &self.eos_token_id)
            .finish()
    }
}

impl TokenTransitionIndex {
    /// Walks every token of `vocabulary` from every state of `automaton`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildIndexError::NoTokenPath`] when the vocabulary cannot spell any string the
    /// automaton accepts.
    pub fn new(automaton: Arc<Automaton>, vocabulary: &Vocabulary) -> Result<Self, BuildIndexError> {
        let state_count = automaton.state_count();
        let mut transitions: Vec<Vec<(u32, u32)>> = (0..state_count as u32)
            .map(|state| Self::walk_vocabulary(&automaton, vocabulary, state))
            .collect();
        let live = Self::co_reachable(&automaton, &transitions);
        for row in transitions.iter_mut() {
            row.retain(|&(_, next)| live[next as usize]);
        }
        if !live[automaton.start() as usize] {
            return Err(BuildIndexError::NoTokenPath(automaton.pattern().to_string()));
        }
        let eos_token_id = vocabulary.eos_token_id();
        let allowed = transitions
            .iter()
            .enumerate()
            .map(|(state, row)| {
                let mut set = FixedBitSet::with_capacity(vocabulary.vocab_size());
                for &(token_id, _) in row.iter() {
                    set.insert(token_id as usize);
                }
                if let Some(eos) = eos_token_id {
                    if automaton.is_accepting(state as u32) {
                        set.insert(eos as usize);
                    }
                }
                set
            })
            .collect();
        log::debug!(
            "Built a token transition index over {} states ({} live) with {} transitions.",
            state_count,
            live.iter().filter(|&&l| l).count(),
            transitions.iter().map(Vec::len).sum::<usize>()
        );
        Ok(Self {
            automaton,
            transitions,
            allowed,
            eos_token_id,
            vocab_size: vocabulary.vocab_size(),
            vocab_fingerprint: vocabulary.fingerprint(),
        })
    }

    /// The states from which some token sequence reaches an accepting state.
    ///
    /// A state with outgoing tokens may still be dead when every token loops back into a region
    /// that never accepts, so liveness is computed backwards from the accepting states.
    fn co_reachable(automaton: &Automaton, transitions: &[Vec<(u32, u32)>]) -> Vec<bool> {
        let mut predecessors = vec![Vec::new(); transitions.len()];
        for (state, row) in transitions.iter().enumerate() {
            for &(_, next) in row {
                predecessors[next as usize].push(state as u32);
            }
        }
        let mut live = vec![false; transitions.len()];
        let mut stack: Vec<u32> = automaton.accepting_states().collect();
        while let Some(state) = stack.pop() {
            if std::mem::replace(&mut live[state as usize], true) {
                continue;
            }
            stack.extend(
                predecessors[state as usize]
                    .iter()
                    .copied()
                    .filter(|&p| !live[p as usize]),
            );
        }
        live
    }

    /// Walks all tokens from `state`, sharing the walk of common prefixes.
    fn walk_vocabulary(automaton: &Automaton, vocabulary: &Vocabulary, state: u32) -> Vec<(u32, u32)> {
        let mut row = Vec::new();
        // states[k] is the state after the first k bytes of `previous`.
        let mut states: Vec<u32> = Vec::new();
        for first_byte in 0..=u8::MAX {
            if automaton.next_state(state, first_byte).is_none() {
                continue;
            }
            let token_ids = vocabulary.tokens_from_first_byte(first_byte);
            let mut previous: &[u8] = &[];
            states.clear();
            states.push(state);
            let mut i = 0;
            while i < token_ids.len() {
                let token_id = token_ids[i];
                let bytes = vocabulary.token_bytes(token_id);
                let shared = utils::common_prefix_len(previous, bytes).min(states.len() - 1);
                states.truncate(shared + 1);
                let mut failed_at = None;
                for (k, &byte) in bytes.iter().enumerate().skip(shared) {
                    // `states` is never empty: it always holds `state` at index 0.
                    match automaton.next_state(states[states.len() - 1], byte) {
                        Some(next) => states.push(next),
                        None => {
                            failed_at = Some(k);
                            break;
                        }
                    }
                }
                previous = bytes;
                i += 1;
                match failed_at {
                    Some(k) => {
                        // Sorted order keeps every token with the failing prefix right here.
                        let failing_prefix = &bytes[..=k];
                        i += token_ids[i..].partition_point(|&id| {
                            vocabulary.token_bytes(id).starts_with(failing_prefix)
                        });
                    }
                    None => row.push((token_id, states[states.len() - 1])),
                }
            }
        }
        row.sort_unstable();
        row
    }

    /// The automaton this index was built for.
    pub fn automaton(&self) -> &Arc<Automaton> {
        &self.automaton
    }

    /// The state a generation starts in.
    pub fn initial_state(&self) -> u32 {
        self.automaton.start()
    }

    /// The state reached by emitting `token_id` in `state`, or `None` if the token is not permitted.
    /// The EOS token never has a next state.
    pub fn next_state(&self, state: u32, token_id: u32) -> Option<u32> {
        let row = &self.transitions[state as usize];
        row.binary_search_by_key(&token_id, |&(id, _)| id)
            .ok()
            .map(|i| row[i].1)
    }

    /// The permitted tokens in `state`, EOS included when the state is accepting.
    pub fn allowed_token_ids(&self, state: u32) -> &FixedBitSet {
        &self.allowed[state as usize]
    }

    /// The `(token id, next state)` pairs of `state`, sorted by token id.
    pub fn transitions(&self, state: u32) -> &[(u32, u32)] {
        &self.transitions[state as usize]
    }

    /// Whether `state` is accepting.
    pub fn is_accepting(&self, state: u32) -> bool {
        self.automaton.is_accepting(state)
    }

    /// Whether no token other than EOS is permitted in `state`.
    pub fn has_no_continuation(&self, state: u32) -> bool {
        self.transitions[state as usize].is_empty()
    }

    /// Whether some token sequence leads from `state` to an accepting state.
    ///
    /// Every state is covered, including the ones only reachable by stopping inside a token.
    pub fn is_live(&self, state: u32) -> bool {
        self.is_accepting(state) || !self.transitions[state as usize].is_empty()
    }

    /// The number of automaton states.
    pub fn state_count(&self) -> usize {
        self.transitions.len()
    }

    /// The EOS token id of the vocabulary.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// The size of the vocabulary the index was built for.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The cache key of the index: the automaton and vocabulary fingerprints.
    pub fn key(&self) -> (u64, u64) {
        (self.automaton.fingerprint(), self.vocab_fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegexConfig;

    fn vocabulary(tokens: &[&str]) -> Vocabulary {
        Vocabulary::from_token_strings(tokens.iter().enumerate().map(|(i, t)| (i as u32, *t)))
            .unwrap()
    }

    fn index(pattern: &str, vocabulary: &Vocabulary) -> Result<TokenTransitionIndex, BuildIndexError> {
        let automaton = Automaton::new(pattern, &RegexConfig::default()).unwrap();
        TokenTransitionIndex::new(Arc::new(automaton), vocabulary)
    }

    #[test]
    fn multi_byte_tokens_are_walked_whole() {
        let vocab = vocabulary(&["a", "ab", "abc", "b", "c", "bd"]);
        let index = index("abc", &vocab).unwrap();
        let start = index.initial_state();
        let allowed = utils::get_display_form_from_bitset(index.allowed_token_ids(start));
        assert_eq!(allowed, vec![0, 1, 2]);
        let after_ab = index.next_state(start, 1).unwrap();
        assert_eq!(index.transitions(after_ab), &[(4, index.next_state(after_ab, 4).unwrap())]);
        let end = index.next_state(start, 2).unwrap();
        assert!(index.is_accepting(end));
        assert!(index.has_no_continuation(end));
        assert_eq!(index.next_state(start, 3), None);
    }

    #[test]
    fn dead_ends_are_pruned() {
        // "x" can be read but the vocabulary can never spell the "y" that must follow.
        let vocab = vocabulary(&["x", "z", "xz"]);
        let index = index("xy|z", &vocab).unwrap();
        let start = index.initial_state();
        assert_eq!(
            utils::get_display_form_from_bitset(index.allowed_token_ids(start)),
            vec![1]
        );
        for state in 0..index.state_count() as u32 {
            for &(_, next) in index.transitions(state) {
                assert!(index.is_accepting(next) || !index.has_no_continuation(next));
            }
        }
    }

    #[test]
    fn no_token_path() {
        let vocab = vocabulary(&["a", "b"]);
        assert_eq!(
            index("[0-9]", &vocab),
            Err(BuildIndexError::NoTokenPath("[0-9]".to_string()))
        );
    }

    #[test]
    fn token_cycles_without_exit_are_rejected() {
        // "a" loops forever but no token spells the final "b".
        let vocab = vocabulary(&["a", "c"]);
        assert_eq!(
            index("a+b", &vocab),
            Err(BuildIndexError::NoTokenPath("a+b".to_string()))
        );
        let vocab = vocabulary(&["a", "c", "ab"]);
        let index = index("a+b|c", &vocab).unwrap();
        let start = index.initial_state();
        let after_a = index.next_state(start, 0).unwrap();
        assert!(index.is_live(after_a));
        // Reading "a" twice still leaves "ab" to finish the match.
        assert!(index.next_state(after_a, 0).is_some());
        assert!(index.next_state(after_a, 2).is_some_and(|s| index.is_accepting(s)));
        assert!(index.transitions(after_a).iter().all(|&(_, next)| index.is_live(next)));
    }

    #[test]
    fn eos_only_in_accepting_states() {
        let vocab = vocabulary(&["1", "2", "12", "</s>"]).with_eos_token_id(3).unwrap();
        let index = index("[0-9]+", &vocab).unwrap();
        let start = index.initial_state();
        assert!(!index.allowed_token_ids(start).contains(3));
        let after_one = index.next_state(start, 0).unwrap();
        assert!(index.allowed_token_ids(after_one).contains(3));
        assert_eq!(index.next_state(after_one, 3), None);
    }

    #[test]
    fn building_twice_is_identical() {
        let vocab = vocabulary(&["{", "}", "\"", "a", "ge", "age", ":", "1", "12", " "]);
        let pattern = r#"\{"age":[0-9]+\}"#;
        let first = index(pattern, &vocab).unwrap();
        let second = index(pattern, &vocab).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.key(), second.key());
    }
}
