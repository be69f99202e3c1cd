//! The automaton module that turns a regular expression into a pruned byte-level DFA.
//!
//! The DFA is determinized by `kbnf_regex_automata` and then copied into [`Automaton`], a compact
//! table with dense state ids, byte equivalence classes and only *live* states: states from which
//! an accepting state is still reachable. Every transition into a state that cannot lead to
//! acceptance is dropped, so a walk that stays inside the table can always be completed.
use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use ahash::AHashMap;
use kbnf_regex_automata::dfa::{dense, Automaton as _, StartKind};
use kbnf_regex_automata::util::primitives::StateID;
use kbnf_regex_automata::util::start;
use kbnf_regex_automata::{Anchored, MatchKind};
use nonmax::NonMaxU32;

use crate::config::RegexConfig;
use crate::utils;

#[derive(Debug, thiserror::Error)]
/// The error type for [Automaton] creation.
pub enum BuildAutomatonError {
    /// The pattern is longer than [`RegexConfig::max_pattern_length`].
    #[error("The pattern is {0} bytes long, while the maximum allowed is {1}.")]
    PatternTooLong(usize, usize),
    /// The DFA could not be built, usually because of a syntax error or the memory limit.
    #[error("Failed to build the DFA: {0}")]
    Build(#[from] dense::BuildError),
    /// The DFA has no anchored start state.
    #[error("Failed to compute the start state of the DFA: {0}")]
    Start(#[from] kbnf_regex_automata::dfa::StartError),
    /// The pattern accepts no string at all.
    #[error("The pattern `{0}` does not accept any string.")]
    EmptyLanguage(String),
}

/// A deterministic finite automaton over bytes that only contains live states.
#[derive(Clone, PartialEq, Eq)]
pub struct Automaton {
    pattern: String,
    start: u32,
    byte_classes: Vec<u8>,
    alphabet_len: usize,
    transitions: Vec<Option<NonMaxU32>>,
    accepting: Vec<bool>,
    can_continue: Vec<bool>,
    fingerprint: u64,
}

impl Debug for Automaton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automaton")
            .field("pattern", &self.pattern)
            .field("start", &self.start)
            .field("state_count", &self.state_count())
            .field("alphabet_len", &self.alphabet_len)
            .field("accepting_states", &self.accepting_states().collect::<Vec<_>>())
            .finish()
    }
}

impl Hash for Automaton {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl Automaton {
    /// Builds the automaton of a regular expression.
    ///
    /// The whole input must match the pattern: the DFA is anchored at the start and a state is
    /// accepting when a match ends exactly at the end of input.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildAutomatonError`] when the pattern is too long, cannot be compiled within
    /// the memory limit, or accepts nothing.
    pub fn new(pattern: &str, config: &RegexConfig) -> Result<Automaton, BuildAutomatonError> {
        if let Some(max) = config.max_pattern_length {
            if pattern.len() > max {
                return Err(BuildAutomatonError::PatternTooLong(pattern.len(), max));
            }
        }
        let dfa_config = dense::Config::new()
            .start_kind(StartKind::Anchored)
            .match_kind(MatchKind::All)
            .dfa_size_limit(config.max_memory_usage)
            .determinize_size_limit(config.max_memory_usage);
        let dfa = dense::Builder::new().configure(dfa_config).build(pattern)?;
        let start_id = dfa.start_state(&start::Config::new().anchored(Anchored::Yes))?;
        Self::from_dfa(pattern, &dfa, start_id)
    }

    fn from_dfa(
        pattern: &str,
        dfa: &dense::DFA<Vec<u32>>,
        start_id: StateID,
    ) -> Result<Automaton, BuildAutomatonError> {
        let is_reject =
            |id: StateID| dfa.is_special_state(id) && (dfa.is_dead_state(id) || dfa.is_quit_state(id));
        if is_reject(start_id) {
            return Err(BuildAutomatonError::EmptyLanguage(pattern.to_string()));
        }
        // Breadth-first discovery in byte order keeps the numbering deterministic.
        let mut ids: AHashMap<StateID, u32> = AHashMap::default();
        let mut order: Vec<StateID> = vec![start_id];
        ids.insert(start_id, 0);
        let mut raw: Vec<[Option<u32>; 256]> = Vec::new();
        let mut accepting = Vec::new();
        let mut cursor = 0;
        while cursor < order.len() {
            let sid = order[cursor];
            cursor += 1;
            let mut row = [None; 256];
            for byte in 0..=u8::MAX {
                let next = dfa.next_state(sid, byte);
                if is_reject(next) {
                    continue;
                }
                let next_index = *ids.entry(next).or_insert_with(|| {
                    order.push(next);
                    (order.len() - 1) as u32
                });
                row[byte as usize] = Some(next_index);
            }
            raw.push(row);
            accepting.push(dfa.is_match_state(dfa.next_eoi_state(sid)));
        }
        let live = Self::live_states(&raw, &accepting);
        if !live[0] {
            return Err(BuildAutomatonError::EmptyLanguage(pattern.to_string()));
        }
        let mut renumbered = vec![None; raw.len()];
        let mut count = 0u32;
        for (old, &is_live) in live.iter().enumerate() {
            if is_live {
                renumbered[old] = Some(count);
                count += 1;
            }
        }
        let live_rows: Vec<[Option<u32>; 256]> = raw
            .iter()
            .enumerate()
            .filter(|(old, _)| live[*old])
            .map(|(_, row)| row.map(|next| next.and_then(|n| renumbered[n as usize])))
            .collect();
        let accepting: Vec<bool> = accepting
            .iter()
            .enumerate()
            .filter(|(old, _)| live[*old])
            .map(|(_, &a)| a)
            .collect();
        let (byte_classes, alphabet_len) = Self::byte_classes(&live_rows);
        let mut transitions = vec![None; live_rows.len() * alphabet_len];
        for (state, row) in live_rows.iter().enumerate() {
            for byte in 0..256 {
                let class = byte_classes[byte] as usize;
                transitions[state * alphabet_len + class] = row[byte].and_then(NonMaxU32::new);
            }
        }
        let can_continue = live_rows
            .iter()
            .map(|row| row.iter().any(|n| n.is_some()))
            .collect();
        let mut automaton = Automaton {
            pattern: pattern.to_string(),
            start: 0,
            byte_classes,
            alphabet_len,
            transitions,
            accepting,
            can_continue,
            fingerprint: 0,
        };
        automaton.fingerprint = automaton.structural_fingerprint();
        log::debug!(
            "Built an automaton with {} live states and {} byte classes for `{}`.",
            automaton.state_count(),
            automaton.alphabet_len,
            pattern
        );
        Ok(automaton)
    }

    /// Backward reachability from the accepting states.
    fn live_states(raw: &[[Option<u32>; 256]], accepting: &[bool]) -> Vec<bool> {
        let mut reverse: Vec<Vec<u32>> = vec![Vec::new(); raw.len()];
        for (state, row) in raw.iter().enumerate() {
            for next in row.iter().flatten() {
                reverse[*next as usize].push(state as u32);
            }
        }
        let mut live = accepting.to_vec();
        let mut queue: VecDeque<usize> = (0..raw.len()).filter(|&s| accepting[s]).collect();
        while let Some(state) = queue.pop_front() {
            for &previous in reverse[state].iter() {
                if !live[previous as usize] {
                    live[previous as usize] = true;
                    queue.push_back(previous as usize);
                }
            }
        }
        live
    }

    /// Groups bytes whose transition columns are identical in every state.
    fn byte_classes(rows: &[[Option<u32>; 256]]) -> (Vec<u8>, usize) {
        let mut classes = vec![0u8; 256];
        let mut seen: AHashMap<Vec<Option<u32>>, u8> = AHashMap::default();
        for byte in 0..256 {
            let column: Vec<Option<u32>> = rows.iter().map(|row| row[byte]).collect();
            let next_class = seen.len() as u8;
            classes[byte] = *seen.entry(column).or_insert(next_class);
        }
        let alphabet_len = seen.len();
        (classes, alphabet_len)
    }

    fn structural_fingerprint(&self) -> u64 {
        let mut hasher = utils::stable_hasher();
        self.start.hash(&mut hasher);
        self.byte_classes.hash(&mut hasher);
        self.alphabet_len.hash(&mut hasher);
        for next in self.transitions.iter() {
            next.map_or(u32::MAX, |n| n.get()).hash(&mut hasher);
        }
        self.accepting.hash(&mut hasher);
        hasher.finish()
    }

    /// The start state.
    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// The state reached by feeding `byte` in `state`, or `None` for the reject sink.
    #[inline]
    pub fn next_state(&self, state: u32, byte: u8) -> Option<u32> {
        let class = self.byte_classes[byte as usize] as usize;
        self.transitions[state as usize * self.alphabet_len + class].map(|n| n.get())
    }

    /// Feeds every byte in order. Returns `None` as soon as a byte is rejected.
    pub fn walk(&self, state: u32, bytes: &[u8]) -> Option<u32> {
        bytes
            .iter()
            .try_fold(state, |state, &byte| self.next_state(state, byte))
    }

    /// Whether the input read so far is a complete match when `state` is reached.
    #[inline]
    pub fn is_accepting(&self, state: u32) -> bool {
        self.accepting[state as usize]
    }

    /// Whether at least one byte can be fed in `state`.
    #[inline]
    pub fn can_continue(&self, state: u32) -> bool {
        self.can_continue[state as usize]
    }

    /// Whether the whole input is accepted.
    pub fn accepts(&self, bytes: &[u8]) -> bool {
        self.walk(self.start, bytes)
            .is_some_and(|state| self.is_accepting(state))
    }

    /// The number of live states.
    pub fn state_count(&self) -> usize {
        self.accepting.len()
    }

    /// The number of byte equivalence classes.
    pub fn alphabet_len(&self) -> usize {
        self.alphabet_len
    }

    /// Iterates over the accepting states in ascending order.
    pub fn accepting_states(&self) -> impl Iterator<Item = u32> + '_ {
        self.accepting
            .iter()
            .enumerate()
            .filter(|(_, &a)| a)
            .map(|(s, _)| s as u32)
    }

    /// The pattern this automaton was built from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// A stable hash of the automaton's structure.
    /// Two automata accepting the same language through the same construction share it.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(pattern: &str) -> Automaton {
        Automaton::new(pattern, &RegexConfig::default()).unwrap()
    }

    #[test]
    fn single_digit() {
        let automaton = build("[0-9]");
        assert!(automaton.accepts(b"7"));
        assert!(!automaton.accepts(b""));
        assert!(!automaton.accepts(b"12"));
        assert!(!automaton.accepts(b"a"));
        assert_eq!(automaton.state_count(), 2);
    }

    #[test]
    fn prefixes_are_not_cut_by_match_priority() {
        let automaton = build("a|ab");
        assert!(automaton.accepts(b"a"));
        assert!(automaton.accepts(b"ab"));
        let after_a = automaton.next_state(automaton.start(), b'a').unwrap();
        assert!(automaton.is_accepting(after_a));
        assert!(automaton.can_continue(after_a));
    }

    #[test]
    fn dead_branches_are_pruned() {
        // After "x" nothing can ever match, so the transition must not exist.
        let automaton = build("ab|x[^\\x00-\\x{10FFFF}]");
        assert!(automaton.next_state(automaton.start(), b'x').is_none());
        assert!(automaton.accepts(b"ab"));
    }

    #[test]
    fn every_state_is_live() {
        let automaton = build("(foo|bar)+baz");
        for state in 0..automaton.state_count() as u32 {
            assert!(automaton.is_accepting(state) || automaton.can_continue(state));
        }
    }

    #[test]
    fn empty_language_is_rejected() {
        let result = Automaton::new("[^\\x00-\\x{10FFFF}]", &RegexConfig::default());
        assert!(matches!(result, Err(BuildAutomatonError::EmptyLanguage(_))));
    }

    #[test]
    fn pattern_length_limit() {
        let config = RegexConfig {
            max_pattern_length: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            Automaton::new("abcd", &config),
            Err(BuildAutomatonError::PatternTooLong(4, 3))
        ));
    }

    #[test]
    fn construction_is_deterministic() {
        let a = build(r#"\{"age":(0|[1-9][0-9]*)\}"#);
        let b = build(r#"\{"age":(0|[1-9][0-9]*)\}"#);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn multibyte_characters_are_walked_bytewise() {
        let automaton = build("你好");
        let bytes = "你好".as_bytes();
        let halfway = automaton.walk(automaton.start(), &bytes[..2]).unwrap();
        assert!(!automaton.is_accepting(halfway));
        assert!(automaton.accepts(bytes));
    }
}
