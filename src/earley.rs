//! A byte-level Earley recognizer over a [`Grammar`].
//!
//! The recognizer keeps one Earley set per consumed byte, so the sets can be truncated to undo
//! a speculative walk. Regular expression symbols are scanned byte by byte through their
//! automata; the automaton state is stored in the item.
use std::sync::Arc;

use ahash::AHashSet;

use crate::grammar::{Grammar, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    nonterminal: u32,
    production: u32,
    dot: u32,
    origin: u32,
    /// Bytes of the terminal after the dot already matched, or the automaton state of the regex
    /// after the dot.
    progress: u32,
}

/// An incremental recognizer for the language of a grammar.
#[derive(Debug, Clone)]
pub struct EarleyRecognizer {
    grammar: Arc<Grammar>,
    sets: Vec<Vec<Item>>,
}

impl EarleyRecognizer {
    /// Creates a recognizer positioned before the first byte.
    pub fn new(grammar: Arc<Grammar>) -> Self {
        let mut recognizer = Self {
            grammar,
            sets: Vec::new(),
        };
        recognizer.reset();
        recognizer
    }

    /// Discards all consumed bytes.
    pub fn reset(&mut self) {
        self.sets.clear();
        let start = self.grammar.start();
        let seeds = (0..self.grammar.productions(start).len() as u32)
            .map(|production| self.predicted(start, production, 0))
            .collect();
        let set = self.closure(seeds);
        self.sets.push(set);
    }

    /// The grammar being recognized.
    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    fn symbol_at(&self, item: &Item) -> Option<Symbol> {
        self.grammar.productions(item.nonterminal)[item.production as usize]
            .get(item.dot as usize)
            .copied()
    }

    fn initial_progress(&self, symbol: Option<Symbol>) -> u32 {
        match symbol {
            Some(Symbol::Regex(regex)) => self.grammar.regex(regex).start(),
            _ => 0,
        }
    }

    fn predicted(&self, nonterminal: u32, production: u32, origin: u32) -> Item {
        let first = self.grammar.productions(nonterminal)[production as usize]
            .first()
            .copied();
        Item {
            nonterminal,
            production,
            dot: 0,
            origin,
            progress: self.initial_progress(first),
        }
    }

    fn advanced(&self, item: &Item) -> Item {
        let mut next = Item {
            dot: item.dot + 1,
            progress: 0,
            ..*item
        };
        next.progress = self.initial_progress(self.symbol_at(&next));
        next
    }

    /// Runs prediction and completion until the set at position `self.sets.len()` is closed.
    fn closure(&self, seeds: Vec<Item>) -> Vec<Item> {
        let position = self.sets.len() as u32;
        let mut seen: AHashSet<Item> = seeds.iter().copied().collect();
        let mut set = Vec::with_capacity(seeds.len());
        let mut pending = seeds;
        while let Some(item) = pending.pop() {
            set.push(item);
            let mut push = |new: Item| {
                if seen.insert(new) {
                    pending.push(new);
                }
            };
            match self.symbol_at(&item) {
                None => {
                    // Completions of items predicted in this very set are handled at prediction
                    // time through nullability.
                    if item.origin == position {
                        continue;
                    }
                    for parent in self.sets[item.origin as usize].iter() {
                        if self.symbol_at(parent) == Some(Symbol::Nonterminal(item.nonterminal)) {
                            push(self.advanced(parent));
                        }
                    }
                }
                Some(Symbol::Nonterminal(nonterminal)) => {
                    for production in 0..self.grammar.productions(nonterminal).len() as u32 {
                        push(self.predicted(nonterminal, production, position));
                    }
                    if self.grammar.is_nullable(nonterminal) {
                        push(self.advanced(&item));
                    }
                }
                Some(Symbol::Regex(regex)) => {
                    if self.grammar.regex(regex).is_accepting(item.progress) {
                        push(self.advanced(&item));
                    }
                }
                Some(Symbol::Terminal(_)) => {}
            }
        }
        set
    }

    /// Consumes one byte. Returns `false` and leaves the recognizer untouched if the byte cannot
    /// extend any prefix of the language.
    pub fn feed_byte(&mut self, byte: u8) -> bool {
        let mut seeds = Vec::new();
        let mut seen = AHashSet::default();
        for item in self.sets[self.sets.len() - 1].iter() {
            let scanned = match self.symbol_at(item) {
                Some(Symbol::Terminal(terminal)) => {
                    let bytes = self.grammar.terminal(terminal);
                    if bytes[item.progress as usize] != byte {
                        continue;
                    }
                    if item.progress as usize + 1 == bytes.len() {
                        self.advanced(item)
                    } else {
                        Item {
                            progress: item.progress + 1,
                            ..*item
                        }
                    }
                }
                Some(Symbol::Regex(regex)) => {
                    match self.grammar.regex(regex).next_state(item.progress, byte) {
                        Some(state) => Item {
                            progress: state,
                            ..*item
                        },
                        None => continue,
                    }
                }
                _ => continue,
            };
            if seen.insert(scanned) {
                seeds.push(scanned);
            }
        }
        if seeds.is_empty() {
            return false;
        }
        let set = self.closure(seeds);
        self.sets.push(set);
        true
    }

    /// Consumes `bytes` one at a time. On failure the recognizer is restored to its prior state.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> bool {
        let checkpoint = self.checkpoint();
        for &byte in bytes {
            if !self.feed_byte(byte) {
                self.restore(checkpoint);
                return false;
            }
        }
        true
    }

    /// A position that [`restore`](Self::restore) can return to.
    pub fn checkpoint(&self) -> usize {
        self.sets.len()
    }

    /// Undoes every byte consumed after `checkpoint`.
    pub fn restore(&mut self, checkpoint: usize) {
        self.sets.truncate(checkpoint.max(1));
    }

    /// Whether the bytes consumed so far form a complete sentence.
    pub fn is_accepting(&self) -> bool {
        let start = self.grammar.start();
        self.sets[self.sets.len() - 1].iter().any(|item| {
            item.nonterminal == start && item.origin == 0 && self.symbol_at(item).is_none()
        })
    }

    /// Whether some byte can still be consumed.
    pub fn can_continue(&self) -> bool {
        self.sets[self.sets.len() - 1]
            .iter()
            .any(|item| match self.symbol_at(item) {
                Some(Symbol::Terminal(_)) => true,
                Some(Symbol::Regex(regex)) => self.grammar.regex(regex).can_continue(item.progress),
                _ => false,
            })
    }

    /// The number of bytes consumed so far.
    pub fn consumed_len(&self) -> usize {
        self.sets.len() - 1
    }
}
