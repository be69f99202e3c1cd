//! Build-once caches for automata, token transition indices and grammars.
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use ahash::AHashMap;

use crate::automaton::{Automaton, BuildAutomatonError};
use crate::config::RegexConfig;
use crate::grammar::{CreateGrammarError, Grammar};
use crate::index::{BuildIndexError, TokenTransitionIndex};
use crate::vocabulary::Vocabulary;

type GrammarKey = (String, String, RegexConfig);

/// A read-mostly cache of compiled constraints.
///
/// Two threads missing the same key may both build it; the last insert wins and both results
/// are equal.
#[derive(Debug, Default)]
pub struct CompilationCache {
    automata: RwLock<AHashMap<(String, RegexConfig), Arc<Automaton>>>,
    indices: RwLock<AHashMap<(u64, u64), Arc<TokenTransitionIndex>>>,
    grammars: RwLock<AHashMap<GrammarKey, Arc<Grammar>>>,
}

fn get_or_build<K, V, E>(
    map: &RwLock<AHashMap<K, Arc<V>>>,
    key: K,
    build: impl FnOnce() -> Result<V, E>,
) -> Result<Arc<V>, E>
where
    K: std::hash::Hash + Eq,
{
    // Poisoning cannot leave a half-inserted entry.
    if let Some(value) = map
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
    {
        log::debug!("Compilation cache hit.");
        return Ok(value.clone());
    }
    let value = Arc::new(build()?);
    map.write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key, value.clone());
    Ok(value)
}

impl CompilationCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    pub fn global() -> &'static CompilationCache {
        static GLOBAL: OnceLock<CompilationCache> = OnceLock::new();
        GLOBAL.get_or_init(CompilationCache::new)
    }

    /// The automaton of `pattern`, built on first use.
    pub fn automaton(
        &self,
        pattern: &str,
        config: &RegexConfig,
    ) -> Result<Arc<Automaton>, BuildAutomatonError> {
        get_or_build(&self.automata, (pattern.to_string(), *config), || {
            Automaton::new(pattern, config)
        })
    }

    /// The index of `automaton` over `vocabulary`, built on first use.
    pub fn index(
        &self,
        automaton: &Arc<Automaton>,
        vocabulary: &Vocabulary,
    ) -> Result<Arc<TokenTransitionIndex>, BuildIndexError> {
        get_or_build(
            &self.indices,
            (automaton.fingerprint(), vocabulary.fingerprint()),
            || TokenTransitionIndex::new(automaton.clone(), vocabulary),
        )
    }

    /// The parsed grammar, built on first use.
    pub fn grammar(
        &self,
        text: &str,
        start_nonterminal: &str,
        config: &RegexConfig,
    ) -> Result<Arc<Grammar>, CreateGrammarError> {
        get_or_build(
            &self.grammars,
            (text.to_string(), start_nonterminal.to_string(), *config),
            || Grammar::new(text, start_nonterminal, config),
        )
    }

    /// The number of cached automata and indices.
    pub fn entry_counts(&self) -> (usize, usize) {
        (
            self.automata.read().unwrap_or_else(PoisonError::into_inner).len(),
            self.indices.read().unwrap_or_else(PoisonError::into_inner).len(),
        )
    }

    /// Drops every cached entry. Processors keep the entries they already hold.
    pub fn clear(&self) {
        self.automata.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.indices.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.grammars.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_shared() {
        let cache = CompilationCache::new();
        let config = RegexConfig::default();
        let a = cache.automaton("[0-9]+", &config).unwrap();
        let b = cache.automaton("[0-9]+", &config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let vocabulary =
            Vocabulary::from_token_strings([(0, "1"), (1, "23"), (2, "x")]).unwrap();
        let first = cache.index(&a, &vocabulary).unwrap();
        let second = cache.index(&b, &vocabulary).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.entry_counts(), (1, 1));
        cache.clear();
        assert_eq!(cache.entry_counts(), (0, 0));
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = CompilationCache::new();
        let vocabulary = Vocabulary::from_token_strings([(0, "a")]).unwrap();
        let automaton = cache.automaton("[0-9]", &RegexConfig::default()).unwrap();
        assert!(cache.index(&automaton, &vocabulary).is_err());
        assert_eq!(cache.entry_counts(), (1, 0));
    }

    #[test]
    fn global_is_a_singleton() {
        assert!(std::ptr::eq(CompilationCache::global(), CompilationCache::global()));
    }
}
