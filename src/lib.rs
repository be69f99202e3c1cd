/*!
# kstruct

This crate provides structured generation for language models.
An output type, such as a regular expression, a JSON schema, a native record type, a set of
choices or a context-free grammar, is compiled into a constraint that decides, at every step of
decoding, which tokens of the model's vocabulary may come next. Forbidden tokens have their logits
set to negative infinity, so the generated text always belongs to the language of the output type.

Here is a quick example of how this crate works:

```rust
use std::sync::Arc;
use kstruct::{AcceptTokenResult, LogitsProcessor, ProcessorLike, TypeDescriptor, Vocabulary};
let vocab = Vocabulary::from_token_strings([(0, "1"), (1, "2"), (2, "a"), (3, "</s>")])
    .unwrap()
    .with_eos_token_id(3)
    .unwrap();
let output_type = TypeDescriptor::Regex("[0-9]{2}".to_string());
let mut processor = LogitsProcessor::new(&output_type, Arc::new(vocab)).unwrap();
let mut logits = [0.0, 0.0, 0.0, 0.0]; // logits obtained from the language model
processor.mask_logits(&mut logits).unwrap();
assert_eq!(&format!("{:?}", logits), "[0.0, 0.0, -inf, -inf]");
assert_eq!(
    processor.try_accept_new_token(0).unwrap(),
    AcceptTokenResult::Ongoing
);
assert_eq!(
    processor.try_accept_new_token(1).unwrap(),
    AcceptTokenResult::Finished
);
processor.compute_allowed_token_ids();
let mut logits = [0.0, 0.0, 0.0, 0.0];
processor.mask_logits(&mut logits).unwrap();
assert_eq!(&format!("{:?}", logits), "[-inf, -inf, -inf, 0.0]");
```

# Overview

The primary types in this crate are [ProcessorLike] and [LogitsProcessor]. [ProcessorLike]
defines the behavior of a processor, while [LogitsProcessor] picks the right implementation for
an output type:

- [LogitsProcessor::new]: creates a processor from a [TypeDescriptor] and a [Vocabulary] with the
  default configuration. [LogitsProcessor::with_config] allows you to specify a custom [Config].
- [ProcessorLike::update_logits]: accepts a new token and then masks the logits accordingly.
- [ProcessorLike::reset]: returns the processor to its initial state. Caches are preserved.

Regular output types (primitives, choices, enums, regular expressions and JSON schemas) are
compiled into a regular expression, then into an [Automaton](automaton::Automaton), then into a
[TokenTransitionIndex](index::TokenTransitionIndex) that maps every automaton state to its
permitted tokens. Grammars are parsed into a [Grammar] and enforced by an Earley recognizer.

Backends without a logits hook can use [SchemaOnlyTypeAdapter](adapter::SchemaOnlyTypeAdapter),
which turns an output type into a JSON schema string instead.

# Grammar syntax

```ebnf
(* A comment. *)
start ::= item* ;
item ::= "(" start ")" | 'x' | #"[0-9]+" ;
```

- Terminals are enclosed in double or single quotes. `\n`, `\r`, `\t`, `\0`, `\\`, `\"`, `\'`
  and `\xHH` escapes are supported.
- `#"..."` is a regular expression terminal.
- `( )` groups, `[ ]` or a trailing `?` makes a symbol optional, `{ }` or a trailing `*` repeats it
  zero or more times and a trailing `+` repeats it one or more times.
- A nonterminal may be defined several times; its alternatives are merged.

By default, generation starts from the nonterminal `start`; see [Config::start_nonterminal].

# Performance

Automata and indices are built once per pattern and vocabulary and shared through
[CompilationCache](cache::CompilationCache). Reuse a processor across generations: grammar
processors memoize their allowed tokens and keep the memo across [ProcessorLike::reset]. The memo
is bounded by [MAX_CACHED_PREFIXES](grammar_processor::MAX_CACHED_PREFIXES) and favours short
prefixes, which every generation revisits.
Prefer regular expressions over grammars when the language is regular.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod adapter;
pub mod automaton;
pub mod batch;
pub mod cache;
pub mod config;
pub mod earley;
pub mod fsm_processor;
pub mod grammar;
pub mod grammar_processor;
pub mod index;
pub mod json_schema;
pub mod pattern;
pub mod processor;
pub mod processor_like;
pub mod schema_builder;
pub mod terms;
pub mod types;
pub mod utils;
pub mod vocabulary;
pub use batch::BatchLogitsProcessor;
pub use config::Config;
pub use grammar::Grammar;
pub use processor::LogitsProcessor;
pub use processor_like::AcceptTokenResult;
pub use processor_like::ProcessorLike;
pub use schema_builder::SchemaBuilder;
pub use types::TypeDescriptor;
pub use vocabulary::Token;
pub use vocabulary::Vocabulary;
