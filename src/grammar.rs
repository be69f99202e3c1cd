//! The grammar module that contains the [`Grammar`] struct and the EBNF-like grammar parser.
//!
//! A grammar is a sequence of rules `name ::= expression ;`. Expressions are built from
//! double- or single-quoted terminals, regular expressions written `#"..."`, nonterminal
//! names, grouping `( )`, options `[ ]` or `?`, repetitions `{ }` or `*`, `+`, and
//! alternation `|`. Comments are written `(* ... *)`.
//!
//! After parsing, groups and repetitions are lowered into fresh nonterminals so every production
//! is a flat sequence of [`Symbol`]s.
use std::fmt::{Debug, Display};
use std::sync::Arc;

use ahash::AHashMap;
use nom::branch::alt;
use nom::bytes::complete::{escaped, tag, take_until};
use nom::character::complete::{alpha1, alphanumeric1, anychar, char, multispace1, none_of, one_of};
use nom::combinator::{all_consuming, cut, map, map_res, opt, recognize, value};
use nom::error::{context, VerboseError};
use nom::multi::{many0, many0_count, many1};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;
use string_interner::{DefaultStringInterner, Symbol as _};

use crate::automaton::{Automaton, BuildAutomatonError};
use crate::config::RegexConfig;
use crate::pattern::{self, CompilePatternError};

#[derive(Debug, thiserror::Error)]
/// The error type for errors in [Grammar] creation.
pub enum CreateGrammarError {
    #[error("Grammar parsing error: {0}")]
    /// The grammar text is malformed.
    Syntax(#[from] nom::Err<VerboseError<String>>),
    #[error("The nonterminal `{0}` is used but never defined.")]
    /// A nonterminal is referenced without a rule.
    UndefinedNonterminal(String),
    #[error("The start nonterminal `{0}` is not defined.")]
    /// The configured start nonterminal has no rule.
    MissingStartNonterminal(String),
    #[error("The grammar does not accept any string.")]
    /// No finite derivation exists for the start nonterminal.
    EmptyLanguage,
    #[error("Invalid regular expression in the grammar: {0}")]
    /// A regular expression uses unsupported or invalid syntax.
    Regex(#[from] CompilePatternError),
    #[error("Failed to build a regular expression of the grammar: {0}")]
    /// A regular expression could not be turned into an automaton.
    RegexAutomaton(#[from] BuildAutomatonError),
}

/// A symbol on the right-hand side of a production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    /// A literal byte string, by terminal id.
    Terminal(u32),
    /// A regular expression, by regex id.
    Regex(u32),
    /// A nonterminal, by nonterminal id.
    Nonterminal(u32),
}

/// A context-free grammar in flattened form.
pub struct Grammar {
    nonterminal_names: Vec<String>,
    productions: Vec<Vec<Box<[Symbol]>>>,
    nullable: Vec<bool>,
    terminals: Vec<Box<[u8]>>,
    regexes: Vec<Arc<Automaton>>,
    start: u32,
}

#[derive(Debug, Clone)]
enum Node {
    Terminal(Vec<u8>),
    Regex(String),
    Nonterminal(String),
    Group(Vec<Vec<Node>>),
    Optional(Box<Node>),
    ZeroOrMore(Box<Node>),
    OneOrMore(Box<Node>),
}

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

fn comment(input: &str) -> Res<&str> {
    recognize(tuple((tag("(*"), take_until("*)"), tag("*)"))))(input)
}

fn ws(input: &str) -> Res<()> {
    value((), many0_count(alt((multispace1, comment))))(input)
}

fn identifier(input: &str) -> Res<&str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    move |input| {
        let normal = if quote == '"' { "\\\"" } else { "\\'" };
        delimited(
            char(quote),
            map(opt(escaped(none_of(normal), '\\', anychar)), Option::unwrap_or_default),
            cut(char(quote)),
        )(input)
    }
}

fn unescape(text: &str) -> Result<Vec<u8>, String> {
    let mut bytes = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buffer = [0; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buffer).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => bytes.push(b'\n'),
            Some('r') => bytes.push(b'\r'),
            Some('t') => bytes.push(b'\t'),
            Some('0') => bytes.push(0),
            Some(c @ ('\\' | '"' | '\'')) => bytes.push(c as u8),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let byte = u8::from_str_radix(&hex, 16)
                    .map_err(|_| format!("invalid byte escape `\\x{hex}`"))?;
                bytes.push(byte);
            }
            Some(other) => return Err(format!("unknown escape `\\{other}`")),
            None => return Err("dangling backslash".to_string()),
        }
    }
    Ok(bytes)
}

fn bracketed<'a>(
    open: char,
    close: char,
) -> impl FnMut(&'a str) -> Res<'a, Vec<Vec<Node>>> {
    move |input| {
        delimited(
            pair(char(open), ws),
            alternation,
            pair(ws, cut(char(close))),
        )(input)
    }
}

fn primary(input: &str) -> Res<Node> {
    alt((
        map(preceded(char('#'), cut(quoted('"'))), |r: &str| {
            Node::Regex(r.to_string())
        }),
        map_res(quoted('"'), |s| unescape(s).map(Node::Terminal)),
        map_res(quoted('\''), |s| unescape(s).map(Node::Terminal)),
        map(identifier, |n| Node::Nonterminal(n.to_string())),
        map(bracketed('(', ')'), Node::Group),
        map(bracketed('[', ']'), |a| Node::Optional(Box::new(Node::Group(a)))),
        map(bracketed('{', '}'), |a| Node::ZeroOrMore(Box::new(Node::Group(a)))),
    ))(input)
}

fn postfix(input: &str) -> Res<Node> {
    let (input, node) = primary(input)?;
    let (input, operator) = opt(preceded(ws, one_of("?*+")))(input)?;
    Ok((
        input,
        match operator {
            Some('?') => Node::Optional(Box::new(node)),
            Some('*') => Node::ZeroOrMore(Box::new(node)),
            Some('+') => Node::OneOrMore(Box::new(node)),
            _ => node,
        },
    ))
}

fn concatenation(input: &str) -> Res<Vec<Node>> {
    many1(preceded(ws, postfix))(input)
}

fn alternation(input: &str) -> Res<Vec<Vec<Node>>> {
    let (input, first) = concatenation(input)?;
    let (input, rest) = many0(preceded(pair(ws, char('|')), cut(concatenation)))(input)?;
    let mut alternatives = vec![first];
    alternatives.extend(rest);
    Ok((input, alternatives))
}

fn rule(input: &str) -> Res<(&str, Vec<Vec<Node>>)> {
    let (input, name) = context("rule name", identifier)(input)?;
    let (input, _) = tuple((ws, context("`::=`", cut(tag("::=")))))(input)?;
    let (input, body) = context("rule body", cut(alternation))(input)?;
    let (input, _) = tuple((ws, context("`;`", cut(char(';')))))(input)?;
    Ok((input, (name, body)))
}

fn rules(input: &str) -> Res<Vec<(&str, Vec<Vec<Node>>)>> {
    all_consuming(terminated(many0(preceded(ws, rule)), ws))(input)
}

fn own_error(e: nom::Err<VerboseError<&str>>) -> nom::Err<VerboseError<String>> {
    let own = |e: VerboseError<&str>| VerboseError {
        errors: e
            .errors
            .into_iter()
            .map(|(input, kind)| (input.to_string(), kind))
            .collect(),
    };
    match e {
        nom::Err::Error(e) => nom::Err::Error(own(e)),
        nom::Err::Failure(e) => nom::Err::Failure(own(e)),
        nom::Err::Incomplete(needed) => nom::Err::Incomplete(needed),
    }
}

struct Lowering<'a> {
    interner: DefaultStringInterner,
    productions: Vec<Vec<Box<[Symbol]>>>,
    defined: Vec<bool>,
    terminals: Vec<Box<[u8]>>,
    terminal_ids: AHashMap<Vec<u8>, u32>,
    regexes: Vec<Arc<Automaton>>,
    regex_ids: AHashMap<String, u32>,
    regex_config: &'a RegexConfig,
    fresh_count: usize,
}

impl Lowering<'_> {
    fn nonterminal(&mut self, name: &str) -> u32 {
        let id = self.interner.get_or_intern(name).to_usize();
        if id >= self.productions.len() {
            self.productions.resize_with(id + 1, Vec::new);
            self.defined.resize(id + 1, false);
        }
        id as u32
    }

    fn fresh(&mut self, parent: &str) -> u32 {
        self.fresh_count += 1;
        // `#` cannot appear in identifiers, so fresh names never collide.
        let name = format!("{parent}#{}", self.fresh_count);
        let id = self.nonterminal(&name);
        self.defined[id as usize] = true;
        id
    }

    fn define(&mut self, id: u32, alternatives: Vec<Box<[Symbol]>>) {
        self.defined[id as usize] = true;
        self.productions[id as usize].extend(alternatives);
    }

    fn lower_alternatives(
        &mut self,
        parent: &str,
        alternatives: &[Vec<Node>],
    ) -> Result<Vec<Box<[Symbol]>>, CreateGrammarError> {
        let mut lowered = Vec::with_capacity(alternatives.len());
        for sequence in alternatives {
            let mut symbols = Vec::with_capacity(sequence.len());
            for node in sequence {
                symbols.extend(self.lower_node(parent, node)?);
            }
            lowered.push(symbols.into_boxed_slice());
        }
        Ok(lowered)
    }

    /// Lowers a node into at most one symbol. The empty terminal lowers into nothing.
    fn lower_node(&mut self, parent: &str, node: &Node) -> Result<Option<Symbol>, CreateGrammarError> {
        Ok(Some(match node {
            Node::Terminal(bytes) if bytes.is_empty() => return Ok(None),
            Node::Terminal(bytes) => {
                let next_id = self.terminals.len() as u32;
                let id = *self.terminal_ids.entry(bytes.clone()).or_insert(next_id);
                if id == next_id {
                    self.terminals.push(bytes.clone().into_boxed_slice());
                }
                Symbol::Terminal(id)
            }
            Node::Regex(regex) => {
                let id = match self.regex_ids.get(regex) {
                    Some(&id) => id,
                    None => {
                        pattern::validate_regex(regex)?;
                        let automaton = Automaton::new(regex, self.regex_config)?;
                        let id = self.regexes.len() as u32;
                        self.regexes.push(Arc::new(automaton));
                        self.regex_ids.insert(regex.clone(), id);
                        id
                    }
                };
                Symbol::Regex(id)
            }
            Node::Nonterminal(name) => Symbol::Nonterminal(self.nonterminal(name)),
            Node::Group(alternatives) => {
                let lowered = self.lower_alternatives(parent, alternatives)?;
                if lowered.len() == 1 && lowered[0].len() == 1 {
                    lowered[0][0]
                } else {
                    let id = self.fresh(parent);
                    self.define(id, lowered);
                    Symbol::Nonterminal(id)
                }
            }
            Node::Optional(inner) => {
                let inner = self.lower_node(parent, inner)?;
                let id = self.fresh(parent);
                let present: Box<[Symbol]> = inner.into_iter().collect();
                self.define(id, vec![present, Box::new([])]);
                Symbol::Nonterminal(id)
            }
            Node::ZeroOrMore(inner) | Node::OneOrMore(inner) => {
                let inner = self.lower_node(parent, inner)?;
                let id = self.fresh(parent);
                let mut repeated = vec![Symbol::Nonterminal(id)];
                repeated.extend(inner);
                // Left recursion keeps the Earley sets small.
                let base: Box<[Symbol]> = match node {
                    Node::OneOrMore(_) => inner.into_iter().collect(),
                    _ => Box::new([]),
                };
                self.define(id, vec![repeated.into_boxed_slice(), base]);
                Symbol::Nonterminal(id)
            }
        }))
    }
}

impl Grammar {
    /// Parses and validates a grammar.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateGrammarError`] when the text is malformed, a nonterminal is undefined,
    /// the start nonterminal is missing, a regular expression is invalid, or the grammar accepts
    /// no string at all.
    pub fn new(
        text: &str,
        start_nonterminal: &str,
        regex_config: &RegexConfig,
    ) -> Result<Self, CreateGrammarError> {
        let (_, parsed) = rules(text).map_err(own_error)?;
        let mut lowering = Lowering {
            interner: DefaultStringInterner::default(),
            productions: Vec::new(),
            defined: Vec::new(),
            terminals: Vec::new(),
            terminal_ids: AHashMap::default(),
            regexes: Vec::new(),
            regex_ids: AHashMap::default(),
            regex_config,
            fresh_count: 0,
        };
        for (name, body) in parsed.iter() {
            let id = lowering.nonterminal(name);
            let alternatives = lowering.lower_alternatives(name, body)?;
            lowering.define(id, alternatives);
        }
        let nonterminal_names: Vec<String> = (0..lowering.productions.len())
            .map(|id| {
                string_interner::DefaultSymbol::try_from_usize(id)
                    .and_then(|symbol| lowering.interner.resolve(symbol))
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();
        if let Some(undefined) = lowering.defined.iter().position(|&d| !d) {
            let name = &nonterminal_names[undefined];
            return Err(if name == start_nonterminal {
                CreateGrammarError::MissingStartNonterminal(name.clone())
            } else {
                CreateGrammarError::UndefinedNonterminal(name.clone())
            });
        }
        let start = match lowering.interner.get(start_nonterminal) {
            Some(symbol) => symbol.to_usize() as u32,
            None => {
                return Err(CreateGrammarError::MissingStartNonterminal(
                    start_nonterminal.to_string(),
                ))
            }
        };
        let mut grammar = Grammar {
            nonterminal_names,
            productions: lowering.productions,
            nullable: Vec::new(),
            terminals: lowering.terminals,
            regexes: lowering.regexes,
            start,
        };
        grammar.remove_unproductive()?;
        grammar.nullable = grammar.compute_nullable();
        Ok(grammar)
    }

    fn remove_unproductive(&mut self) -> Result<(), CreateGrammarError> {
        let mut productive = vec![false; self.productions.len()];
        loop {
            let mut changed = false;
            for (id, alternatives) in self.productions.iter().enumerate() {
                if productive[id] {
                    continue;
                }
                let derives = alternatives.iter().any(|symbols| {
                    symbols.iter().all(|s| match s {
                        Symbol::Nonterminal(n) => productive[*n as usize],
                        _ => true,
                    })
                });
                if derives {
                    productive[id] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        if !productive[self.start as usize] {
            return Err(CreateGrammarError::EmptyLanguage);
        }
        for (id, alternatives) in self.productions.iter_mut().enumerate() {
            if !productive[id] {
                log::warn!(
                    "The nonterminal `{}` derives no finite string and will never match.",
                    self.nonterminal_names[id]
                );
            }
            alternatives.retain(|symbols| {
                symbols.iter().all(|s| match s {
                    Symbol::Nonterminal(n) => productive[*n as usize],
                    _ => true,
                })
            });
        }
        Ok(())
    }

    fn compute_nullable(&self) -> Vec<bool> {
        let mut nullable = vec![false; self.productions.len()];
        loop {
            let mut changed = false;
            for (id, alternatives) in self.productions.iter().enumerate() {
                if nullable[id] {
                    continue;
                }
                if alternatives
                    .iter()
                    .any(|symbols| symbols.iter().all(|&s| self.symbol_is_nullable_with(s, &nullable)))
                {
                    nullable[id] = true;
                    changed = true;
                }
            }
            if !changed {
                return nullable;
            }
        }
    }

    fn symbol_is_nullable_with(&self, symbol: Symbol, nullable: &[bool]) -> bool {
        match symbol {
            Symbol::Terminal(_) => false,
            Symbol::Regex(id) => {
                let automaton = &self.regexes[id as usize];
                automaton.is_accepting(automaton.start())
            }
            Symbol::Nonterminal(id) => nullable[id as usize],
        }
    }

    /// The start nonterminal.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// The productions of a nonterminal.
    pub fn productions(&self, nonterminal: u32) -> &[Box<[Symbol]>] {
        &self.productions[nonterminal as usize]
    }

    /// Whether a nonterminal derives the empty string.
    pub fn is_nullable(&self, nonterminal: u32) -> bool {
        self.nullable[nonterminal as usize]
    }

    /// The bytes of a terminal.
    pub fn terminal(&self, terminal: u32) -> &[u8] {
        &self.terminals[terminal as usize]
    }

    /// The automaton of a regular expression.
    pub fn regex(&self, regex: u32) -> &Automaton {
        &self.regexes[regex as usize]
    }

    /// The name of a nonterminal. Lowered groups and repetitions are named `parent#n`.
    pub fn nonterminal_name(&self, nonterminal: u32) -> &str {
        &self.nonterminal_names[nonterminal as usize]
    }

    /// The number of nonterminals.
    pub fn nonterminal_count(&self) -> usize {
        self.productions.len()
    }
}

impl Display for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (id, alternatives) in self.productions.iter().enumerate() {
            write!(f, "{} ::=", self.nonterminal_names[id])?;
            for (i, symbols) in alternatives.iter().enumerate() {
                if i > 0 {
                    write!(f, " |")?;
                }
                if symbols.is_empty() {
                    write!(f, " \"\"")?;
                }
                for symbol in symbols.iter() {
                    match *symbol {
                        Symbol::Terminal(t) => {
                            write!(f, " \"{}\"", self.terminal(t).escape_ascii())?
                        }
                        Symbol::Regex(r) => write!(f, " #\"{}\"", self.regex(r).pattern())?,
                        Symbol::Nonterminal(n) => write!(f, " {}", self.nonterminal_name(n))?,
                    }
                }
            }
            writeln!(f, ";")?;
        }
        Ok(())
    }
}

impl Debug for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grammar")
            .field("start", &self.nonterminal_name(self.start))
            .field("rules", &self.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grammar(text: &str) -> Result<Grammar, CreateGrammarError> {
        Grammar::new(text, "start", &RegexConfig::default())
    }

    #[test]
    fn lowering() {
        let g = grammar(
            r#"
            (* balanced parentheses *)
            start ::= item* ;
            item ::= "(" start ")" | 'x' ;
            "#,
        )
        .unwrap();
        insta::assert_snapshot!(g.to_string().trim_end(), @r###"
        start ::= start#1;
        item ::= "(" start ")" | "x";
        start#1 ::= start#1 item | "";
        "###);
        assert!(g.is_nullable(g.start()));
    }

    #[test]
    fn brackets_and_regexes() {
        let g = grammar(r#"start ::= [ "-" ] #"[0-9]+" { "," #"[0-9]+" } ;"#).unwrap();
        insta::assert_snapshot!(g.to_string().trim_end(), @r###"
        start ::= start#1 #"[0-9]+" start#3;
        start#1 ::= "-" | "";
        start#2 ::= "," #"[0-9]+";
        start#3 ::= start#3 start#2 | "";
        "###);
    }

    #[test]
    fn escapes() {
        let g = grammar(r#"start ::= "a\"\n\x41" ;"#).unwrap();
        assert_eq!(g.terminal(0), b"a\"\nA");
    }

    #[test]
    fn semantic_errors() {
        assert!(matches!(
            grammar("start ::= missing ;"),
            Err(CreateGrammarError::UndefinedNonterminal(name)) if name == "missing"
        ));
        assert!(matches!(
            grammar("root ::= \"a\" ;"),
            Err(CreateGrammarError::MissingStartNonterminal(_))
        ));
        assert!(matches!(
            grammar("start ::= start \"a\" ;"),
            Err(CreateGrammarError::EmptyLanguage)
        ));
        assert!(matches!(
            grammar(r#"start ::= #"(a)\1" ;"#),
            Err(CreateGrammarError::Regex(_))
        ));
        assert!(matches!(
            grammar("start ::= \"a\""),
            Err(CreateGrammarError::Syntax(_))
        ));
    }

    #[test]
    fn repeated_definitions_merge() {
        let g = grammar("start ::= \"a\" ; start ::= \"b\" ;").unwrap();
        assert_eq!(g.productions(g.start()).len(), 2);
    }
}
