//! Predefined regular expression terms and the combinators that compose them.
//!
//! Every term matches the canonical text form of a value, which is also what the
//! [primitive](crate::types::Primitive) output types compile to.

/// A double-quoted string without embedded quotes.
pub const STRING: &str = r#""[^"]*""#;
/// An optionally signed integer without leading zeros.
pub const INTEGER: &str = r"[+-]?(0|[1-9][0-9]*)";
/// A JSON-style boolean.
pub const BOOLEAN: &str = r"(true|false)";
/// An optionally signed decimal number with an optional exponent.
pub const NUMBER: &str = r"[+-]?(0|[1-9][0-9]*)(\.[0-9]+)?([eE][+-][0-9]+)?";
/// A calendar date, `YYYY-MM-DD`.
pub const DATE: &str = r"([0-9]{4})-(0[1-9]|1[0-2])-([0-2][0-9]|3[0-1])";
/// A time of day, `HH:MM:SS`.
pub const TIME: &str = r"([0-1][0-9]|2[0-3]):([0-5][0-9]):([0-5][0-9])";
/// A date and a time separated by a space.
pub const DATETIME: &str =
    r"([0-9]{4})-(0[1-9]|1[0-2])-([0-2][0-9]|3[0-1]) ([0-1][0-9]|2[0-3]):([0-5][0-9]):([0-5][0-9])";
/// A line of text terminated by one or more line breaks.
pub const PARAGRAPH: &str = r"(?:[^\r\n]*[\r\n]+)";

/// Matches `pattern` one or more times.
pub fn one_or_more(pattern: &str) -> String {
    format!("({pattern})+")
}

/// Matches `pattern` zero or more times.
pub fn zero_or_more(pattern: &str) -> String {
    format!("({pattern})*")
}

/// Matches `pattern` zero or one time.
pub fn optional(pattern: &str) -> String {
    format!("({pattern})?")
}
