//! The structured query language.
//!
//! Grammar:
//!
//! ```text
//! query    = orexpr
//! orexpr   = andexpr ( "OR" orexpr )?
//! andexpr  = expr ( ( "AND" )? andexpr )?
//! expr     = "NOT" expr
//!          | matchall
//!          | "(" query ")"
//!          | field value?
//!          | value
//! value    = (term | string) wildcard?
//! matchall = "*" ":" "*"
//! field    = [A-Za-z_]+ ":"
//! string   = '"' [^"]+ '"'
//! wildcard = "*"
//! term     = [^ \t\n()*"]+
//! ```
//!
//! The lexer is greedy; unknown bytes are skipped unless strict mode
//! is enabled. `AND` binds tighter than `OR`, `NOT` tighter than
//! both, and both boolean operators are n-ary and flattened. Errors
//! carry the 0-indexed character position they occurred at.

use std::fmt;

use thiserror::Error;

use crate::index::query::Query;
use crate::index::schema::{FieldValueError, Schema};

/// Errors from query parsing and per-field value compilation.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Invalid token beginning at position {position}")]
    UnknownToken { position: usize },
    #[error("Expected {expected} at position {position}, got {found}")]
    Expected {
        expected: String,
        position: usize,
        found: String,
    },
    #[error("Unknown field \"{name}\", must be one of [{known}]")]
    UnknownField { name: String, known: String },
    #[error("Missing value for field {field} at position {position}")]
    MissingValue { field: String, position: usize },
    #[error(transparent)]
    InvalidValue(#[from] FieldValueError),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    Lparen,
    Rparen,
    /// Quoted string, with the explicit-wildcard flag.
    String(String, bool),
    /// Field name, colon consumed.
    Field(String),
    MatchAll,
    /// Bare term, with the explicit-wildcard flag.
    Term(String, bool),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::Lparen => write!(f, "\"(\""),
            Token::Rparen => write!(f, "\")\""),
            Token::String(value, _) => write!(f, "string \"{value}\""),
            Token::Field(name) => write!(f, "field \"{name}\""),
            Token::MatchAll => write!(f, "\"*:*\""),
            Token::Term(value, _) => write!(f, "\"{value}\""),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

/// Parses user queries against a schema.
pub struct QueryParser<'a> {
    schema: &'a Schema,
    default_fields: Vec<String>,
    auto_wildcard: bool,
    strict: bool,
    ignore_missing_field_values: bool,
}

impl<'a> QueryParser<'a> {
    pub fn new(schema: &'a Schema) -> QueryParser<'a> {
        QueryParser {
            schema,
            default_fields: schema.field_names().iter().map(|s| s.to_string()).collect(),
            auto_wildcard: false,
            strict: false,
            ignore_missing_field_values: true,
        }
    }

    /// Fields searched when a value has no explicit `field:` prefix.
    pub fn default_fields(mut self, fields: &[&str]) -> Self {
        self.default_fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Compile every bare term as a wildcard, so `foo` behaves as
    /// `foo*`. Explicit `field:value` forms stay exact.
    pub fn auto_wildcard(mut self, enabled: bool) -> Self {
        self.auto_wildcard = enabled;
        self
    }

    /// Surface unknown bytes as `UnknownToken` instead of skipping.
    pub fn strict(mut self, enabled: bool) -> Self {
        self.strict = enabled;
        self
    }

    /// Treat a field name with no following value as an error instead
    /// of an empty match.
    pub fn require_field_values(mut self, required: bool) -> Self {
        self.ignore_missing_field_values = !required;
        self
    }

    /// Parse `text` into an index query.
    pub fn parse(&self, text: &str) -> Result<Query, ParseError> {
        if text.trim() == "*:*" {
            return Ok(Query::MatchAll);
        }

        let tokens = lex(text, self.strict)?;
        let mut cursor = Cursor {
            parser: self,
            tokens,
            position: 0,
        };

        let query = cursor.parse_or()?;

        let (token, position) = cursor.peek().clone();
        if token != Token::Eof {
            return Err(ParseError::Expected {
                expected: "an expression".to_string(),
                position,
                found: token.to_string(),
            });
        }

        Ok(query.unwrap_or(Query::Empty))
    }
}

struct Cursor<'p, 'a> {
    parser: &'p QueryParser<'a>,
    tokens: Vec<(Token, usize)>,
    position: usize,
}

impl Cursor<'_, '_> {
    fn peek(&self) -> &(Token, usize) {
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
    }

    fn parse_or(&mut self) -> Result<Option<Query>, ParseError> {
        let Some(lhs) = self.parse_and()? else {
            return Ok(None);
        };

        if self.peek().0 == Token::Or {
            self.advance();
            let rhs = self.parse_or()?.ok_or_else(|| ParseError::Expected {
                expected: "RHS operand to OR".to_string(),
                position: self.peek().1,
                found: self.peek().0.to_string(),
            })?;
            return Ok(Some(Query::or([lhs, rhs])));
        }

        Ok(Some(lhs))
    }

    fn parse_and(&mut self) -> Result<Option<Query>, ParseError> {
        let Some(lhs) = self.parse_expr()? else {
            return Ok(None);
        };

        if self.peek().0 == Token::And {
            self.advance();
            let rhs = self.parse_and()?.ok_or_else(|| ParseError::Expected {
                expected: "RHS operand to AND".to_string(),
                position: self.peek().1,
                found: self.peek().0.to_string(),
            })?;
            return Ok(Some(Query::and([lhs, rhs])));
        }

        // Adjacency is an implicit AND.
        if let Some(rhs) = self.parse_and()? {
            return Ok(Some(Query::and([lhs, rhs])));
        }

        Ok(Some(lhs))
    }

    fn parse_expr(&mut self) -> Result<Option<Query>, ParseError> {
        let (token, position) = self.peek().clone();

        match token {
            Token::Not => {
                self.advance();
                let operand = self.parse_expr()?.ok_or_else(|| ParseError::Expected {
                    expected: "an expression".to_string(),
                    position: self.peek().1,
                    found: self.peek().0.to_string(),
                })?;
                Ok(Some(Query::and_not(Query::MatchAll, operand)))
            }
            Token::MatchAll => {
                self.advance();
                Ok(Some(Query::MatchAll))
            }
            Token::Lparen => {
                self.advance();
                let inner = self.parse_or()?;
                let (closing, close_pos) = self.peek().clone();
                if closing != Token::Rparen {
                    return Err(ParseError::Expected {
                        expected: format!("closing \")\" (opening at position {position})"),
                        position: close_pos,
                        found: closing.to_string(),
                    });
                }
                self.advance();
                Ok(Some(inner.unwrap_or(Query::Empty)))
            }
            Token::Term(value, wildcard) => {
                self.advance();
                let wildcard = wildcard || self.parser.auto_wildcard;
                Ok(Some(self.default_fields_query(&value, wildcard)?))
            }
            Token::String(value, wildcard) => {
                self.advance();
                Ok(Some(self.default_fields_query(&value, wildcard)?))
            }
            Token::Field(name) => {
                self.advance();
                Ok(Some(self.parse_field_value(&name)?))
            }
            _ => Ok(None),
        }
    }

    fn parse_field_value(&mut self, name: &str) -> Result<Query, ParseError> {
        let Some(field) = self.parser.schema.field(name) else {
            return Err(ParseError::UnknownField {
                name: name.to_string(),
                known: self.parser.schema.field_names().join(", "),
            });
        };

        let (token, position) = self.peek().clone();
        match token {
            Token::Term(value, wildcard) => {
                self.advance();
                Ok(field.make_query(&value, wildcard)?)
            }
            Token::String(value, wildcard) => {
                self.advance();
                Ok(field.make_query(&value, wildcard)?)
            }
            _ if self.parser.ignore_missing_field_values => Ok(Query::Empty),
            _ => Err(ParseError::MissingValue {
                field: name.to_string(),
                position,
            }),
        }
    }

    fn default_fields_query(&self, value: &str, wildcard: bool) -> Result<Query, ParseError> {
        let mut subqueries = Vec::new();
        for name in &self.parser.default_fields {
            if let Some(field) = self.parser.schema.field(name) {
                subqueries.push(field.make_query(value, wildcard)?);
            }
        }
        Ok(Query::or(subqueries))
    }
}

fn lex(input: &str, strict: bool) -> Result<Vec<(Token, usize)>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if let Some((token, len)) = keyword_at(&chars, pos) {
            tokens.push((token, pos));
            pos += len;
            continue;
        }

        match c {
            '!' => {
                tokens.push((Token::Not, pos));
                pos += 1;
            }
            '(' => {
                tokens.push((Token::Lparen, pos));
                pos += 1;
            }
            ')' => {
                tokens.push((Token::Rparen, pos));
                pos += 1;
            }
            '"' => match lex_string(&chars, pos) {
                Some((token, next)) => {
                    tokens.push((token, pos));
                    pos = next;
                }
                None => {
                    if strict {
                        return Err(ParseError::UnknownToken { position: pos });
                    }
                    pos += 1;
                }
            },
            '*' => {
                if chars[pos..].starts_with(&['*', ':', '*']) {
                    tokens.push((Token::MatchAll, pos));
                    pos += 3;
                } else if strict {
                    return Err(ParseError::UnknownToken { position: pos });
                } else {
                    pos += 1;
                }
            }
            _ => {
                if let Some((token, next)) = lex_field(&chars, pos) {
                    tokens.push((token, pos));
                    pos = next;
                    continue;
                }

                match lex_term(&chars, pos) {
                    Some((token, next)) => {
                        tokens.push((token, pos));
                        pos = next;
                    }
                    None => {
                        if strict {
                            return Err(ParseError::UnknownToken { position: pos });
                        }
                        pos += 1;
                    }
                }
            }
        }
    }

    tokens.push((Token::Eof, chars.len()));
    Ok(tokens)
}

/// `AND`, `OR`, or `NOT` at `pos`, when not part of a longer word.
fn keyword_at(chars: &[char], pos: usize) -> Option<(Token, usize)> {
    for (word, token) in [
        ("AND", Token::And),
        ("OR", Token::Or),
        ("NOT", Token::Not),
    ] {
        let len = word.len();
        if chars[pos..].starts_with(&word.chars().collect::<Vec<_>>()[..]) {
            let boundary = chars
                .get(pos + len)
                .map(|c| !c.is_ascii_alphanumeric() && *c != '_')
                .unwrap_or(true);
            if boundary {
                return Some((token, len));
            }
        }
    }
    None
}

/// A double-quoted string with at least one character, plus an
/// optional trailing `*`.
fn lex_string(chars: &[char], pos: usize) -> Option<(Token, usize)> {
    let close = chars[pos + 1..].iter().position(|c| *c == '"')? + pos + 1;
    if close == pos + 1 {
        return None;
    }

    let value: String = chars[pos + 1..close].iter().collect();
    let mut next = close + 1;
    let wildcard = chars.get(next) == Some(&'*');
    if wildcard {
        next += 1;
    }

    Some((Token::String(value, wildcard), next))
}

/// `[A-Za-z_]+` immediately followed by a colon.
fn lex_field(chars: &[char], pos: usize) -> Option<(Token, usize)> {
    if !chars[pos].is_ascii_alphabetic() && chars[pos] != '_' {
        return None;
    }

    let mut end = pos;
    while end < chars.len() && (chars[end].is_ascii_alphabetic() || chars[end] == '_') {
        end += 1;
    }

    if chars.get(end) == Some(&':') {
        let name: String = chars[pos..end].iter().collect();
        return Some((Token::Field(name), end + 1));
    }
    None
}

fn is_term_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '*' | '"')
}

/// A run of term characters, plus an optional trailing `*`.
fn lex_term(chars: &[char], pos: usize) -> Option<(Token, usize)> {
    let mut end = pos;
    while end < chars.len() && is_term_char(chars[end]) {
        end += 1;
    }
    if end == pos {
        return None;
    }

    let value: String = chars[pos..end].iter().collect();
    let wildcard = chars.get(end) == Some(&'*');
    if wildcard {
        end += 1;
    }

    Some((Token::Term(value, wildcard), end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::schema::{SLOT_ADDRESS, SLOT_SIZE};

    fn parser(schema: &Schema) -> QueryParser<'_> {
        QueryParser::new(schema).default_fields(&["name"])
    }

    fn name_term(value: &str) -> Query {
        Query::term("XN", value)
    }

    #[test]
    fn empty_queries_match_nothing() {
        let schema = Schema::symbols();
        let p = parser(&schema);
        assert_eq!(p.parse("").expect("empty"), Query::Empty);
        assert_eq!(p.parse("  ").expect("blank"), Query::Empty);
        assert_eq!(p.parse("  \n   ").expect("newline"), Query::Empty);
    }

    #[test]
    fn matchall_token() {
        let schema = Schema::symbols();
        let p = parser(&schema);
        assert_eq!(p.parse("  *:*  ").expect("matchall"), Query::MatchAll);
        assert_eq!(p.parse("(*:*)").expect("parens"), Query::MatchAll);
    }

    #[test]
    fn single_and_multiple_terms() {
        let schema = Schema::symbols();
        let p = parser(&schema);

        assert_eq!(p.parse("foo").expect("term"), name_term("foo"));
        assert_eq!(p.parse("  foo  ").expect("spaces"), name_term("foo"));
        assert_eq!(
            p.parse("foo bar").expect("implicit and"),
            Query::And(vec![name_term("foo"), name_term("bar")])
        );
        assert_eq!(
            p.parse("foo bar baz").expect("flattened"),
            Query::And(vec![
                name_term("foo"),
                name_term("bar"),
                name_term("baz")
            ])
        );
    }

    #[test]
    fn implicit_and_equals_explicit_and() {
        let schema = Schema::symbols();
        let p = parser(&schema);
        assert_eq!(
            p.parse("a b").expect("implicit"),
            p.parse("a AND b").expect("explicit")
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let schema = Schema::symbols();
        let p = parser(&schema);
        assert_eq!(
            p.parse("a AND b OR c").expect("mixed"),
            p.parse("(a AND b) OR c").expect("parenthesized")
        );
        assert_eq!(
            p.parse("foo AND (bar OR baz)").expect("grouped or"),
            Query::And(vec![
                name_term("foo"),
                Query::Or(vec![name_term("bar"), name_term("baz")]),
            ])
        );
    }

    #[test]
    fn not_compiles_to_and_not_matchall() {
        let schema = Schema::symbols();
        let p = parser(&schema);

        let expected = Query::and_not(Query::MatchAll, name_term("foo"));
        assert_eq!(p.parse("NOT foo").expect("NOT"), expected);
        assert_eq!(p.parse("!foo").expect("bang"), expected);

        // NOT binds tighter than the implicit AND.
        assert_eq!(
            p.parse("NOT foo bar").expect("not then term"),
            Query::And(vec![
                Query::and_not(Query::MatchAll, name_term("foo")),
                name_term("bar"),
            ])
        );

        assert!(p.parse("NOT").is_err());
        assert!(p.parse("!NOT").is_err());
        assert!(p.parse("NOT NOT").is_err());
    }

    #[test]
    fn strings_group_words() {
        let schema = Schema::symbols();
        let p = parser(&schema);
        assert_eq!(p.parse(" \"foo baz\"").expect("string"), name_term("foo baz"));
        assert_eq!(
            p.parse("name:\"foo bar\"").expect("field string"),
            name_term("foo bar")
        );
    }

    #[test]
    fn field_with_value() {
        let schema = Schema::symbols();
        let p = parser(&schema);
        assert_eq!(p.parse("name:bar").expect("field"), name_term("bar"));
        assert_eq!(p.parse("name: FOO").expect("spaced value"), name_term("foo"));
        assert_eq!(
            p.parse("fullname:foo").expect("fullname"),
            Query::term("XF", "foo")
        );
    }

    #[test]
    fn explicit_wildcards() {
        let schema = Schema::symbols();
        let p = parser(&schema);
        assert_eq!(p.parse("fo*").expect("bare"), Query::wildcard("XN", "fo"));
        assert_eq!(
            p.parse("name:fo*").expect("fielded"),
            Query::wildcard("XN", "fo")
        );
        assert_eq!(
            p.parse("name:foo.b*").expect("dotted"),
            Query::wildcard("XN", "foo.b")
        );
    }

    #[test]
    fn auto_wildcard_applies_to_bare_terms_only() {
        let schema = Schema::symbols();
        let p = parser(&schema).auto_wildcard(true);
        assert_eq!(p.parse("fo").expect("bare"), Query::wildcard("XN", "fo"));
        assert_eq!(p.parse("name:fo").expect("fielded"), name_term("fo"));
    }

    #[test]
    fn integer_fields_compile_to_value_predicates() {
        let schema = Schema::symbols();
        let p = parser(&schema);

        assert_eq!(
            p.parse("size:123..456").expect("range"),
            Query::ValueRange {
                slot: SLOT_SIZE,
                low: 123,
                high: 456
            }
        );
        assert_eq!(
            p.parse("size:..987").expect("le"),
            Query::ValueLe {
                slot: SLOT_SIZE,
                high: 987
            }
        );
        assert_eq!(
            p.parse("size:369..").expect("ge"),
            Query::ValueGe {
                slot: SLOT_SIZE,
                low: 369
            }
        );
        assert_eq!(
            p.parse("size:369").expect("literal"),
            Query::ValueRange {
                slot: SLOT_SIZE,
                low: 369,
                high: 369
            }
        );
        assert_eq!(
            p.parse("size:0x10").expect("hex"),
            p.parse("size:16").expect("dec")
        );
        assert_eq!(
            p.parse("size:..12346 AND address:10..").expect("two slots"),
            Query::And(vec![
                Query::ValueLe {
                    slot: SLOT_SIZE,
                    high: 12346
                },
                Query::ValueGe {
                    slot: SLOT_ADDRESS,
                    low: 10
                },
            ])
        );
    }

    #[test]
    fn bare_values_search_every_default_field() {
        let schema = Schema::symbols();
        let p = QueryParser::new(&schema).default_fields(&["name", "fullname"]);
        assert_eq!(
            p.parse("foo").expect("two fields"),
            Query::Or(vec![name_term("foo"), Query::term("XF", "foo")])
        );

        let p = QueryParser::new(&schema).default_fields(&[]);
        assert_eq!(p.parse("foo").expect("no fields"), Query::Empty);
        assert_eq!(p.parse("name:foo").expect("explicit"), name_term("foo"));
    }

    #[test]
    fn unknown_fields_are_an_error() {
        let schema = Schema::symbols();
        let p = parser(&schema);

        let err = p.parse("unknown:text").expect_err("unknown field");
        let message = err.to_string();
        assert!(message.contains("Unknown field \"unknown\""));
        assert!(message.contains("name"));

        assert!(p.parse("name:foo unknown:text name:bar").is_err());
    }

    #[test]
    fn missing_field_values() {
        let schema = Schema::symbols();

        let err = parser(&schema)
            .require_field_values(true)
            .parse("name:")
            .expect_err("missing value");
        assert_eq!(
            err,
            ParseError::MissingValue {
                field: "name".to_string(),
                position: 5
            }
        );

        // Permissive mode treats the dangling field as an empty match.
        let p = parser(&schema);
        assert_eq!(
            p.parse("name: source:baz").expect("dangling then value"),
            Query::or([
                Query::term("XS", "baz"),
                Query::term("XS", current_dir_join("baz")),
            ])
        );
        assert_eq!(
            p.parse("name: OR section:baz").expect("dangling in or"),
            Query::term("XSN", "baz")
        );
    }

    fn current_dir_join(name: &str) -> String {
        std::env::current_dir()
            .expect("cwd")
            .join(name)
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn invalid_type_values_error_mentioning_the_value() {
        let schema = Schema::symbols();
        let p = parser(&schema);

        let err = p.parse("type:INVALIDTYPE").expect_err("invalid type");
        assert!(err
            .to_string()
            .contains("Invalid value for 'type' field: INVALIDTYPE"));

        assert_eq!(p.parse("type:FUNC").expect("func"), Query::term("XT", "func"));
        assert_eq!(
            p.parse("type:F*").expect("prefix"),
            Query::Or(vec![Query::term("XT", "func"), Query::term("XT", "file")])
        );
    }

    #[test]
    fn missing_operands_are_errors() {
        let schema = Schema::symbols();
        let p = parser(&schema);

        for query in [
            "foo OR", "OR foo", "foo OR OR", "foo OR AND", "foo AND", "AND foo", "foo AND AND",
            "foo AND OR",
        ] {
            assert!(p.parse(query).is_err(), "query {query:?} should fail");
        }
    }

    #[test]
    fn parens_group_and_empty_groups_vanish() {
        let schema = Schema::symbols();
        let p = parser(&schema);

        assert_eq!(p.parse("()").expect("empty"), Query::Empty);
        assert_eq!(p.parse("(())").expect("nested empty"), Query::Empty);
        assert_eq!(p.parse("(foo)").expect("single"), name_term("foo"));
        assert_eq!(p.parse("((foo))").expect("double"), name_term("foo"));
        assert_eq!(
            p.parse("((foo) bar)").expect("nested"),
            Query::And(vec![name_term("foo"), name_term("bar")])
        );
        assert_eq!(p.parse("foo ()").expect("trailing"), name_term("foo"));
        assert_eq!(
            p.parse("foo () bar").expect("interleaved"),
            Query::And(vec![name_term("foo"), name_term("bar")])
        );
    }

    #[test]
    fn unclosed_paren_reports_both_positions() {
        let schema = Schema::symbols();
        let p = parser(&schema);

        let err = p.parse(" (foo").expect_err("unclosed");
        let message = err.to_string();
        assert!(message.contains("closing \")\""));
        assert!(message.contains("opening at position 1"));
        assert!(message.contains("at position 5"));
    }

    #[test]
    fn strict_mode_surfaces_unknown_tokens() {
        let schema = Schema::symbols();

        let err = parser(&schema)
            .strict(true)
            .parse("foo * bar")
            .expect_err("stray star");
        assert_eq!(err, ParseError::UnknownToken { position: 4 });

        // The default skips the stray bytes entirely.
        assert_eq!(
            parser(&schema).parse("foo * bar").expect("lenient"),
            Query::And(vec![name_term("foo"), name_term("bar")])
        );
    }
}
