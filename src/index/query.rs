//! Index-level query operators.
//!
//! The query parser compiles user queries down to this tree; the
//! database evaluates it against the term and value-slot tables.

/// A compiled query over the inverted index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Matches nothing.
    Empty,
    /// Matches every document.
    MatchAll,
    /// Exact term match. The bytes include the field prefix.
    Term(Vec<u8>),
    /// Matches every term starting with the given stem (field prefix
    /// included).
    Wildcard(Vec<u8>),
    /// Value slot within `[low, high]`.
    ValueRange { slot: u16, low: u64, high: u64 },
    /// Value slot `>= low`.
    ValueGe { slot: u16, low: u64 },
    /// Value slot `<= high`.
    ValueLe { slot: u16, high: u64 },
    /// All subqueries match.
    And(Vec<Query>),
    /// Any subquery matches.
    Or(Vec<Query>),
    /// Left matches and right does not.
    AndNot(Box<Query>, Box<Query>),
}

impl Query {
    pub fn term(prefix: &str, value: impl AsRef<[u8]>) -> Query {
        let mut bytes = prefix.as_bytes().to_vec();
        bytes.extend_from_slice(value.as_ref());
        Query::Term(bytes)
    }

    pub fn wildcard(prefix: &str, stem: impl AsRef<[u8]>) -> Query {
        let mut bytes = prefix.as_bytes().to_vec();
        bytes.extend_from_slice(stem.as_ref());
        Query::Wildcard(bytes)
    }

    /// N-ary AND. Empty operands are dropped and nested ANDs are
    /// flattened; zero operands yield `Empty`, one yields itself.
    pub fn and(queries: impl IntoIterator<Item = Query>) -> Query {
        Query::combine(queries, false)
    }

    /// N-ary OR with the same flattening rules as [`Query::and`].
    pub fn or(queries: impl IntoIterator<Item = Query>) -> Query {
        Query::combine(queries, true)
    }

    pub fn and_not(left: Query, right: Query) -> Query {
        Query::AndNot(Box::new(left), Box::new(right))
    }

    fn combine(queries: impl IntoIterator<Item = Query>, or: bool) -> Query {
        let mut flat = Vec::new();
        for query in queries {
            match (or, query) {
                (_, Query::Empty) => {}
                (true, Query::Or(subs)) => flat.extend(subs),
                (false, Query::And(subs)) => flat.extend(subs),
                (_, other) => flat.push(other),
            }
        }

        match flat.len() {
            0 => Query::Empty,
            1 => flat.into_iter().next().expect("single element"),
            _ if or => Query::Or(flat),
            _ => Query::And(flat),
        }
    }
}
