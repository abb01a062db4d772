//! PromQL subset parser.
//!
//! Accepts a single-line query and produces a [`ParsedQuery`]. Supported
//! grammar:
//!
//! ```text
//! expr     := scalar | aggexpr
//! scalar   := '1' | '1+1'
//! aggexpr  := [aggop '('] [func '('] selector [range] ')'* [by]
//! aggop    := 'sum' | 'avg' | 'min' | 'max' | 'count'
//! func     := 'rate' | 'increase'
//! selector := name | name '{' labels '}' | '{' labels '}'
//! range    := '[' number unit ']'   unit in {s,m,h,d,w}
//! by       := 'by' '(' lname (',' lname)* ')'
//! ```
//!
//! Label values use double quotes with backslash escaping. A `__name__`
//! entry inside the label list sets the metric name; combining it with a
//! prefix name is an error. The parser is pure and deterministic.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static METRIC_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("valid regex"));

/// Function applied to a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFunction {
    /// Plain selector, no function.
    Raw,
    Rate,
    Increase,
}

impl fmt::Display for QueryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Rate => f.write_str("rate"),
            Self::Increase => f.write_str("increase"),
        }
    }
}

/// Aggregation operator wrapping the expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
        };
        f.write_str(s)
    }
}

impl FromStr for Aggregation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            _ => Err(()),
        }
    }
}

/// Range-vector duration unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl RangeUnit {
    const fn secs(self) -> u64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 3600,
            Self::Days => 86_400,
            Self::Weeks => 604_800,
        }
    }
}

/// Range vector such as `[5m]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeVector {
    pub value: u64,
    pub unit: RangeUnit,
}

impl RangeVector {
    #[must_use]
    pub fn as_secs(&self) -> f64 {
        (self.value * self.unit.secs()) as f64
    }
}

/// Immutable parse result.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub raw: String,
    pub metric_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub function: QueryFunction,
    pub range: Option<RangeVector>,
    pub aggregation: Option<Aggregation>,
    pub by_labels: Vec<String>,
    /// Set for the hard-coded scalar expressions; all other fields are
    /// unset in that case.
    pub scalar_value: Option<f64>,
}

impl ParsedQuery {
    fn scalar(raw: &str, value: f64) -> Self {
        Self {
            raw: raw.to_owned(),
            metric_name: None,
            labels: BTreeMap::new(),
            function: QueryFunction::Raw,
            range: None,
            aggregation: None,
            by_labels: Vec::new(),
            scalar_value: Some(value),
        }
    }
}

/// Parse errors carry the offending query and, where known, the character
/// position of the problem.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty query")]
    EmptyQuery,
    #[error("invalid metric name in query {query:?}")]
    InvalidMetricName { query: String },
    #[error("invalid label name at position {position} in query {query:?}")]
    InvalidLabelName { query: String, position: usize },
    #[error("unterminated label value at position {position} in query {query:?}")]
    UnterminatedValue { query: String, position: usize },
    #[error("invalid range vector at position {position} in query {query:?}")]
    InvalidRange { query: String, position: usize },
    #[error("unexpected input at position {position} in query {query:?}")]
    Unexpected { query: String, position: usize },
    #[error("metric name set twice in query {query:?}")]
    DuplicateMetricName { query: String },
    #[error("'by' clause requires an aggregation in query {query:?}")]
    ByWithoutAggregation { query: String },
}

/// Parse one query string.
pub fn parse(query: &str) -> Result<ParsedQuery, ParseError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(ParseError::EmptyQuery);
    }

    // Hard-coded scalar expressions bypass everything else. A bare `up`
    // stays an ordinary selector so the evaluator can synthesize it in
    // both instant and range queries.
    match trimmed {
        "1" => return Ok(ParsedQuery::scalar(trimmed, 1.0)),
        "1+1" => return Ok(ParsedQuery::scalar(trimmed, 2.0)),
        _ => {}
    }

    let mut cur = Cursor::new(trimmed);
    cur.skip_ws();

    // Optional aggregation operator: a known word directly followed by '('.
    let mut open_parens = 0usize;
    let aggregation = match cur.peek_ident() {
        Some(word) => match word.parse::<Aggregation>() {
            Ok(agg) if cur.ident_followed_by_paren() => {
                cur.consume_ident_and_paren();
                open_parens += 1;
                Some(agg)
            }
            _ => None,
        },
        None => None,
    };

    // Optional function, same lookahead rule.
    let function = match cur.peek_ident() {
        Some(word) => {
            let func = match word.as_str() {
                "rate" => Some(QueryFunction::Rate),
                "increase" => Some(QueryFunction::Increase),
                _ => None,
            };
            match func {
                Some(f) if cur.ident_followed_by_paren() => {
                    cur.consume_ident_and_paren();
                    open_parens += 1;
                    f
                }
                _ => QueryFunction::Raw,
            }
        }
        None => QueryFunction::Raw,
    };

    // Selector: name, name{labels}, or {labels}.
    cur.skip_ws();
    let mut metric_name = None;
    let mut labels = BTreeMap::new();
    if cur.peek() == Some('{') {
        parse_labels(&mut cur, &mut labels)?;
    } else {
        let name = cur.take_metric_ident();
        if name.is_empty() {
            return Err(ParseError::Unexpected {
                query: trimmed.to_owned(),
                position: cur.pos,
            });
        }
        metric_name = Some(name);
        if cur.peek() == Some('{') {
            parse_labels(&mut cur, &mut labels)?;
        }
    }

    // `__name__` inside the label list sets the metric name; setting it
    // twice is an error.
    if let Some(name) = labels.remove("__name__") {
        if metric_name.is_some() {
            return Err(ParseError::DuplicateMetricName {
                query: trimmed.to_owned(),
            });
        }
        if !METRIC_NAME_RE.is_match(&name) {
            return Err(ParseError::InvalidMetricName {
                query: trimmed.to_owned(),
            });
        }
        metric_name = Some(name);
    }

    // Optional range vector.
    let range = parse_range(&mut cur)?;

    // Closing parens for the operators opened above.
    for _ in 0..open_parens {
        cur.skip_ws();
        if !cur.eat(')') {
            return Err(ParseError::Unexpected {
                query: trimmed.to_owned(),
                position: cur.pos,
            });
        }
    }

    // Optional `by (...)` projection.
    cur.skip_ws();
    let mut by_labels = Vec::new();
    if cur.eat_keyword("by") {
        if aggregation.is_none() {
            return Err(ParseError::ByWithoutAggregation {
                query: trimmed.to_owned(),
            });
        }
        cur.skip_ws();
        if !cur.eat('(') {
            return Err(ParseError::Unexpected {
                query: trimmed.to_owned(),
                position: cur.pos,
            });
        }
        loop {
            cur.skip_ws();
            let position = cur.pos;
            let lname = cur.take_label_ident();
            if lname.is_empty() {
                return Err(ParseError::InvalidLabelName {
                    query: trimmed.to_owned(),
                    position,
                });
            }
            by_labels.push(lname);
            cur.skip_ws();
            if cur.eat(',') {
                continue;
            }
            if cur.eat(')') {
                break;
            }
            return Err(ParseError::Unexpected {
                query: trimmed.to_owned(),
                position: cur.pos,
            });
        }
    }

    cur.skip_ws();
    if !cur.at_end() {
        return Err(ParseError::Unexpected {
            query: trimmed.to_owned(),
            position: cur.pos,
        });
    }

    Ok(ParsedQuery {
        raw: trimmed.to_owned(),
        metric_name,
        labels,
        function,
        range,
        aggregation,
        by_labels,
        scalar_value: None,
    })
}

fn parse_labels(
    cur: &mut Cursor<'_>,
    labels: &mut BTreeMap<String, String>,
) -> Result<(), ParseError> {
    // Caller checked the opening brace.
    cur.eat('{');
    cur.skip_ws();
    if cur.eat('}') {
        return Ok(());
    }

    loop {
        cur.skip_ws();
        let position = cur.pos;
        let lname = cur.take_label_ident();
        if lname.is_empty() {
            return Err(ParseError::InvalidLabelName {
                query: cur.query.to_owned(),
                position,
            });
        }

        cur.skip_ws();
        if !cur.eat('=') {
            return Err(ParseError::Unexpected {
                query: cur.query.to_owned(),
                position: cur.pos,
            });
        }
        cur.skip_ws();
        let quote_pos = cur.pos;
        if !cur.eat('"') {
            return Err(ParseError::Unexpected {
                query: cur.query.to_owned(),
                position: cur.pos,
            });
        }
        let value = cur
            .take_quoted_rest()
            .ok_or_else(|| ParseError::UnterminatedValue {
                query: cur.query.to_owned(),
                position: quote_pos,
            })?;
        labels.insert(lname, value);

        cur.skip_ws();
        if cur.eat(',') {
            continue;
        }
        if cur.eat('}') {
            return Ok(());
        }
        return Err(ParseError::Unexpected {
            query: cur.query.to_owned(),
            position: cur.pos,
        });
    }
}

fn parse_range(cur: &mut Cursor<'_>) -> Result<Option<RangeVector>, ParseError> {
    cur.skip_ws();
    let open_pos = cur.pos;
    if !cur.eat('[') {
        return Ok(None);
    }
    let digits = cur.take_while(|c| c.is_ascii_digit());
    let unit = match cur.bump() {
        Some('s') => RangeUnit::Seconds,
        Some('m') => RangeUnit::Minutes,
        Some('h') => RangeUnit::Hours,
        Some('d') => RangeUnit::Days,
        Some('w') => RangeUnit::Weeks,
        _ => {
            return Err(ParseError::InvalidRange {
                query: cur.query.to_owned(),
                position: open_pos,
            })
        }
    };
    let value: u64 = digits.parse().map_err(|_| ParseError::InvalidRange {
        query: cur.query.to_owned(),
        position: open_pos,
    })?;
    if !cur.eat(']') {
        return Err(ParseError::InvalidRange {
            query: cur.query.to_owned(),
            position: open_pos,
        });
    }
    Ok(Some(RangeVector { value, unit }))
}

/// Character cursor with position tracking.
struct Cursor<'a> {
    query: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(query: &'a str) -> Self {
        Self {
            query,
            chars: query.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume `keyword` when the pending identifier matches it exactly.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_ident().as_deref() == Some(keyword) {
            self.pos += keyword.chars().count();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&keep) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    /// Word made of label-name characters, without consuming it.
    fn peek_ident(&self) -> Option<String> {
        let mut end = self.pos;
        while self
            .chars
            .get(end)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
        {
            end += 1;
        }
        if end == self.pos {
            None
        } else {
            Some(self.chars[self.pos..end].iter().collect())
        }
    }

    /// Whether the pending identifier is directly followed (modulo
    /// whitespace) by an opening paren, i.e. it is an operator call and
    /// not a metric name.
    fn ident_followed_by_paren(&self) -> bool {
        let mut end = self.pos;
        while self
            .chars
            .get(end)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
        {
            end += 1;
        }
        while self.chars.get(end).is_some_and(|c| c.is_whitespace()) {
            end += 1;
        }
        self.chars.get(end) == Some(&'(')
    }

    fn consume_ident_and_paren(&mut self) {
        self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
        self.skip_ws();
        self.eat('(');
        self.skip_ws();
    }

    /// `[a-zA-Z_:][a-zA-Z0-9_:]*`
    fn take_metric_ident(&mut self) -> String {
        if !self
            .peek()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
        {
            return String::new();
        }
        self.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
    }

    /// `[a-zA-Z_][a-zA-Z0-9_]*`
    fn take_label_ident(&mut self) -> String {
        if !self.peek().is_some_and(|c| c.is_ascii_alphabetic() || c == '_') {
            return String::new();
        }
        self.take_while(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// Consume a double-quoted value body after the opening quote,
    /// handling backslash escapes. Returns `None` when the closing quote
    /// is missing.
    fn take_quoted_rest(&mut self) -> Option<String> {
        let mut value = String::new();
        loop {
            match self.bump()? {
                '"' => return Some(value),
                '\\' => match self.bump()? {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    other => value.push(other),
                },
                c => value.push(c),
            }
        }
    }
}
