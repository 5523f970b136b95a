use crate::error::{Result, SyncError};
use crate::graph::Graph;
use crate::term::{Literal, Term, RDF_TYPE, XSD_BOOLEAN, XSD_DECIMAL, XSD_INTEGER};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

// ---------------------------------------------------------------------------
// Value / Bindings
// ---------------------------------------------------------------------------

/// A projected cell. `Unbound` is an explicit marker produced when an
/// OPTIONAL branch did not match; templates can tell it apart from a bound
/// empty string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bound(Term),
    Unbound,
}

impl Value {
    pub fn is_bound(&self) -> bool {
        matches!(self, Value::Bound(_))
    }

    pub fn lexical(&self) -> Option<&str> {
        match self {
            Value::Bound(term) => Some(term.lexical()),
            Value::Unbound => None,
        }
    }
}

/// One result row: projected variable name to value. Every projected
/// variable is present in every row.
pub type Bindings = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternTerm {
    Var(String),
    Fixed(Term),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriplePattern {
    pub subject: PatternTerm,
    pub predicate: PatternTerm,
    pub object: PatternTerm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternGroup {
    Required(TriplePattern),
    Optional(Vec<TriplePattern>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub variable: String,
    pub direction: SortDirection,
}

/// A parsed query: fixed named projection, graph pattern, optional ordering
/// directive. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub projection: Vec<String>,
    pub patterns: Vec<PatternGroup>,
    pub order_by: Vec<OrderKey>,
}

impl Query {
    /// Parse query text. Syntax errors surface here, before any graph is
    /// touched.
    pub fn parse(text: &str) -> Result<Query> {
        QueryParser::new(text).parse()
    }

    /// Execute against a graph. Row order is the query's ORDER BY when
    /// given; otherwise rows sort by full lexicographic comparison of the
    /// projected values, so storage iteration order can never leak into
    /// output.
    pub fn execute(&self, graph: &Graph) -> Result<Vec<Bindings>> {
        let mut solutions: Vec<HashMap<String, Term>> = vec![HashMap::new()];
        for group in &self.patterns {
            match group {
                PatternGroup::Required(pattern) => {
                    solutions = extend_all(graph, solutions, std::slice::from_ref(pattern));
                }
                PatternGroup::Optional(patterns) => {
                    let mut next = Vec::new();
                    for solution in solutions {
                        let extended =
                            extend_all(graph, vec![solution.clone()], patterns.as_slice());
                        if extended.is_empty() {
                            next.push(solution);
                        } else {
                            next.extend(extended);
                        }
                    }
                    solutions = next;
                }
            }
        }

        let mut rows: Vec<Bindings> = solutions
            .into_iter()
            .map(|solution| {
                self.projection
                    .iter()
                    .map(|var| {
                        let value = match solution.get(var) {
                            Some(term) => Value::Bound(term.clone()),
                            None => Value::Unbound,
                        };
                        (var.clone(), value)
                    })
                    .collect()
            })
            .collect();

        if self.order_by.is_empty() {
            rows.sort();
        } else {
            rows.sort_by(|a, b| self.compare_rows(a, b));
        }
        rows.dedup();
        Ok(rows)
    }

    fn compare_rows(&self, a: &Bindings, b: &Bindings) -> Ordering {
        for key in &self.order_by {
            let left = a.get(&key.variable);
            let right = b.get(&key.variable);
            let ordering = left.cmp(&right);
            let ordering = match key.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        // Full-row tiebreak keeps equal-keyed rows deterministic too.
        a.cmp(b)
    }
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

fn extend_all(
    graph: &Graph,
    mut solutions: Vec<HashMap<String, Term>>,
    patterns: &[TriplePattern],
) -> Vec<HashMap<String, Term>> {
    for pattern in patterns {
        let mut next = Vec::new();
        for solution in &solutions {
            for triple in graph.iter() {
                let mut candidate = solution.clone();
                if unify(&pattern.subject, &triple.subject, &mut candidate)
                    && unify(&pattern.predicate, &triple.predicate, &mut candidate)
                    && unify(&pattern.object, &triple.object, &mut candidate)
                {
                    next.push(candidate);
                }
            }
        }
        solutions = next;
        if solutions.is_empty() {
            break;
        }
    }
    solutions
}

fn unify(pattern: &PatternTerm, term: &Term, bindings: &mut HashMap<String, Term>) -> bool {
    match pattern {
        PatternTerm::Fixed(fixed) => fixed == term,
        PatternTerm::Var(name) => match bindings.get(name) {
            Some(bound) => bound == term,
            None => {
                bindings.insert(name.clone(), term.clone());
                true
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct QueryParser {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    prefixes: HashMap<String, String>,
}

impl QueryParser {
    fn new(text: &str) -> Self {
        QueryParser {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            prefixes: HashMap::new(),
        }
    }

    fn parse(mut self) -> Result<Query> {
        self.skip_trivia();
        while self.eat_keyword("PREFIX") {
            self.skip_trivia();
            let label = self.prefix_label()?;
            self.skip_trivia();
            let iri = self.iri_ref()?;
            self.prefixes.insert(label, iri);
            self.skip_trivia();
        }

        if !self.eat_keyword("SELECT") {
            return Err(self.error("expected SELECT".to_string()));
        }
        let mut projection = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some('?') {
                projection.push(self.variable()?);
            } else {
                break;
            }
        }
        if projection.is_empty() {
            return Err(self.error("SELECT needs at least one variable".to_string()));
        }

        self.skip_trivia();
        if !self.eat_keyword("WHERE") {
            return Err(self.error("expected WHERE".to_string()));
        }
        self.skip_trivia();
        self.expect('{')?;

        let mut patterns = Vec::new();
        loop {
            self.skip_trivia();
            if self.eat('}') {
                break;
            }
            if self.eat_keyword("OPTIONAL") {
                self.skip_trivia();
                self.expect('{')?;
                let mut group = Vec::new();
                loop {
                    self.skip_trivia();
                    if self.eat('}') {
                        break;
                    }
                    group.push(self.triple_pattern()?);
                    self.skip_trivia();
                    self.eat('.');
                }
                if group.is_empty() {
                    return Err(self.error("empty OPTIONAL group".to_string()));
                }
                patterns.push(PatternGroup::Optional(group));
            } else {
                patterns.push(PatternGroup::Required(self.triple_pattern()?));
                self.skip_trivia();
                self.eat('.');
            }
        }

        self.skip_trivia();
        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.skip_trivia();
            if !self.eat_keyword("BY") {
                return Err(self.error("expected BY after ORDER".to_string()));
            }
            loop {
                self.skip_trivia();
                if self.eat_keyword("ASC") {
                    self.skip_trivia();
                    self.expect('(')?;
                    self.skip_trivia();
                    let variable = self.variable()?;
                    self.skip_trivia();
                    self.expect(')')?;
                    order_by.push(OrderKey {
                        variable,
                        direction: SortDirection::Ascending,
                    });
                } else if self.eat_keyword("DESC") {
                    self.skip_trivia();
                    self.expect('(')?;
                    self.skip_trivia();
                    let variable = self.variable()?;
                    self.skip_trivia();
                    self.expect(')')?;
                    order_by.push(OrderKey {
                        variable,
                        direction: SortDirection::Descending,
                    });
                } else if self.peek() == Some('?') {
                    order_by.push(OrderKey {
                        variable: self.variable()?,
                        direction: SortDirection::Ascending,
                    });
                } else {
                    break;
                }
            }
            if order_by.is_empty() {
                return Err(self.error("ORDER BY needs at least one key".to_string()));
            }
        }

        self.skip_trivia();
        if !self.at_end() {
            return Err(self.error(format!(
                "unexpected trailing input starting with '{}'",
                self.peek().unwrap_or(' ')
            )));
        }

        Ok(Query {
            projection,
            patterns,
            order_by,
        })
    }

    fn triple_pattern(&mut self) -> Result<TriplePattern> {
        let subject = self.pattern_term(false)?;
        self.skip_trivia();
        let predicate = self.pattern_term(true)?;
        self.skip_trivia();
        let object = self.pattern_term(false)?;
        Ok(TriplePattern {
            subject,
            predicate,
            object,
        })
    }

    fn pattern_term(&mut self, predicate_position: bool) -> Result<PatternTerm> {
        match self.peek() {
            Some('?') => Ok(PatternTerm::Var(self.variable()?)),
            Some('<') => Ok(PatternTerm::Fixed(Term::Iri(self.iri_ref()?))),
            Some('"') => Ok(PatternTerm::Fixed(self.string_literal()?)),
            Some('a') if predicate_position
                && self
                    .peek_at(1)
                    .is_none_or(|c| c.is_whitespace() || c == '?' || c == '<') =>
            {
                self.pos += 1;
                Ok(PatternTerm::Fixed(Term::Iri(RDF_TYPE.to_string())))
            }
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' => {
                let mut text = String::new();
                if matches!(self.peek(), Some('+') | Some('-')) {
                    text.push(self.next_char().unwrap());
                }
                let mut decimal = false;
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.pos += 1;
                    } else if c == '.'
                        && !decimal
                        && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())
                    {
                        decimal = true;
                        text.push(c);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let datatype = if decimal { XSD_DECIMAL } else { XSD_INTEGER };
                Ok(PatternTerm::Fixed(Term::Literal(Literal::typed(
                    text, datatype,
                ))))
            }
            Some(_) if self.eat_keyword("true") => Ok(PatternTerm::Fixed(Term::Literal(
                Literal::typed("true", XSD_BOOLEAN),
            ))),
            Some(_) if self.eat_keyword("false") => Ok(PatternTerm::Fixed(Term::Literal(
                Literal::typed("false", XSD_BOOLEAN),
            ))),
            Some(c) if c.is_alphabetic() || c == '_' => {
                Ok(PatternTerm::Fixed(self.prefixed_name()?))
            }
            other => Err(self.error(format!(
                "expected pattern term, found {}",
                match other {
                    Some(c) => format!("'{c}'"),
                    None => "end of input".to_string(),
                }
            ))),
        }
    }

    fn variable(&mut self) -> Result<String> {
        self.expect('?')?;
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.error("empty variable name after '?'".to_string()));
        }
        Ok(name)
    }

    fn iri_ref(&mut self) -> Result<String> {
        self.expect('<')?;
        let mut iri = String::new();
        loop {
            match self.next_char() {
                Some('>') => return Ok(iri),
                Some('\n') | None => return Err(self.error("unterminated IRI".to_string())),
                Some(c) => iri.push(c),
            }
        }
    }

    fn prefix_label(&mut self) -> Result<String> {
        let mut label = String::new();
        while let Some(c) = self.peek() {
            if c == ':' {
                self.pos += 1;
                return Ok(label);
            }
            if c.is_alphanumeric() || c == '_' || c == '-' {
                label.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        Err(self.error("expected prefix label ending in ':'".to_string()))
    }

    fn prefixed_name(&mut self) -> Result<Term> {
        let start_line = self.line;
        let mut prefix = String::new();
        while let Some(c) = self.peek() {
            if c == ':' {
                break;
            }
            if c.is_alphanumeric() || c == '_' || c == '-' {
                prefix.push(c);
                self.pos += 1;
            } else {
                return Err(self.error(format!("unexpected character '{c}' in name")));
            }
        }
        if !self.eat(':') {
            return Err(SyncError::QueryParse {
                line: start_line,
                message: format!("expected ':' after prefix '{prefix}'"),
            });
        }
        let mut local = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                local.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        while local.ends_with('.') {
            local.pop();
            self.pos -= 1;
        }
        let namespace = self.prefixes.get(&prefix).ok_or_else(|| SyncError::QueryParse {
            line: start_line,
            message: format!("unknown prefix '{prefix}:'"),
        })?;
        Ok(Term::Iri(format!("{namespace}{local}")))
    }

    fn string_literal(&mut self) -> Result<Term> {
        self.expect('"')?;
        let mut lexical = String::new();
        loop {
            match self.next_char() {
                Some('"') => break,
                Some('\\') => match self.next_char() {
                    Some('\\') => lexical.push('\\'),
                    Some('"') => lexical.push('"'),
                    Some('n') => lexical.push('\n'),
                    Some('t') => lexical.push('\t'),
                    other => {
                        return Err(self.error(format!(
                            "invalid escape '\\{}'",
                            other.map(String::from).unwrap_or_default()
                        )))
                    }
                },
                Some('\n') | None => {
                    return Err(self.error("unterminated string literal".to_string()))
                }
                Some(c) => lexical.push(c),
            }
        }
        if self.peek() == Some('^') && self.peek_at(1) == Some('^') {
            self.pos += 2;
            let datatype = match self.peek() {
                Some('<') => self.iri_ref()?,
                _ => match self.prefixed_name()? {
                    Term::Iri(iri) => iri,
                    _ => unreachable!("prefixed_name only returns IRIs"),
                },
            };
            return Ok(Term::Literal(Literal::typed(lexical, datatype)));
        }
        if self.eat('@') {
            let mut lang = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() || c == '-' {
                    lang.push(c);
                    self.pos += 1;
                } else {
                    break;
                }
            }
            return Ok(Term::Literal(Literal::tagged(lexical, lang)));
        }
        Ok(Term::Literal(Literal::string(lexical)))
    }

    // -----------------------------------------------------------------------
    // Scanner plumbing
    // -----------------------------------------------------------------------

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                self.line += 1;
                self.pos += 1;
            } else if c.is_whitespace() {
                self.pos += 1;
            } else if c == '#' {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let len = keyword.chars().count();
        let matches = keyword.chars().enumerate().all(|(i, k)| {
            self.peek_at(i)
                .is_some_and(|c| c.eq_ignore_ascii_case(&k))
        });
        let boundary_ok = self
            .peek_at(len)
            .is_none_or(|c| !c.is_alphanumeric() && c != '_' && c != ':');
        if matches && boundary_ok {
            self.pos += len;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            other => Err(self.error(format!(
                "expected '{expected}', found {}",
                match other {
                    Some(c) => format!("'{c}'"),
                    None => "end of input".to_string(),
                }
            ))),
        }
    }

    fn error(&self, message: String) -> SyncError {
        SyncError::QueryParse {
            line: self.line,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
