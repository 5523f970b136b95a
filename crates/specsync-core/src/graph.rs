use crate::error::{Result, SyncError};
use crate::term::{Literal, Term, RDF_TYPE, XSD_BOOLEAN, XSD_DECIMAL, XSD_INTEGER};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

// ---------------------------------------------------------------------------
// Triple
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

impl Triple {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Triple {
            subject,
            predicate,
            object,
        }
    }
}

// ---------------------------------------------------------------------------
// GraphSource
// ---------------------------------------------------------------------------

/// A named chunk of serialized triples, either read from disk or supplied
/// inline (tests, stdin). The name is only used in error messages.
#[derive(Debug, Clone)]
pub struct GraphSource {
    pub name: String,
    pub text: String,
}

impl GraphSource {
    pub fn inline(name: impl Into<String>, text: impl Into<String>) -> Self {
        GraphSource {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SyncError::SourceNotFound(path.display().to_string()));
        }
        Ok(GraphSource {
            name: path.display().to_string(),
            text: std::fs::read_to_string(path)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// An immutable set of triples. Sources are merged with set-union semantics,
/// so the same triple stated twice collapses to one. The `BTreeSet` keeps
/// iteration in lexicographic term order, which makes every derived
/// serialization stable across runs and platforms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    triples: BTreeSet<Triple>,
}

impl Graph {
    /// Parse and merge all sources into a single graph. An empty source set
    /// yields a valid empty graph.
    pub fn parse(sources: &[GraphSource]) -> Result<Graph> {
        let mut triples = BTreeSet::new();
        for source in sources {
            Parser::new(source).run(&mut triples)?;
        }
        Ok(Graph { triples })
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.triples.contains(triple)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Triple> {
        self.triples.iter()
    }

    /// All objects of `(subject, predicate, ?)` triples, in term order.
    pub fn objects<'a>(&'a self, subject: &Term, predicate: &str) -> Vec<&'a Term> {
        self.triples
            .iter()
            .filter(|t| &t.subject == subject && t.predicate == Term::Iri(predicate.to_string()))
            .map(|t| &t.object)
            .collect()
    }

    /// All subjects declared to be of `class_iri` via `rdf:type`, in term
    /// order.
    pub fn subjects_of_type(&self, class_iri: &str) -> Vec<&Term> {
        let class = Term::Iri(class_iri.to_string());
        self.triples
            .iter()
            .filter(|t| t.predicate == Term::Iri(RDF_TYPE.to_string()) && t.object == class)
            .map(|t| &t.subject)
            .collect()
    }

    /// Sorted N-Triples serialization. Two graphs with the same triple set
    /// always produce identical bytes here, which is what the receipt's
    /// graph digest is computed over.
    pub fn canonical_ntriples(&self) -> String {
        let mut out = String::new();
        for t in &self.triples {
            out.push_str(&t.subject.to_ntriples());
            out.push(' ');
            out.push_str(&t.predicate.to_ntriples());
            out.push(' ');
            out.push_str(&t.object.to_ntriples());
            out.push_str(" .\n");
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Turtle-subset parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    source_name: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: usize,
    base: Option<String>,
    prefixes: HashMap<String, String>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a GraphSource) -> Self {
        Parser {
            source_name: &source.name,
            chars: source.text.chars().collect(),
            pos: 0,
            line: 1,
            base: None,
            prefixes: HashMap::new(),
        }
    }

    fn run(mut self, triples: &mut BTreeSet<Triple>) -> Result<()> {
        loop {
            self.skip_trivia();
            if self.at_end() {
                return Ok(());
            }
            if self.try_directive()? {
                continue;
            }
            self.statement(triples)?;
        }
    }

    // -----------------------------------------------------------------------
    // Directives
    // -----------------------------------------------------------------------

    fn try_directive(&mut self) -> Result<bool> {
        // The '@prefix' spelling requires a terminating dot, the SPARQL
        // spelling forbids it.
        if self.eat_keyword("@prefix") {
            self.prefix_directive(true)?;
            return Ok(true);
        }
        if self.eat_keyword_ci("PREFIX") {
            self.prefix_directive(false)?;
            return Ok(true);
        }
        if self.eat_keyword("@base") {
            self.base_directive(true)?;
            return Ok(true);
        }
        if self.eat_keyword_ci("BASE") {
            self.base_directive(false)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn prefix_directive(&mut self, dot_terminated: bool) -> Result<()> {
        self.skip_trivia();
        let prefix = self.prefix_label()?;
        self.skip_trivia();
        let iri = self.iri_ref()?;
        self.prefixes.insert(prefix, iri);
        if dot_terminated {
            self.skip_trivia();
            self.expect('.')?;
        }
        Ok(())
    }

    fn base_directive(&mut self, dot_terminated: bool) -> Result<()> {
        self.skip_trivia();
        let iri = self.iri_ref()?;
        self.base = Some(iri);
        if dot_terminated {
            self.skip_trivia();
            self.expect('.')?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn statement(&mut self, triples: &mut BTreeSet<Triple>) -> Result<()> {
        let subject = self.subject()?;
        loop {
            self.skip_trivia();
            let predicate = self.predicate()?;
            loop {
                self.skip_trivia();
                let object = self.object()?;
                triples.insert(Triple::new(subject.clone(), predicate.clone(), object));
                self.skip_trivia();
                if !self.eat(',') {
                    break;
                }
            }
            if self.eat(';') {
                // Tolerate a dangling ';' before the final dot.
                self.skip_trivia();
                if self.peek() == Some('.') {
                    break;
                }
                continue;
            }
            break;
        }
        self.skip_trivia();
        self.expect('.')?;
        Ok(())
    }

    fn subject(&mut self) -> Result<Term> {
        match self.peek() {
            Some('<') => Ok(Term::Iri(self.iri_ref()?)),
            Some('_') => self.blank_node(),
            Some(c) if is_pname_start(c) => self.prefixed_name(),
            other => Err(self.error(format!(
                "expected subject, found {}",
                describe_char(other)
            ))),
        }
    }

    fn predicate(&mut self) -> Result<Term> {
        // 'a' is shorthand for rdf:type when followed by whitespace.
        if self.peek() == Some('a') && self.peek_at(1).is_none_or(|c| c.is_whitespace()) {
            self.pos += 1;
            return Ok(Term::Iri(RDF_TYPE.to_string()));
        }
        match self.peek() {
            Some('<') => Ok(Term::Iri(self.iri_ref()?)),
            Some(c) if is_pname_start(c) => self.prefixed_name(),
            other => Err(self.error(format!(
                "expected predicate, found {}",
                describe_char(other)
            ))),
        }
    }

    fn object(&mut self) -> Result<Term> {
        match self.peek() {
            Some('<') => Ok(Term::Iri(self.iri_ref()?)),
            Some('_') => self.blank_node(),
            Some('"') => self.string_literal(),
            Some(c) if c.is_ascii_digit() || c == '+' || c == '-' => self.numeric_literal(),
            Some(_) if self.eat_keyword("true") => {
                Ok(Term::Literal(Literal::typed("true", XSD_BOOLEAN)))
            }
            Some(_) if self.eat_keyword("false") => {
                Ok(Term::Literal(Literal::typed("false", XSD_BOOLEAN)))
            }
            Some(c) if is_pname_start(c) => self.prefixed_name(),
            other => Err(self.error(format!(
                "expected object, found {}",
                describe_char(other)
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Terminals
    // -----------------------------------------------------------------------

    fn iri_ref(&mut self) -> Result<String> {
        self.expect('<')?;
        let mut iri = String::new();
        loop {
            match self.next_char() {
                Some('>') => break,
                Some('\n') | None => return Err(self.error("unterminated IRI".to_string())),
                Some(c) => iri.push(c),
            }
        }
        if let Some(base) = &self.base {
            if !iri.contains("://") && !iri.starts_with("urn:") {
                return Ok(format!("{base}{iri}"));
            }
        }
        Ok(iri)
    }

    fn prefix_label(&mut self) -> Result<String> {
        let mut label = String::new();
        while let Some(c) = self.peek() {
            if c == ':' {
                self.pos += 1;
                return Ok(label);
            }
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
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
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                prefix.push(c);
                self.pos += 1;
            } else {
                return Err(self.error(format!("unexpected character '{c}' in name")));
            }
        }
        if !self.eat(':') {
            return Err(SyncError::GraphParse {
                source_name: self.source_name.to_string(),
                line: start_line,
                message: format!("expected ':' after prefix '{prefix}'"),
            });
        }
        let mut local = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '%' {
                local.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        // A trailing dot is the statement terminator, not part of the name.
        while local.ends_with('.') {
            local.pop();
            self.pos -= 1;
        }
        let namespace = self.prefixes.get(&prefix).ok_or_else(|| SyncError::GraphParse {
            source_name: self.source_name.to_string(),
            line: start_line,
            message: format!("unknown prefix '{prefix}:'"),
        })?;
        Ok(Term::Iri(format!("{namespace}{local}")))
    }

    fn blank_node(&mut self) -> Result<Term> {
        self.expect('_')?;
        self.expect(':')?;
        let mut label = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                label.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if label.is_empty() {
            return Err(self.error("empty blank node label".to_string()));
        }
        Ok(Term::Blank(label))
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
                    Some('r') => lexical.push('\r'),
                    Some('t') => lexical.push('\t'),
                    Some('u') => lexical.push(self.unicode_escape(4)?),
                    Some('U') => lexical.push(self.unicode_escape(8)?),
                    other => {
                        return Err(self.error(format!(
                            "invalid escape sequence '\\{}'",
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
        // Optional language tag or datatype annotation.
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
            if lang.is_empty() {
                return Err(self.error("empty language tag".to_string()));
            }
            return Ok(Term::Literal(Literal::tagged(lexical, lang)));
        }
        if self.peek() == Some('^') && self.peek_at(1) == Some('^') {
            self.pos += 2;
            let datatype = match self.peek() {
                Some('<') => self.iri_ref()?,
                Some(c) if is_pname_start(c) => match self.prefixed_name()? {
                    Term::Iri(iri) => iri,
                    _ => unreachable!("prefixed_name only returns IRIs"),
                },
                other => {
                    return Err(self.error(format!(
                        "expected datatype IRI after '^^', found {}",
                        describe_char(other)
                    )))
                }
            };
            return Ok(Term::Literal(Literal::typed(lexical, datatype)));
        }
        Ok(Term::Literal(Literal::string(lexical)))
    }

    fn numeric_literal(&mut self) -> Result<Term> {
        let mut text = String::new();
        if matches!(self.peek(), Some('+') | Some('-')) {
            text.push(self.next_char().unwrap());
        }
        let mut decimal = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.pos += 1;
            } else if c == '.' && !decimal && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
                decimal = true;
                text.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if text.is_empty() || text == "+" || text == "-" {
            return Err(self.error("malformed numeric literal".to_string()));
        }
        let datatype = if decimal { XSD_DECIMAL } else { XSD_INTEGER };
        Ok(Term::Literal(Literal::typed(text, datatype)))
    }

    fn unicode_escape(&mut self, len: usize) -> Result<char> {
        let mut hex = String::new();
        for _ in 0..len {
            match self.next_char() {
                Some(c) if c.is_ascii_hexdigit() => hex.push(c),
                _ => return Err(self.error("malformed unicode escape".to_string())),
            }
        }
        let code = u32::from_str_radix(&hex, 16)
            .map_err(|_| self.error("malformed unicode escape".to_string()))?;
        char::from_u32(code).ok_or_else(|| self.error(format!("invalid code point U+{hex}")))
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
        let matches = keyword
            .chars()
            .enumerate()
            .all(|(i, k)| self.peek_at(i) == Some(k));
        // ':' would make this the prefix of a prefixed name, not a keyword.
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

    fn eat_keyword_ci(&mut self, keyword: &str) -> bool {
        let len = keyword.chars().count();
        let matches = keyword
            .chars()
            .enumerate()
            .all(|(i, k)| {
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
                describe_char(other)
            ))),
        }
    }

    fn error(&self, message: String) -> SyncError {
        SyncError::GraphParse {
            source_name: self.source_name.to_string(),
            line: self.line,
            message,
        }
    }
}

fn is_pname_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == ':'
}

fn describe_char(c: Option<char>) -> String {
    match c {
        Some(c) => format!("'{c}'"),
        None => "end of input".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(text: &str) -> Graph {
        Graph::parse(&[GraphSource::inline("test.ttl", text)]).unwrap()
    }

    #[test]
    fn empty_source_set_is_valid_empty_graph() {
        let graph = Graph::parse(&[]).unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.canonical_ntriples(), "");
    }

    #[test]
    fn parses_basic_statement() {
        let graph = parse_one(
            "@prefix ex: <http://example.org/> .\n\
             ex:cmd1 a ex:Command ;\n\
                 ex:label \"hello\" .\n",
        );
        assert_eq!(graph.len(), 2);
        let cmd = Term::iri("http://example.org/cmd1");
        assert_eq!(
            graph.objects(&cmd, "http://example.org/label"),
            vec![&Term::Literal(Literal::string("hello"))]
        );
        assert_eq!(graph.subjects_of_type("http://example.org/Command"), vec![&cmd]);
    }

    #[test]
    fn sparql_style_prefix_without_dot() {
        let graph = parse_one(
            "PREFIX ex: <http://example.org/>\n\
             ex:a ex:p ex:b .\n",
        );
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn object_lists_and_predicate_lists() {
        let graph = parse_one(
            "@prefix ex: <http://example.org/> .\n\
             ex:s ex:p ex:a, ex:b ; ex:q \"x\" .\n",
        );
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn duplicate_triples_collapse() {
        let graph = parse_one(
            "@prefix ex: <http://example.org/> .\n\
             ex:s ex:p ex:o .\n\
             ex:s ex:p ex:o .\n",
        );
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn merge_is_set_union_across_sources() {
        let a = GraphSource::inline(
            "a.ttl",
            "@prefix ex: <http://example.org/> . ex:s ex:p ex:o .",
        );
        let b = GraphSource::inline(
            "b.ttl",
            "@prefix ex: <http://example.org/> . ex:s ex:p ex:o . ex:s ex:p ex:o2 .",
        );
        let graph = Graph::parse(&[a, b]).unwrap();
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn typed_and_tagged_literals() {
        let graph = parse_one(
            "@prefix ex: <http://example.org/> .\n\
             @prefix xsd: <http://www.w3.org/2001/XMLSchema#> .\n\
             ex:s ex:count 42 ;\n\
                  ex:rate 1.5 ;\n\
                  ex:active true ;\n\
                  ex:pinned \"7\"^^xsd:integer ;\n\
                  ex:greeting \"hallo\"@de .\n",
        );
        let s = Term::iri("http://example.org/s");
        assert_eq!(
            graph.objects(&s, "http://example.org/count"),
            vec![&Term::Literal(Literal::typed("42", XSD_INTEGER))]
        );
        assert_eq!(
            graph.objects(&s, "http://example.org/pinned"),
            vec![&Term::Literal(Literal::typed("7", XSD_INTEGER))]
        );
        assert_eq!(
            graph.objects(&s, "http://example.org/greeting"),
            vec![&Term::Literal(Literal::tagged("hallo", "de"))]
        );
    }

    #[test]
    fn blank_nodes_and_comments() {
        let graph = parse_one(
            "@prefix ex: <http://example.org/> .\n\
             # a comment line\n\
             _:n1 ex:p \"v\" . # trailing comment\n",
        );
        assert_eq!(graph.len(), 1);
        assert!(graph.iter().next().unwrap().subject == Term::Blank("n1".into()));
    }

    #[test]
    fn base_resolves_relative_iris() {
        let graph = parse_one(
            "@base <http://example.org/> .\n\
             <s> <p> <o> .\n",
        );
        assert!(graph.contains(&Triple::new(
            Term::iri("http://example.org/s"),
            Term::iri("http://example.org/p"),
            Term::iri("http://example.org/o"),
        )));
    }

    #[test]
    fn unknown_prefix_is_an_error_with_line() {
        let err = Graph::parse(&[GraphSource::inline(
            "bad.ttl",
            "@prefix ex: <http://example.org/> .\nex:s nope:p ex:o .\n",
        )])
        .unwrap_err();
        match err {
            SyncError::GraphParse {
                source_name, line, ..
            } => {
                assert_eq!(source_name, "bad.ttl");
                assert_eq!(line, 2);
            }
            other => panic!("expected GraphParse, got {other}"),
        }
    }

    #[test]
    fn unterminated_literal_is_an_error() {
        let err = Graph::parse(&[GraphSource::inline(
            "bad.ttl",
            "@prefix ex: <http://example.org/> . ex:s ex:p \"oops .",
        )])
        .unwrap_err();
        assert!(matches!(err, SyncError::GraphParse { .. }));
    }

    #[test]
    fn string_escapes_roundtrip() {
        let graph = parse_one(
            "@prefix ex: <http://example.org/> .\n\
             ex:s ex:p \"line\\none \\\"two\\\" \\u0041\" .\n",
        );
        let s = Term::iri("http://example.org/s");
        let objects = graph.objects(&s, "http://example.org/p");
        assert_eq!(
            objects[0],
            &Term::Literal(Literal::string("line\none \"two\" A"))
        );
    }

    #[test]
    fn canonical_serialization_is_sorted_and_stable() {
        let forward = parse_one(
            "@prefix ex: <http://example.org/> .\n\
             ex:a ex:p ex:b .\n\
             ex:a ex:p \"lit\" .\n\
             ex:z ex:p ex:b .\n",
        );
        let reversed = parse_one(
            "@prefix ex: <http://example.org/> .\n\
             ex:z ex:p ex:b .\n\
             ex:a ex:p \"lit\" .\n\
             ex:a ex:p ex:b .\n",
        );
        assert_eq!(forward.canonical_ntriples(), reversed.canonical_ntriples());
        assert!(forward
            .canonical_ntriples()
            .starts_with("<http://example.org/a>"));
    }

    #[test]
    fn missing_file_is_source_not_found() {
        let err = GraphSource::from_file(Path::new("/nonexistent/x.ttl")).unwrap_err();
        assert!(matches!(err, SyncError::SourceNotFound(_)));
    }
}
