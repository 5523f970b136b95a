use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Literal
// ---------------------------------------------------------------------------

/// An RDF literal: a lexical form plus an optional datatype IRI or language
/// tag. Plain string literals carry neither.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Literal {
    pub lexical: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl Literal {
    pub fn string(lexical: impl Into<String>) -> Self {
        Literal {
            lexical: lexical.into(),
            datatype: None,
            lang: None,
        }
    }

    pub fn typed(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        Literal {
            lexical: lexical.into(),
            datatype: Some(datatype.into()),
            lang: None,
        }
    }

    pub fn tagged(lexical: impl Into<String>, lang: impl Into<String>) -> Self {
        Literal {
            lexical: lexical.into(),
            datatype: None,
            lang: Some(lang.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Term
// ---------------------------------------------------------------------------

/// A node in a graph. The derived `Ord` gives terms a total lexicographic
/// order (IRIs, then blank nodes, then literals) which every deterministic
/// serialization in the pipeline relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    Iri(String),
    Blank(String),
    Literal(Literal),
}

impl Term {
    pub fn iri(value: impl Into<String>) -> Self {
        Term::Iri(value.into())
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Term::Literal(_))
    }

    /// The plain-text value used for bindings: IRI text, blank node label,
    /// or the literal's lexical form.
    pub fn lexical(&self) -> &str {
        match self {
            Term::Iri(iri) => iri,
            Term::Blank(label) => label,
            Term::Literal(lit) => &lit.lexical,
        }
    }

    /// N-Triples form, used by the canonical graph serialization.
    pub fn to_ntriples(&self) -> String {
        match self {
            Term::Iri(iri) => format!("<{iri}>"),
            Term::Blank(label) => format!("_:{label}"),
            Term::Literal(lit) => {
                let escaped = escape_literal(&lit.lexical);
                match (&lit.datatype, &lit.lang) {
                    (Some(dt), _) => format!("\"{escaped}\"^^<{dt}>"),
                    (None, Some(lang)) => format!("\"{escaped}\"@{lang}"),
                    (None, None) => format!("\"{escaped}\""),
                }
            }
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ntriples())
    }
}

fn escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Well-known datatype IRIs
// ---------------------------------------------------------------------------

pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
