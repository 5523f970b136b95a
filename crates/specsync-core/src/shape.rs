use crate::error::{Result, SyncError};
use crate::graph::Graph;
use crate::term::{Term, XSD_BOOLEAN, XSD_DECIMAL, XSD_INTEGER, XSD_STRING};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Violation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// The offending node (IRI or blank node label).
    pub node: String,
    /// The property path the constraint applies to.
    pub path: String,
    /// Which constraint was violated: min_count, max_count, datatype, pattern.
    pub constraint: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// DatatypeRule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatatypeRule {
    Iri,
    String,
    Integer,
    Decimal,
    Boolean,
}

impl DatatypeRule {
    fn matches(self, term: &Term) -> bool {
        match (self, term) {
            (DatatypeRule::Iri, Term::Iri(_)) => true,
            (DatatypeRule::String, Term::Literal(lit)) => {
                lit.datatype.is_none() || lit.datatype.as_deref() == Some(XSD_STRING)
            }
            (DatatypeRule::Integer, Term::Literal(lit)) => {
                lit.datatype.as_deref() == Some(XSD_INTEGER)
            }
            (DatatypeRule::Decimal, Term::Literal(lit)) => {
                matches!(lit.datatype.as_deref(), Some(XSD_DECIMAL) | Some(XSD_INTEGER))
            }
            (DatatypeRule::Boolean, Term::Literal(lit)) => {
                lit.datatype.as_deref() == Some(XSD_BOOLEAN)
            }
            _ => false,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            DatatypeRule::Iri => "an IRI",
            DatatypeRule::String => "a string literal",
            DatatypeRule::Integer => "an integer literal",
            DatatypeRule::Decimal => "a decimal literal",
            DatatypeRule::Boolean => "a boolean literal",
        }
    }
}

// ---------------------------------------------------------------------------
// PropertyRule / Shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyRule {
    /// Predicate IRI this rule constrains.
    pub path: String,
    #[serde(default)]
    pub min_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<DatatypeRule>,
    /// Regex the lexical form of every value must match in full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shape {
    /// Class IRI whose instances this shape targets.
    pub target_class: String,
    #[serde(default)]
    pub properties: Vec<PropertyRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ShapeFile {
    #[serde(default)]
    shapes: Vec<Shape>,
}

// ---------------------------------------------------------------------------
// ShapeSet
// ---------------------------------------------------------------------------

/// A loaded, pattern-compiled constraint set. Validation never mutates the
/// graph; it only reports.
#[derive(Debug, Default)]
pub struct ShapeSet {
    shapes: Vec<Shape>,
    // Compiled alongside `shapes`, index-aligned per (shape, property).
    patterns: Vec<Vec<Option<Regex>>>,
}

impl ShapeSet {
    pub fn empty() -> Self {
        ShapeSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Load and merge one or more YAML shape files. Invalid regex patterns
    /// are rejected here, before any graph is validated.
    pub fn load(paths: &[impl AsRef<Path>]) -> Result<Self> {
        let mut shapes = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                return Err(SyncError::SourceNotFound(path.display().to_string()));
            }
            let text = std::fs::read_to_string(path)?;
            let file: ShapeFile =
                serde_yaml::from_str(&text).map_err(|e| SyncError::ShapeDefinition {
                    file: path.display().to_string(),
                    message: e.to_string(),
                })?;
            shapes.extend(file.shapes);
        }
        Self::from_shapes(shapes)
    }

    pub fn from_shapes(shapes: Vec<Shape>) -> Result<Self> {
        let mut patterns = Vec::with_capacity(shapes.len());
        for shape in &shapes {
            let mut compiled = Vec::with_capacity(shape.properties.len());
            for rule in &shape.properties {
                match &rule.pattern {
                    Some(pattern) => {
                        let anchored = format!("^(?:{pattern})$");
                        let re = Regex::new(&anchored).map_err(|e| SyncError::ShapeDefinition {
                            file: shape.target_class.clone(),
                            message: format!("invalid pattern for {}: {e}", rule.path),
                        })?;
                        compiled.push(Some(re));
                    }
                    None => compiled.push(None),
                }
            }
            patterns.push(compiled);
        }
        Ok(ShapeSet { shapes, patterns })
    }

    /// Check every targeted node against its shape. Returns ALL violations
    /// found, never a prefix: the caller fixes the whole batch in one pass.
    pub fn validate(&self, graph: &Graph) -> Vec<Violation> {
        let mut violations = Vec::new();
        for (shape, compiled) in self.shapes.iter().zip(&self.patterns) {
            for node in graph.subjects_of_type(&shape.target_class) {
                for (rule, pattern) in shape.properties.iter().zip(compiled) {
                    check_property(graph, node, rule, pattern.as_ref(), &mut violations);
                }
            }
        }
        violations
    }
}

fn check_property(
    graph: &Graph,
    node: &Term,
    rule: &PropertyRule,
    pattern: Option<&Regex>,
    violations: &mut Vec<Violation>,
) {
    let values = graph.objects(node, &rule.path);
    let count = values.len() as u32;
    let node_text = node.to_ntriples();

    if count < rule.min_count {
        violations.push(Violation {
            node: node_text.clone(),
            path: rule.path.clone(),
            constraint: "min_count".into(),
            message: format!(
                "expected at least {} value(s), found {count}",
                rule.min_count
            ),
        });
    }
    if let Some(max) = rule.max_count {
        if count > max {
            violations.push(Violation {
                node: node_text.clone(),
                path: rule.path.clone(),
                constraint: "max_count".into(),
                message: format!("expected at most {max} value(s), found {count}"),
            });
        }
    }
    for value in &values {
        if let Some(datatype) = rule.datatype {
            if !datatype.matches(value) {
                violations.push(Violation {
                    node: node_text.clone(),
                    path: rule.path.clone(),
                    constraint: "datatype".into(),
                    message: format!(
                        "expected {}, found {}",
                        datatype.describe(),
                        value.to_ntriples()
                    ),
                });
            }
        }
        if let Some(re) = pattern {
            if !re.is_match(value.lexical()) {
                violations.push(Violation {
                    node: node_text.clone(),
                    path: rule.path.clone(),
                    constraint: "pattern".into(),
                    message: format!(
                        "value {} does not match pattern {}",
                        value.to_ntriples(),
                        rule.pattern.as_deref().unwrap_or_default()
                    ),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphSource;

    const EX: &str = "http://example.org/";

    fn command_shape(min: u32, max: Option<u32>) -> ShapeSet {
        ShapeSet::from_shapes(vec![Shape {
            target_class: format!("{EX}Command"),
            properties: vec![PropertyRule {
                path: format!("{EX}label"),
                min_count: min,
                max_count: max,
                datatype: Some(DatatypeRule::String),
                pattern: None,
            }],
        }])
        .unwrap()
    }

    fn graph(text: &str) -> Graph {
        Graph::parse(&[GraphSource::inline("test.ttl", text)]).unwrap()
    }

    #[test]
    fn conformant_graph_has_no_violations() {
        let g = graph(
            "@prefix ex: <http://example.org/> .\n\
             ex:cmd1 a ex:Command ; ex:label \"hello\" .\n",
        );
        assert!(command_shape(1, Some(1)).validate(&g).is_empty());
    }

    #[test]
    fn empty_graph_vacuously_conforms() {
        let g = Graph::parse(&[]).unwrap();
        assert!(command_shape(1, Some(1)).validate(&g).is_empty());
    }

    #[test]
    fn all_violations_are_enumerated_not_just_the_first() {
        // Three violating nodes: two missing labels, one with two labels.
        let g = graph(
            "@prefix ex: <http://example.org/> .\n\
             ex:a a ex:Command .\n\
             ex:b a ex:Command .\n\
             ex:c a ex:Command ; ex:label \"x\", \"y\" .\n",
        );
        let violations = command_shape(1, Some(1)).validate(&g);
        assert_eq!(violations.len(), 3);
        let constraints: Vec<&str> =
            violations.iter().map(|v| v.constraint.as_str()).collect();
        assert_eq!(
            constraints
                .iter()
                .filter(|c| **c == "min_count")
                .count(),
            2
        );
        assert_eq!(
            constraints
                .iter()
                .filter(|c| **c == "max_count")
                .count(),
            1
        );
    }

    #[test]
    fn datatype_rule_rejects_iri_where_string_expected() {
        let g = graph(
            "@prefix ex: <http://example.org/> .\n\
             ex:a a ex:Command ; ex:label ex:other .\n",
        );
        let violations = command_shape(0, None).validate(&g);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].constraint, "datatype");
    }

    #[test]
    fn integer_datatype_matches_bare_numbers() {
        let shapes = ShapeSet::from_shapes(vec![Shape {
            target_class: format!("{EX}Command"),
            properties: vec![PropertyRule {
                path: format!("{EX}arity"),
                min_count: 1,
                max_count: None,
                datatype: Some(DatatypeRule::Integer),
                pattern: None,
            }],
        }])
        .unwrap();
        let g = graph(
            "@prefix ex: <http://example.org/> .\n\
             ex:a a ex:Command ; ex:arity 2 .\n",
        );
        assert!(shapes.validate(&g).is_empty());
    }

    #[test]
    fn pattern_is_anchored_full_match() {
        let shapes = ShapeSet::from_shapes(vec![Shape {
            target_class: format!("{EX}Command"),
            properties: vec![PropertyRule {
                path: format!("{EX}label"),
                min_count: 0,
                max_count: None,
                datatype: None,
                pattern: Some("[a-z]+".into()),
            }],
        }])
        .unwrap();
        let g = graph(
            "@prefix ex: <http://example.org/> .\n\
             ex:a a ex:Command ; ex:label \"ok\" .\n\
             ex:b a ex:Command ; ex:label \"Not OK\" .\n",
        );
        let violations = shapes.validate(&g);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].constraint, "pattern");
        assert!(violations[0].node.contains("example.org/b"));
    }

    #[test]
    fn invalid_pattern_fails_at_load_time() {
        let err = ShapeSet::from_shapes(vec![Shape {
            target_class: format!("{EX}Command"),
            properties: vec![PropertyRule {
                path: format!("{EX}label"),
                min_count: 0,
                max_count: None,
                datatype: None,
                pattern: Some("(unclosed".into()),
            }],
        }])
        .unwrap_err();
        assert!(matches!(err, SyncError::ShapeDefinition { .. }));
    }

    #[test]
    fn shape_yaml_roundtrip() {
        let yaml = r#"
shapes:
  - target_class: "http://example.org/Command"
    properties:
      - path: "http://example.org/label"
        min_count: 1
        max_count: 1
        datatype: string
        pattern: "[a-z][a-z0-9-]*"
"#;
        let file: ShapeFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.shapes.len(), 1);
        assert_eq!(file.shapes[0].properties[0].min_count, 1);
        assert_eq!(
            file.shapes[0].properties[0].datatype,
            Some(DatatypeRule::String)
        );
        let set = ShapeSet::from_shapes(file.shapes).unwrap();
        assert_eq!(set.len(), 1);
    }
}
