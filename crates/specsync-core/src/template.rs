use crate::error::{Result, SyncError};
use crate::query::{Bindings, Value};
use std::collections::BTreeMap;

/// Static values (project name, version, ...) available to every render
/// alongside the extracted rows.
pub type StaticContext = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterCall {
    name: String,
    args: BTreeMap<String, String>,
    line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Expr {
    path: Vec<String>,
    filters: Vec<FilterCall>,
    line: usize,
}

impl Expr {
    fn display_path(&self) -> String {
        self.path.join(".")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Interp(Expr),
    For {
        var: String,
        source: Expr,
        body: Vec<Node>,
    },
    If {
        cond: Expr,
        then_body: Vec<Node>,
        else_body: Vec<Node>,
    },
}

/// A parsed template: literal text, `{{ expr }}` interpolations, and
/// `{% for %}` / `{% if %}` blocks over a closed filter set. There is no
/// way to run arbitrary logic from a template; the grammar is the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

// ---------------------------------------------------------------------------
// Runtime values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum TValue {
    Str(String),
    Row(Bindings),
    Rows(Vec<Bindings>),
    /// Variable matched by the query but not bound in this row.
    Unbound,
    /// Name that resolves to nothing at all.
    Undefined,
}

impl TValue {
    fn type_name(&self) -> &'static str {
        match self {
            TValue::Str(_) => "string",
            TValue::Row(_) => "row",
            TValue::Rows(_) => "row list",
            TValue::Unbound => "unbound",
            TValue::Undefined => "undefined",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            TValue::Str(s) => !s.is_empty(),
            TValue::Row(_) => true,
            TValue::Rows(rows) => !rows.is_empty(),
            TValue::Unbound | TValue::Undefined => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Segment {
    Text(String),
    Interp { content: String, line: usize },
    Tag { content: String, line: usize },
}

impl Template {
    pub fn parse(text: &str) -> Result<Template> {
        let segments = lex(text)?;
        let mut parser = BlockParser {
            segments,
            pos: 0,
        };
        let nodes = parser.block(&[])?;
        Ok(Template { nodes })
    }

    /// Render against the extracted rows and static context. Referencing an
    /// undefined name, or an unbound optional without a `default(...)`
    /// filter, is a hard error — never a silent blank.
    pub fn render(&self, rows: &[Bindings], context: &StaticContext) -> Result<String> {
        let mut out = String::new();
        let mut scope = Scope {
            rows,
            context,
            locals: Vec::new(),
        };
        render_nodes(&self.nodes, &mut scope, &mut out)?;
        Ok(out)
    }
}

fn lex(text: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = text;
    let mut line = 1;
    loop {
        let interp = rest.find("{{");
        let tag = rest.find("{%");
        let (start, closer, is_tag) = match (interp, tag) {
            (Some(i), Some(t)) if t < i => (t, "%}", true),
            (Some(i), _) => (i, "}}", false),
            (None, Some(t)) => (t, "%}", true),
            (None, None) => {
                if !rest.is_empty() {
                    segments.push(Segment::Text(rest.to_string()));
                }
                return Ok(segments);
            }
        };
        if start > 0 {
            let leading = &rest[..start];
            line += leading.matches('\n').count();
            segments.push(Segment::Text(leading.to_string()));
        }
        let open_line = line;
        let after = &rest[start + 2..];
        let Some(end) = after.find(closer) else {
            return Err(SyncError::TemplateParse {
                line: open_line,
                message: format!(
                    "unclosed '{}'",
                    if is_tag { "{%" } else { "{{" }
                ),
            });
        };
        let content = after[..end].trim().to_string();
        line += after[..end].matches('\n').count();
        if is_tag {
            segments.push(Segment::Tag {
                content,
                line: open_line,
            });
        } else {
            segments.push(Segment::Interp {
                content,
                line: open_line,
            });
        }
        rest = &after[end + 2..];
    }
}

struct BlockParser {
    segments: Vec<Segment>,
    pos: usize,
}

impl BlockParser {
    /// Parse nodes until one of `terminators` (a tag keyword) is reached.
    /// The terminating tag is left for the caller to consume via `take_tag`.
    fn block(&mut self, terminators: &[&str]) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        while self.pos < self.segments.len() {
            match &self.segments[self.pos] {
                Segment::Text(text) => {
                    nodes.push(Node::Text(text.clone()));
                    self.pos += 1;
                }
                Segment::Interp { content, line } => {
                    let expr = parse_expr(content, *line)?;
                    nodes.push(Node::Interp(expr));
                    self.pos += 1;
                }
                Segment::Tag { content, line } => {
                    let line = *line;
                    let content = content.clone();
                    let keyword = content
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    if terminators.contains(&keyword.as_str()) {
                        return Ok(nodes);
                    }
                    self.pos += 1;
                    match keyword.as_str() {
                        "for" => nodes.push(self.for_block(&content, line)?),
                        "if" => nodes.push(self.if_block(&content, line)?),
                        other => {
                            return Err(SyncError::TemplateParse {
                                line,
                                message: format!("unknown tag '{other}'"),
                            })
                        }
                    }
                }
            }
        }
        if terminators.is_empty() {
            Ok(nodes)
        } else {
            Err(SyncError::TemplateParse {
                line: 0,
                message: format!("missing closing tag (expected one of {terminators:?})"),
            })
        }
    }

    fn take_tag(&mut self) -> Option<(String, usize)> {
        if let Some(Segment::Tag { content, line }) = self.segments.get(self.pos) {
            let result = (content.clone(), *line);
            self.pos += 1;
            Some(result)
        } else {
            None
        }
    }

    fn for_block(&mut self, content: &str, line: usize) -> Result<Node> {
        // for <var> in <expr>
        let rest = content.strip_prefix("for").unwrap_or_default().trim();
        let Some((var, source)) = rest.split_once(" in ") else {
            return Err(SyncError::TemplateParse {
                line,
                message: "malformed for tag: expected 'for <var> in <expr>'".to_string(),
            });
        };
        let var = var.trim();
        if var.is_empty() || !var.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(SyncError::TemplateParse {
                line,
                message: format!("invalid loop variable '{var}'"),
            });
        }
        let source = parse_expr(source.trim(), line)?;
        let body = self.block(&["endfor"])?;
        match self.take_tag() {
            Some((tag, _)) if tag == "endfor" => {}
            _ => {
                return Err(SyncError::TemplateParse {
                    line,
                    message: "for tag without matching endfor".to_string(),
                })
            }
        }
        Ok(Node::For {
            var: var.to_string(),
            source,
            body,
        })
    }

    fn if_block(&mut self, content: &str, line: usize) -> Result<Node> {
        let cond_text = content.strip_prefix("if").unwrap_or_default().trim();
        if cond_text.is_empty() {
            return Err(SyncError::TemplateParse {
                line,
                message: "if tag without condition".to_string(),
            });
        }
        let cond = parse_expr(cond_text, line)?;
        let then_body = self.block(&["else", "endif"])?;
        let else_body = match self.take_tag() {
            Some((tag, _)) if tag == "else" => {
                let body = self.block(&["endif"])?;
                match self.take_tag() {
                    Some((tag, _)) if tag == "endif" => body,
                    _ => {
                        return Err(SyncError::TemplateParse {
                            line,
                            message: "else without matching endif".to_string(),
                        })
                    }
                }
            }
            Some((tag, _)) if tag == "endif" => Vec::new(),
            _ => {
                return Err(SyncError::TemplateParse {
                    line,
                    message: "if tag without matching endif".to_string(),
                })
            }
        };
        Ok(Node::If {
            cond,
            then_body,
            else_body,
        })
    }
}

fn parse_expr(text: &str, line: usize) -> Result<Expr> {
    let mut parts = text.split('|');
    let path_text = parts.next().unwrap_or_default().trim();
    if path_text.is_empty() {
        return Err(SyncError::TemplateParse {
            line,
            message: "empty expression".to_string(),
        });
    }
    let path: Vec<String> = path_text.split('.').map(|s| s.trim().to_string()).collect();
    for segment in &path {
        if segment.is_empty()
            || !segment.chars().all(|c| c.is_alphanumeric() || c == '_')
        {
            return Err(SyncError::TemplateParse {
                line,
                message: format!("invalid variable reference '{path_text}'"),
            });
        }
    }
    let mut filters = Vec::new();
    for filter_text in parts {
        filters.push(parse_filter(filter_text.trim(), line)?);
    }
    Ok(Expr {
        path,
        filters,
        line,
    })
}

fn parse_filter(text: &str, line: usize) -> Result<FilterCall> {
    let (name, args_text) = match text.find('(') {
        Some(open) => {
            if !text.ends_with(')') {
                return Err(SyncError::TemplateParse {
                    line,
                    message: format!("malformed filter call '{text}'"),
                });
            }
            (&text[..open], Some(&text[open + 1..text.len() - 1]))
        }
        None => (text, None),
    };
    let name = name.trim();
    if !KNOWN_FILTERS.contains(&name) {
        return Err(SyncError::TemplateParse {
            line,
            message: format!(
                "unknown filter '{name}' (available: {})",
                KNOWN_FILTERS.join(", ")
            ),
        });
    }
    let mut args = BTreeMap::new();
    if let Some(args_text) = args_text {
        for pair in split_args(args_text) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(SyncError::TemplateParse {
                    line,
                    message: format!("malformed filter argument '{pair}': expected key=\"value\""),
                });
            };
            let value = value.trim();
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(|| SyncError::TemplateParse {
                    line,
                    message: format!("filter argument '{key}' must be a quoted string"),
                })?;
            args.insert(key.trim().to_string(), unquoted.to_string());
        }
    }
    Ok(FilterCall {
        name: name.to_string(),
        args,
        line,
    })
}

/// Split filter arguments on commas that are outside quoted strings.
fn split_args(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

const KNOWN_FILTERS: &[&str] = &[
    "upper", "lower", "trim", "replace", "default", "length", "unique", "sort",
];

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

struct Scope<'a> {
    rows: &'a [Bindings],
    context: &'a StaticContext,
    locals: Vec<(String, TValue)>,
}

impl Scope<'_> {
    fn lookup(&self, name: &str) -> TValue {
        for (local, value) in self.locals.iter().rev() {
            if local == name {
                return value.clone();
            }
        }
        if name == "rows" {
            return TValue::Rows(self.rows.to_vec());
        }
        if let Some(value) = self.context.get(name) {
            return TValue::Str(value.clone());
        }
        TValue::Undefined
    }
}

fn render_nodes(nodes: &[Node], scope: &mut Scope<'_>, out: &mut String) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Interp(expr) => {
                let value = eval_expr(expr, scope, false)?;
                match value {
                    TValue::Str(s) => out.push_str(&s),
                    TValue::Unbound => {
                        return Err(SyncError::UnboundVariable {
                            variable: expr.display_path(),
                            line: expr.line,
                        })
                    }
                    TValue::Undefined => {
                        return Err(SyncError::UndefinedVariable {
                            variable: expr.display_path(),
                            line: expr.line,
                        })
                    }
                    other => {
                        return Err(SyncError::Render {
                            line: expr.line,
                            message: format!(
                                "cannot interpolate a {} ('{}')",
                                other.type_name(),
                                expr.display_path()
                            ),
                        })
                    }
                }
            }
            Node::For { var, source, body } => {
                let value = eval_expr(source, scope, false)?;
                let rows = match value {
                    TValue::Rows(rows) => rows,
                    TValue::Undefined => {
                        return Err(SyncError::UndefinedVariable {
                            variable: source.display_path(),
                            line: source.line,
                        })
                    }
                    other => {
                        return Err(SyncError::Render {
                            line: source.line,
                            message: format!(
                                "for loop source must be a row list, found {}",
                                other.type_name()
                            ),
                        })
                    }
                };
                for row in rows {
                    scope.locals.push((var.clone(), TValue::Row(row)));
                    let result = render_nodes(body, scope, out);
                    scope.locals.pop();
                    result?;
                }
            }
            Node::If {
                cond,
                then_body,
                else_body,
            } => {
                // Condition position is the one place unbound/undefined is
                // allowed: it evaluates false so templates can branch on
                // optional query results.
                let truthy = eval_expr(cond, scope, true)?.truthy();
                if truthy {
                    render_nodes(then_body, scope, out)?;
                } else {
                    render_nodes(else_body, scope, out)?;
                }
            }
        }
    }
    Ok(())
}

fn eval_expr(expr: &Expr, scope: &Scope<'_>, lenient: bool) -> Result<TValue> {
    let mut value = scope.lookup(&expr.path[0]);
    for segment in &expr.path[1..] {
        value = match value {
            TValue::Row(row) => match row.get(segment) {
                Some(Value::Bound(term)) => TValue::Str(term.lexical().to_string()),
                Some(Value::Unbound) => TValue::Unbound,
                None => TValue::Undefined,
            },
            TValue::Undefined => TValue::Undefined,
            other => {
                return Err(SyncError::Render {
                    line: expr.line,
                    message: format!(
                        "cannot access field '{segment}' of a {} ('{}')",
                        other.type_name(),
                        expr.display_path()
                    ),
                })
            }
        };
    }
    for filter in &expr.filters {
        value = apply_filter(filter, value, &expr.path, lenient)?;
    }
    Ok(value)
}

fn apply_filter(
    filter: &FilterCall,
    value: TValue,
    path: &[String],
    lenient: bool,
) -> Result<TValue> {
    // default() recovers missing values; every other filter requires a
    // concrete input.
    if filter.name == "default" {
        let fallback = require_arg(filter, "value")?;
        return Ok(match value {
            TValue::Unbound | TValue::Undefined => TValue::Str(fallback.to_string()),
            other => other,
        });
    }
    match &value {
        TValue::Unbound => {
            if lenient {
                return Ok(TValue::Unbound);
            }
            return Err(SyncError::UnboundVariable {
                variable: path.join("."),
                line: filter.line,
            });
        }
        TValue::Undefined => {
            if lenient {
                return Ok(TValue::Undefined);
            }
            return Err(SyncError::UndefinedVariable {
                variable: path.join("."),
                line: filter.line,
            });
        }
        _ => {}
    }

    match filter.name.as_str() {
        "upper" => string_filter(filter, value, |s| s.to_uppercase()),
        "lower" => string_filter(filter, value, |s| s.to_lowercase()),
        "trim" => string_filter(filter, value, |s| s.trim().to_string()),
        "replace" => {
            let from = require_arg(filter, "from")?.to_string();
            let to = filter.args.get("to").cloned().unwrap_or_default();
            string_filter(filter, value, |s| s.replace(&from, &to))
        }
        "length" => match value {
            TValue::Rows(rows) => Ok(TValue::Str(rows.len().to_string())),
            TValue::Str(s) => Ok(TValue::Str(s.chars().count().to_string())),
            other => Err(filter_type_error(filter, &other)),
        },
        "unique" => {
            let attribute = require_arg(filter, "attribute")?.to_string();
            let rows = require_rows(filter, value)?;
            let mut seen = Vec::new();
            let mut result = Vec::new();
            for row in rows {
                let key = row.get(&attribute).cloned();
                if !seen.contains(&key) {
                    seen.push(key);
                    result.push(row);
                }
            }
            Ok(TValue::Rows(result))
        }
        "sort" => {
            let attribute = require_arg(filter, "attribute")?.to_string();
            let mut rows = require_rows(filter, value)?;
            rows.sort_by(|a, b| a.get(&attribute).cmp(&b.get(&attribute)));
            Ok(TValue::Rows(rows))
        }
        other => Err(SyncError::Filter {
            filter: other.to_string(),
            line: filter.line,
            message: "unknown filter".to_string(),
        }),
    }
}

fn string_filter(
    filter: &FilterCall,
    value: TValue,
    f: impl Fn(&str) -> String,
) -> Result<TValue> {
    match value {
        TValue::Str(s) => Ok(TValue::Str(f(&s))),
        other => Err(filter_type_error(filter, &other)),
    }
}

fn require_rows(filter: &FilterCall, value: TValue) -> Result<Vec<Bindings>> {
    match value {
        TValue::Rows(rows) => Ok(rows),
        other => Err(filter_type_error(filter, &other)),
    }
}

fn require_arg<'a>(filter: &'a FilterCall, key: &str) -> Result<&'a str> {
    filter
        .args
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| SyncError::Filter {
            filter: filter.name.clone(),
            line: filter.line,
            message: format!("missing required argument '{key}'"),
        })
}

fn filter_type_error(filter: &FilterCall, value: &TValue) -> SyncError {
    SyncError::Filter {
        filter: filter.name.clone(),
        line: filter.line,
        message: format!("cannot apply to a {}", value.type_name()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
