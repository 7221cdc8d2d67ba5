use crate::error::EngineError;
use crate::parsed_query::{
    ParsedQuery, Projection, R2SClause, StreamOperator, WindowBlock, WindowDefinition,
};
use regex::Regex;
use std::fmt::Write as _;
use std::sync::LazyLock;

static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bPREFIX\s+([A-Za-z0-9_\-]*):\s*<([^>]*)>").expect("valid prefix regex")
});

static REGISTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bREGISTER\s+(RStream|IStream|DStream)\s+(<[^>]*>|[A-Za-z0-9_\-]*:\S*)\s+AS\b")
        .expect("valid register regex")
});

static WINDOW_DEF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bFROM\s+NAMED\s+WINDOW\s+(<[^>]*>|\S+)\s+ON\s+STREAM\s+(<[^>]*>|[^\s\[]+)\s*\[\s*RANGE\s+(\d+)\s+STEP\s+(\d+)\s*\]",
    )
    .expect("valid window definition regex")
});

static SELECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bSELECT\s+(.*?)\s*(?:\bFROM\b|\bWHERE\b|\{)").expect("valid select regex")
});

static AGGREGATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\(\s*([A-Za-z_]+)\s*\(\s*(?:DISTINCT\s+)?\?([A-Za-z0-9_]+)\s*\)\s+AS\s+\?([A-Za-z0-9_]+)\s*\)",
    )
    .expect("valid aggregate regex")
});

static VARIABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?([A-Za-z0-9_]+)").expect("valid variable regex"));

static WHERE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\s*\{").expect("valid where regex"));

static UNION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bUNION\b").expect("valid union regex"));

static GROUP_BY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bGROUP\s+BY\b").expect("valid group by regex"));

static WINDOW_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bWINDOW\s+(<[^>]*>|[^\s\{]+)\s*\{").expect("valid window block regex")
});

/// Parser for the subset of RSP-QL used by the accelerometer experiments.
///
/// It extracts the stream-to-relation bindings and the parts of the
/// projection and WHERE clause needed to split a multi-window query, and
/// renders a plain SPARQL query in which every `WINDOW` becomes a `GRAPH`.
pub struct RSPQLParser {
    query: String,
}

impl RSPQLParser {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }

    pub fn parse(&self) -> Result<ParsedQuery, EngineError> {
        let query = self.query.as_str();

        let prefixes: Vec<(String, String)> = PREFIX_RE
            .captures_iter(query)
            .map(|c| (c[1].to_string(), c[2].to_string()))
            .collect();

        let r2s = match REGISTER_RE.captures(query) {
            Some(c) => R2SClause {
                operator: StreamOperator::parse(&c[1]).unwrap_or_default(),
                name: expand(&c[2], &prefixes).unwrap_or_else(|_| c[2].to_string()),
            },
            None => R2SClause::default(),
        };

        let mut s2r = Vec::new();
        for c in WINDOW_DEF_RE.captures_iter(query) {
            let width = parse_millis(&c[3], "RANGE")?;
            let slide = parse_millis(&c[4], "STEP")?;
            s2r.push(WindowDefinition {
                window_name: expand(&c[1], &prefixes)?,
                stream_name: expand(&c[2], &prefixes)?,
                width,
                slide,
            });
        }

        let select = SELECT_RE
            .captures(query)
            .ok_or_else(|| EngineError::InvalidQuerySyntax("missing SELECT clause".into()))?;
        let projections = parse_projections(select.get(1).map_or("", |m| m.as_str()));

        let where_match = WHERE_RE
            .find(query)
            .ok_or_else(|| EngineError::InvalidQuerySyntax("missing WHERE clause".into()))?;
        let where_open = where_match.end() - 1;
        let where_close = matching_brace(query, where_open).ok_or_else(|| {
            EngineError::InvalidQuerySyntax("unbalanced braces in WHERE clause".into())
        })?;
        let where_clause = &query[where_open..=where_close];

        let mut window_blocks = Vec::new();
        for m in WINDOW_BLOCK_RE.captures_iter(where_clause) {
            let whole = m.get(0).map_or(0..0, |g| g.range());
            let open = whole.end - 1;
            let close = matching_brace(where_clause, open).ok_or_else(|| {
                EngineError::InvalidQuerySyntax(format!("unbalanced braces in WINDOW {}", &m[1]))
            })?;
            window_blocks.push(WindowBlock {
                window_name: expand(&m[1], &prefixes)?,
                body: where_clause[open + 1..close].to_string(),
            });
        }

        let mut parsed = ParsedQuery {
            prefixes,
            r2s,
            s2r,
            projections,
            window_blocks,
            sparql_query: String::new(),
        };
        parsed.sparql_query = if UNION_RE.is_match(where_clause) && !GROUP_BY_RE.is_match(query) {
            render_branch_aggregates(&parsed).unwrap_or_else(|| render_sparql(query, &parsed.prefixes))
        } else {
            render_sparql(query, &parsed.prefixes)
        };
        Ok(parsed)
    }
}

/// Expand `<iri>` or `prefix:local` to a full IRI.
pub fn expand(token: &str, prefixes: &[(String, String)]) -> Result<String, EngineError> {
    let token = token.trim();
    if let Some(inner) = token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        return Ok(inner.to_string());
    }
    let (prefix, local) = token
        .split_once(':')
        .ok_or_else(|| EngineError::InvalidQuerySyntax(format!("cannot resolve name {token}")))?;
    prefixes
        .iter()
        .rev()
        .find(|(p, _)| p == prefix)
        .map(|(_, iri)| format!("{iri}{local}"))
        .ok_or_else(|| EngineError::InvalidQuerySyntax(format!("unknown prefix {prefix}:")))
}

fn parse_millis(raw: &str, what: &str) -> Result<i64, EngineError> {
    let value: i64 = raw
        .parse()
        .map_err(|_| EngineError::InvalidQuerySyntax(format!("{what} {raw} is not a number")))?;
    if value <= 0 {
        return Err(EngineError::InvalidQuerySyntax(format!(
            "{what} must be positive, got {value}"
        )));
    }
    Ok(value)
}

fn parse_projections(select: &str) -> Vec<Projection> {
    let mut found: Vec<(usize, Projection)> = Vec::new();
    let mut masked = select.to_string();

    for c in AGGREGATE_RE.captures_iter(select) {
        let Some(whole) = c.get(0) else { continue };
        found.push((
            whole.start(),
            Projection::Aggregate {
                function: c[1].to_ascii_uppercase(),
                inner: c[2].to_string(),
                alias: c[3].to_string(),
                text: whole.as_str().to_string(),
            },
        ));
        masked.replace_range(whole.range(), &" ".repeat(whole.len()));
    }

    for c in VARIABLE_RE.captures_iter(&masked) {
        if let Some(whole) = c.get(0) {
            found.push((whole.start(), Projection::Variable(c[1].to_string())));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, p)| p).collect()
}

fn matching_brace(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_iri = false;
    for (i, ch) in text[open..].char_indices() {
        match ch {
            '<' if !in_iri => in_iri = true,
            '>' if in_iri => in_iri = false,
            // `<` is also a comparison operator; a space or newline ends it
            ' ' | '\n' | '\t' if in_iri => in_iri = false,
            '{' if !in_iri => depth += 1,
            '}' if !in_iri => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn render_sparql(query: &str, prefixes: &[(String, String)]) -> String {
    let without_register = REGISTER_RE.replace_all(query, "");
    let without_windows = WINDOW_DEF_RE.replace_all(&without_register, "");
    WINDOW_BLOCK_RE
        .replace_all(&without_windows, |c: &regex::Captures<'_>| match expand(&c[1], prefixes) {
            Ok(iri) => format!("GRAPH <{iri}> {{"),
            Err(_) => format!("GRAPH {} {{", &c[1]),
        })
        .trim()
        .to_string()
}

/// Rendering for a UNION of window branches where every projection
/// aggregates a variable bound in exactly one branch.
///
/// Each branch binds only its own variables, so aggregating over the union
/// would mix in unbound rows. Every branch is aggregated in its own
/// sub-select instead, and a branch without solutions leaves its
/// aggregates unbound. Returns `None` for any other query shape.
fn render_branch_aggregates(parsed: &ParsedQuery) -> Option<String> {
    if parsed.window_blocks.len() < 2
        || parsed.projections.is_empty()
        || !parsed
            .projections
            .iter()
            .all(|p| matches!(p, Projection::Aggregate { .. }))
    {
        return None;
    }
    let per_block: Vec<Vec<&Projection>> = parsed
        .window_blocks
        .iter()
        .map(|block| parsed.projections_in(block))
        .collect();
    let covered = parsed.projections.iter().all(|p| {
        per_block
            .iter()
            .filter(|selected| selected.contains(&p))
            .count()
            == 1
    });
    if !covered {
        return None;
    }

    let mut out = String::new();
    for (prefix, iri) in &parsed.prefixes {
        let _ = writeln!(out, "PREFIX {prefix}: <{iri}>");
    }
    let aliases: Vec<String> = parsed
        .projections
        .iter()
        .filter_map(|p| match p {
            Projection::Aggregate { alias, .. } => Some(format!("?{alias}")),
            Projection::Variable(_) => None,
        })
        .collect();
    let _ = writeln!(out, "SELECT {}", aliases.join(" "));
    let _ = writeln!(out, "WHERE {{");
    for (block, selected) in parsed.window_blocks.iter().zip(&per_block) {
        if selected.is_empty() {
            continue;
        }
        let select: Vec<String> = selected.iter().map(|p| p.text()).collect();
        let _ = writeln!(out, "    OPTIONAL {{");
        let _ = writeln!(out, "        SELECT {}", select.join(" "));
        let _ = writeln!(out, "        WHERE {{ GRAPH <{}> {{", block.window_name);
        for line in block.body.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let _ = writeln!(out, "            {line}");
        }
        let _ = writeln!(out, "        }} }}");
        let _ = writeln!(out, "        HAVING (COUNT(*) > 0)");
        let _ = writeln!(out, "    }}");
    }
    out.push('}');
    Some(out)
}
