use std::fmt;

/// The relation-to-stream operator named in the `REGISTER` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamOperator {
    #[default]
    RStream,
    IStream,
    DStream,
}

impl StreamOperator {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "rstream" => Some(Self::RStream),
            "istream" => Some(Self::IStream),
            "dstream" => Some(Self::DStream),
            _ => None,
        }
    }
}

impl fmt::Display for StreamOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RStream => "RStream",
            Self::IStream => "IStream",
            Self::DStream => "DStream",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct R2SClause {
    pub operator: StreamOperator,
    pub name: String,
}

/// A `FROM NAMED WINDOW ... ON STREAM ... [RANGE .. STEP ..]` binding.
///
/// `width` is the window range and `slide` the step, both in milliseconds.
/// `slide <= width` is expected but not enforced here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowDefinition {
    pub window_name: String,
    pub stream_name: String,
    pub width: i64,
    pub slide: i64,
}

/// One projected expression of the SELECT clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// `(FN(?inner) AS ?alias)`
    Aggregate {
        function: String,
        inner: String,
        alias: String,
        text: String,
    },
    /// A bare `?var`
    Variable(String),
}

impl Projection {
    /// The variable the projection reads from the WHERE clause.
    pub fn source_variable(&self) -> &str {
        match self {
            Projection::Aggregate { inner, .. } => inner,
            Projection::Variable(v) => v,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Projection::Aggregate { text, .. } => text.clone(),
            Projection::Variable(v) => format!("?{v}"),
        }
    }
}

/// Body of a `WINDOW <w> { ... }` block, braces excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBlock {
    pub window_name: String,
    pub body: String,
}

impl WindowBlock {
    /// Whether `?variable` occurs in the block as a whole variable name.
    pub fn mentions(&self, variable: &str) -> bool {
        let needle = format!("?{variable}");
        self.body.match_indices(&needle).any(|(at, _)| {
            !self.body[at + needle.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_')
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedQuery {
    pub prefixes: Vec<(String, String)>,
    pub r2s: R2SClause,
    pub s2r: Vec<WindowDefinition>,
    pub projections: Vec<Projection>,
    pub window_blocks: Vec<WindowBlock>,
    pub sparql_query: String,
}

impl ParsedQuery {
    pub fn window(&self, window_name: &str) -> Option<&WindowDefinition> {
        self.s2r.iter().find(|w| w.window_name == window_name)
    }

    pub fn block(&self, window_name: &str) -> Option<&WindowBlock> {
        self.window_blocks
            .iter()
            .find(|b| b.window_name == window_name)
    }

    /// Projections whose input variable occurs in `block`, in SELECT order.
    pub fn projections_in(&self, block: &WindowBlock) -> Vec<&Projection> {
        self.projections
            .iter()
            .filter(|p| block.mentions(p.source_variable()))
            .collect()
    }
}
