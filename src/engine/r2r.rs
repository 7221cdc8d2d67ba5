use super::Binding;
use crate::error::EngineError;
use crate::quad_container::QuadContainer;
use oxigraph::model::Term;
use oxigraph::sparql::{QueryResults, SparqlEvaluator};
use oxigraph::store::Store;
use tracing::trace;

/// R2R (Relation-to-Relation) Operator
/// Executes the SPARQL rendering of a query over the content of a window
#[derive(Clone)]
pub struct R2ROperator {
    query: String,
}

impl R2ROperator {
    pub fn new(query: String) -> Self {
        Self { query }
    }

    /// Check that the query is valid SPARQL without evaluating it.
    pub fn validate(&self) -> Result<(), EngineError> {
        SparqlEvaluator::new()
            .parse_query(&self.query)
            .map(|_| ())
            .map_err(|e| EngineError::InvalidQuerySyntax(e.to_string()))
    }

    /// Evaluate over the container and flatten every solution into bindings.
    pub fn execute(&self, container: &QuadContainer) -> Result<Vec<Binding>, EngineError> {
        let store = Store::new().map_err(|e| EngineError::Storage(e.to_string()))?;
        for quad in &container.elements {
            store
                .insert(quad)
                .map_err(|e| EngineError::Storage(e.to_string()))?;
        }

        trace!(quads = container.len(), "evaluating R2R query");

        let results = SparqlEvaluator::new()
            .parse_query(&self.query)
            .map_err(|e| EngineError::InvalidQuerySyntax(e.to_string()))?
            .on_store(&store)
            .execute()
            .map_err(|e| EngineError::Evaluation(e.to_string()))?;

        let mut bindings = Vec::new();
        if let QueryResults::Solutions(solutions) = results {
            for solution in solutions {
                let solution = solution.map_err(|e| EngineError::Evaluation(e.to_string()))?;
                for (variable, term) in solution.iter() {
                    bindings.push(Binding::new(variable.as_str(), lexical_form(term)));
                }
            }
        }
        Ok(bindings)
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

fn lexical_form(term: &Term) -> String {
    match term {
        Term::Literal(literal) => literal.value().to_string(),
        Term::NamedNode(node) => node.as_str().to_string(),
        other => other.to_string(),
    }
}
