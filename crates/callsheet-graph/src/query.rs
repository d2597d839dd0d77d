//! Parameterized Cypher queries.
//!
//! Values only ever travel as bound parameters; the query text is a static
//! template owned by the caller. That rules out injection and lets the
//! idempotence flag be trusted by retry logic.

use neo4rs::Query;

/// A bindable parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    StringList(Vec<String>),
    /// Embedding vectors.
    FloatList(Vec<f32>),
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::String(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::StringList(v)
    }
}

impl From<Vec<f32>> for ParamValue {
    fn from(v: Vec<f32>) -> Self {
        ParamValue::FloatList(v)
    }
}

/// A Cypher statement plus its bound parameters and declared result columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CypherQuery {
    text: String,
    params: Vec<(String, ParamValue)>,
    returns: Vec<String>,
    idempotent: bool,
    uses_vector_index: bool,
}

impl CypherQuery {
    /// A read-only query; eligible for retry.
    pub fn read(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
            returns: Vec::new(),
            idempotent: true,
            uses_vector_index: false,
        }
    }

    /// A query with observable side effects; never retried unless the
    /// caller re-marks it idempotent.
    pub fn write(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
            returns: Vec::new(),
            idempotent: false,
            uses_vector_index: false,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Declare the RETURN columns to materialize, in order.
    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Writes that are safe to re-run (e.g. MERGE keyed on a unique id) can
    /// opt back into retries.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Marks the query as hitting a vector index, which widens its timeout.
    pub fn with_vector_timeout(mut self) -> Self {
        self.uses_vector_index = true;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn is_vector(&self) -> bool {
        self.uses_vector_index
    }

    pub fn return_columns(&self) -> &[String] {
        &self.returns
    }

    pub fn params(&self) -> &[(String, ParamValue)] {
        &self.params
    }

    /// Lower into the driver's query type.
    pub(crate) fn to_neo4rs(&self) -> Query {
        let mut query = Query::new(self.text.clone());
        for (name, value) in &self.params {
            query = match value {
                ParamValue::String(v) => query.param(name, v.as_str()),
                ParamValue::Int(v) => query.param(name, *v),
                ParamValue::Float(v) => query.param(name, *v),
                ParamValue::Bool(v) => query.param(name, *v),
                ParamValue::StringList(v) => query.param(name, v.clone()),
                ParamValue::FloatList(v) => query.param(name, v.clone()),
            };
        }
        query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_queries_are_idempotent_by_default() {
        let q = CypherQuery::read("MATCH (p:Person {id: $id}) RETURN p.name AS name")
            .param("id", "p1")
            .returning(["name"]);
        assert!(q.is_idempotent());
        assert!(!q.is_vector());
        assert_eq!(q.return_columns(), ["name"]);
    }

    #[test]
    fn writes_opt_out_of_retry() {
        let q = CypherQuery::write("CREATE (m:Memory {id: $id})").param("id", "m1");
        assert!(!q.is_idempotent());

        let merged = CypherQuery::write("MERGE (m:Memory {id: $id})")
            .param("id", "m1")
            .idempotent();
        assert!(merged.is_idempotent());
    }

    #[test]
    fn params_bind_not_splice() {
        let q = CypherQuery::read("MATCH (p:Person) WHERE p.name = $name RETURN p.id AS id")
            .param("name", "Robert'); DETACH DELETE n; --");
        // the hostile value never reaches the statement text
        assert!(!q.text().contains("DETACH DELETE"));
        assert_eq!(q.params().len(), 1);
    }

    #[test]
    fn param_conversions() {
        let q = CypherQuery::read("RETURN 1")
            .param("s", "x")
            .param("i", 42i64)
            .param("f", 0.5f64)
            .param("b", true)
            .param("ids", vec!["a".to_string()])
            .param("vec", vec![0.1f32, 0.2]);
        assert_eq!(q.params().len(), 6);
        assert_eq!(q.params()[5].1, ParamValue::FloatList(vec![0.1, 0.2]));
    }
}
