//! Store-side schema: vector indexes and uniqueness constraints.
//!
//! The core assumes id uniqueness per node kind and fixed-dimension
//! cosine-normalized embeddings; `ensure_schema` makes both true instead of
//! trusting ingestion.

use crate::query::CypherQuery;

/// Embedding dimensionality for every vector index.
pub const EMBEDDING_DIM: usize = 1536;

/// Node kinds carrying a unique `id`.
pub const NODE_KINDS: [&str; 7] = [
    "Person",
    "Organization",
    "Project",
    "Document",
    "Deal",
    "CreativeConcept",
    "Memory",
];

/// A named ANN index over one embedding property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorIndexSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub property: &'static str,
    pub dimensions: usize,
}

/// The indexes the core relies on; all cosine, all d=1536. The first three
/// carry the memory and person-bio contracts; the rest back the per-kind
/// fan-out of the universal search tool.
pub const VECTOR_INDEXES: [VectorIndexSpec; 6] = [
    VectorIndexSpec {
        name: "person_bio_vector",
        label: "Person",
        property: "bioEmbedding",
        dimensions: EMBEDDING_DIM,
    },
    VectorIndexSpec {
        name: "memory_content_vector",
        label: "Memory",
        property: "embedding",
        dimensions: EMBEDDING_DIM,
    },
    VectorIndexSpec {
        name: "memory_summary_vector",
        label: "Memory",
        property: "summaryEmbedding",
        dimensions: EMBEDDING_DIM,
    },
    VectorIndexSpec {
        name: "organization_profile_vector",
        label: "Organization",
        property: "profileEmbedding",
        dimensions: EMBEDDING_DIM,
    },
    VectorIndexSpec {
        name: "project_profile_vector",
        label: "Project",
        property: "profileEmbedding",
        dimensions: EMBEDDING_DIM,
    },
    VectorIndexSpec {
        name: "document_content_vector",
        label: "Document",
        property: "contentEmbedding",
        dimensions: EMBEDDING_DIM,
    },
];

/// Full-text index backing document search.
pub const DOCUMENT_FULLTEXT_INDEX: &str = "document_text";

/// Look up an index by name.
pub fn vector_index(name: &str) -> Option<&'static VectorIndexSpec> {
    VECTOR_INDEXES.iter().find(|spec| spec.name == name)
}

/// Idempotent statements creating constraints and indexes. Identifier parts
/// come from the static tables above, never from input.
pub fn schema_statements() -> Vec<CypherQuery> {
    let mut statements = Vec::new();

    for kind in NODE_KINDS {
        statements.push(
            CypherQuery::write(format!(
                "CREATE CONSTRAINT {}_id_unique IF NOT EXISTS \
                 FOR (n:{kind}) REQUIRE n.id IS UNIQUE",
                kind.to_lowercase()
            ))
            .idempotent(),
        );
    }

    for spec in VECTOR_INDEXES {
        statements.push(
            CypherQuery::write(format!(
                "CREATE VECTOR INDEX {} IF NOT EXISTS \
                 FOR (n:{}) ON n.{} \
                 OPTIONS {{ indexConfig: {{ \
                   `vector.dimensions`: {}, \
                   `vector.similarity_function`: 'cosine' \
                 }} }}",
                spec.name, spec.label, spec.property, spec.dimensions
            ))
            .idempotent(),
        );
    }

    statements.push(
        CypherQuery::write(format!(
            "CREATE FULLTEXT INDEX {DOCUMENT_FULLTEXT_INDEX} IF NOT EXISTS \
             FOR (d:Document) ON EACH [d.title, d.content]"
        ))
        .idempotent(),
    );

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_indexes_are_registered_and_sized() {
        for spec in VECTOR_INDEXES {
            assert_eq!(spec.dimensions, EMBEDDING_DIM);
            assert_eq!(vector_index(spec.name), Some(&spec));
        }
        assert!(vector_index("unknown_index").is_none());
    }

    #[test]
    fn schema_statements_are_idempotent() {
        let statements = schema_statements();
        assert_eq!(statements.len(), NODE_KINDS.len() + VECTOR_INDEXES.len() + 1);
        for statement in &statements {
            assert!(statement.text().contains("IF NOT EXISTS"));
            assert!(statement.is_idempotent());
        }
    }

    #[test]
    fn constraint_statements_cover_every_kind() {
        let statements = schema_statements();
        for kind in NODE_KINDS {
            assert!(
                statements
                    .iter()
                    .any(|s| s.text().contains(&format!("(n:{kind})"))),
                "missing constraint for {kind}"
            );
        }
    }

    #[test]
    fn vector_index_statements_use_cosine() {
        for statement in schema_statements() {
            if statement.text().contains("VECTOR INDEX") {
                assert!(statement.text().contains("'cosine'"));
                assert!(statement.text().contains("1536"));
            }
        }
    }
}
