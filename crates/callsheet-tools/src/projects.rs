//! Project lookup and discovery tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use callsheet_core::error::Result;
use callsheet_core::message::ToolResult;
use callsheet_core::principal::{Principal, Role};
use callsheet_core::rbac::{SensitivityPolicy, ToolPolicy};
use callsheet_graph::{CypherQuery, GraphStore};

use crate::args::{name_or_id, name_or_id_schema, optional_str, required_str, Lookup};
use crate::GraphTool;

fn project_sensitivity() -> SensitivityPolicy {
    SensitivityPolicy::new().field("budget", 4)
}

/// `get_project_details` - crew list, client, type, and (redactable) budget.
pub struct GetProjectDetails {
    graph: Arc<dyn GraphStore>,
    policy: ToolPolicy,
}

impl GetProjectDetails {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            policy: ToolPolicy::open("read:projects").with_sensitivity(project_sensitivity()),
        }
    }
}

#[async_trait]
impl GraphTool for GetProjectDetails {
    fn name(&self) -> &'static str {
        "get_project_details"
    }

    fn description(&self) -> &'static str {
        "Look up a project by title or id: client, type, year, budget, and full crew list with roles."
    }

    fn parameters(&self) -> Value {
        name_or_id_schema("project")
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, _principal: &Principal) -> Result<ToolResult> {
        let (filter, key, value) = match name_or_id(arguments)? {
            Lookup::Id(id) => ("proj.id = $id", "id", id),
            Lookup::Name(name) => ("toLower(proj.title) = toLower($name)", "name", name),
        };

        let query = CypherQuery::read(format!(
            "MATCH (proj:Project) WHERE {filter} \
             OPTIONAL MATCH (crew:Person)-[w:WORKED_ON]->(proj) \
             OPTIONAL MATCH (proj)-[:FOR_CLIENT]->(client:Organization) \
             OPTIONAL MATCH (director:Person)-[:DIRECTED]->(proj) \
             RETURN proj {{.id, .title, .type, .year, .status, .budget, .description}} AS project, \
                    collect(DISTINCT crew {{.id, .name, role: w.role}}) AS crew, \
                    head(collect(DISTINCT client.name)) AS client, \
                    head(collect(DISTINCT director.name)) AS director"
        ))
        .param(key, value)
        .returning(["project", "crew", "client", "director"]);

        let mut rows = self.graph.run(query).await?;
        let Some(mut row) = rows.pop() else {
            return Ok(ToolResult::ok(self.name(), false, json!({})));
        };

        let data = json!({
            "project": row.remove("project").unwrap_or(Value::Null),
            "crew": row.remove("crew").unwrap_or_else(|| json!([])),
            "client": row.remove("client").unwrap_or(Value::Null),
            "director": row.remove("director").unwrap_or(Value::Null),
        });
        let found = !data["project"].is_null();
        Ok(ToolResult::ok(self.name(), found, data))
    }
}

/// `find_projects_by_concept` - projects connected to a creative concept.
pub struct FindProjectsByConcept {
    graph: Arc<dyn GraphStore>,
    policy: ToolPolicy,
}

impl FindProjectsByConcept {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            policy: ToolPolicy::open("read:concepts").with_sensitivity(project_sensitivity()),
        }
    }
}

#[async_trait]
impl GraphTool for FindProjectsByConcept {
    fn name(&self) -> &'static str {
        "find_projects_by_concept"
    }

    fn description(&self) -> &'static str {
        "Find projects matching a creative concept, by concept node or project description."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "concept": {"type": "string", "description": "Creative concept, e.g. 'documentary approach'"}
            },
            "required": ["concept"]
        })
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, _principal: &Principal) -> Result<ToolResult> {
        let concept = required_str(arguments, "concept")?;

        let query = CypherQuery::read(
            "MATCH (proj:Project) \
             WHERE toLower(coalesce(proj.description, '')) CONTAINS toLower($concept) \
                OR EXISTS { \
                     MATCH (proj)--(c:CreativeConcept) \
                     WHERE toLower(c.name) CONTAINS toLower($concept) \
                   } \
             RETURN collect(proj {.id, .title, .type, .year, .budget, .description})[0..25] AS projects",
        )
        .param("concept", concept.clone())
        .returning(["projects"]);

        let mut rows = self.graph.run(query).await?;
        let projects = rows
            .pop()
            .and_then(|mut row| row.remove("projects"))
            .unwrap_or_else(|| json!([]));
        let found = projects.as_array().map_or(false, |a| !a.is_empty());
        Ok(ToolResult::ok(
            self.name(),
            found,
            json!({"concept": concept, "projects": projects}),
        ))
    }
}

/// `find_contributors_on_client_projects` - people who held a role on any of
/// a client's projects.
pub struct FindContributorsOnClientProjects {
    graph: Arc<dyn GraphStore>,
    policy: ToolPolicy,
}

impl FindContributorsOnClientProjects {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            policy: ToolPolicy::open("read:people")
                .with_min_role(Role::Salesperson)
                .with_sensitivity(SensitivityPolicy::new().field("email", 2)),
        }
    }
}

#[async_trait]
impl GraphTool for FindContributorsOnClientProjects {
    fn name(&self) -> &'static str {
        "find_contributors_on_client_projects"
    }

    fn description(&self) -> &'static str {
        "Find people who worked on a client's projects, optionally filtered by role."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "client": {"type": "string", "description": "Client organization name (partial match)"},
                "role": {"type": "string", "description": "Role filter, e.g. 'director' (optional)"}
            },
            "required": ["client"]
        })
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, _principal: &Principal) -> Result<ToolResult> {
        let client = required_str(arguments, "client")?;
        let role = optional_str(arguments, "role").unwrap_or_default();

        let query = CypherQuery::read(
            "MATCH (person:Person)-[w:WORKED_ON]->(proj:Project)-[:FOR_CLIENT]->(org:Organization) \
             WHERE toLower(org.name) CONTAINS toLower($client) \
               AND ($role = '' OR toLower(coalesce(w.role, '')) CONTAINS toLower($role)) \
             WITH person, collect(DISTINCT proj.title) AS projects, collect(DISTINCT w.role) AS roles \
             RETURN collect(person {.id, .name, .email, projects: projects, roles: roles})[0..25] AS contributors",
        )
        .param("client", client.clone())
        .param("role", role)
        .returning(["contributors"]);

        let mut rows = self.graph.run(query).await?;
        let contributors = rows
            .pop()
            .and_then(|mut row| row.remove("contributors"))
            .unwrap_or_else(|| json!([]));
        let found = contributors.as_array().map_or(false, |a| !a.is_empty());
        Ok(ToolResult::ok(
            self.name(),
            found,
            json!({"client": client, "contributors": contributors}),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callsheet_graph::test_support::FakeGraph;
    use callsheet_graph::JsonRow;

    fn principal() -> Principal {
        Principal::new("u1", Role::Director, 5).unwrap()
    }

    #[tokio::test]
    async fn project_details_include_crew_and_client() {
        let graph = Arc::new(FakeGraph::new());
        let mut row = JsonRow::new();
        row.insert(
            "project".to_string(),
            json!({"id": "proj1", "title": "Boost Mobile Campaign", "budget": 500000}),
        );
        row.insert(
            "crew".to_string(),
            json!([{"id": "p1", "name": "Courtney Phillips", "role": "Treatment Writer"}]),
        );
        row.insert("client".to_string(), json!("Boost Mobile"));
        row.insert("director".to_string(), json!("Jane Doe"));
        graph.respond("MATCH (proj:Project)", vec![row]);

        let tool = GetProjectDetails::new(graph);
        let result = tool
            .call(&json!({"name": "Boost Mobile Campaign"}), &principal())
            .await
            .unwrap();

        assert!(result.found);
        let data = result.data.unwrap();
        assert_eq!(data["client"], "Boost Mobile");
        assert_eq!(data["crew"][0]["role"], "Treatment Writer");
        assert_eq!(data["project"]["budget"], 500000);
    }

    #[tokio::test]
    async fn concept_search_collects_projects() {
        let graph = Arc::new(FakeGraph::new());
        let mut row = JsonRow::new();
        row.insert(
            "projects".to_string(),
            json!([{"id": "proj2", "title": "Spotify Artist Spotlight", "description": "documentary approach"}]),
        );
        graph.respond("CreativeConcept", vec![row]);

        let tool = FindProjectsByConcept::new(graph);
        let result = tool
            .call(&json!({"concept": "documentary"}), &principal())
            .await
            .unwrap();
        assert!(result.found);
        assert_eq!(result.data.unwrap()["projects"][0]["id"], "proj2");
    }

    #[tokio::test]
    async fn contributor_search_passes_role_filter() {
        let graph = Arc::new(FakeGraph::new());
        let tool = FindContributorsOnClientProjects::new(Arc::clone(&graph) as Arc<dyn GraphStore>);
        tool.call(&json!({"client": "Nike", "role": "director"}), &principal())
            .await
            .unwrap();

        let executed = graph.executed();
        let params = executed[0].params();
        assert!(params.iter().any(|(name, _)| name == "role"));
        assert!(executed[0].text().contains("FOR_CLIENT"));
    }

    #[tokio::test]
    async fn missing_client_argument_is_validation() {
        let graph = Arc::new(FakeGraph::new());
        let tool = FindContributorsOnClientProjects::new(graph);
        let err = tool.call(&json!({}), &principal()).await.unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}
