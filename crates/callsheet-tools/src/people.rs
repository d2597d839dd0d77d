//! Person and organization lookup tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use callsheet_core::error::Result;
use callsheet_core::message::ToolResult;
use callsheet_core::principal::{Principal, Role};
use callsheet_core::rbac::{SensitivityPolicy, ToolPolicy};
use callsheet_graph::{CypherQuery, GraphStore};

use crate::args::{name_or_id, name_or_id_schema, required_str, Lookup};
use crate::GraphTool;

/// `get_person_profile` - person with projects, roles, and union status.
pub struct GetPersonProfile {
    graph: Arc<dyn GraphStore>,
    policy: ToolPolicy,
}

impl GetPersonProfile {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            policy: ToolPolicy::open("read:people")
                .with_min_role(Role::Salesperson)
                .with_sensitivity(
                    SensitivityPolicy::new()
                        .field("email", 2)
                        .field("unionStatus", 3),
                ),
        }
    }
}

#[async_trait]
impl GraphTool for GetPersonProfile {
    fn name(&self) -> &'static str {
        "get_person_profile"
    }

    fn description(&self) -> &'static str {
        "Look up a person by name or id: title, bio, union status, organization, and project history."
    }

    fn parameters(&self) -> Value {
        name_or_id_schema("person")
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, _principal: &Principal) -> Result<ToolResult> {
        let (filter, key, value) = match name_or_id(arguments)? {
            Lookup::Id(id) => ("p.id = $id", "id", id),
            Lookup::Name(name) => ("toLower(p.name) = toLower($name)", "name", name),
        };

        let query = CypherQuery::read(format!(
            "MATCH (p:Person) WHERE {filter} \
             OPTIONAL MATCH (p)-[w:WORKED_ON]->(proj:Project) \
             OPTIONAL MATCH (p)-[:MEMBER_OF]->(org:Organization) \
             RETURN p {{.id, .name, .title, .email, .bio, .unionStatus}} AS person, \
                    collect(DISTINCT proj {{.id, .title, .type, role: w.role}}) AS projects, \
                    head(collect(DISTINCT org.name)) AS organization"
        ))
        .param(key, value)
        .returning(["person", "projects", "organization"]);

        let mut rows = self.graph.run(query).await?;
        let Some(mut row) = rows.pop() else {
            return Ok(ToolResult::ok(self.name(), false, json!({})));
        };

        let data = json!({
            "person": row.remove("person").unwrap_or(Value::Null),
            "projects": row.remove("projects").unwrap_or_else(|| json!([])),
            "organization": row.remove("organization").unwrap_or(Value::Null),
        });
        let found = !data["person"].is_null();
        Ok(ToolResult::ok(self.name(), found, data))
    }
}

/// `get_organization_profile` - organization with people and recent projects.
pub struct GetOrganizationProfile {
    graph: Arc<dyn GraphStore>,
    policy: ToolPolicy,
}

impl GetOrganizationProfile {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            policy: ToolPolicy::open("read:organizations")
                .with_min_role(Role::Salesperson)
                .with_sensitivity(SensitivityPolicy::new().field("tier", 3)),
        }
    }
}

#[async_trait]
impl GraphTool for GetOrganizationProfile {
    fn name(&self) -> &'static str {
        "get_organization_profile"
    }

    fn description(&self) -> &'static str {
        "Look up an organization by name or id: type, tier, associated people, and recent projects."
    }

    fn parameters(&self) -> Value {
        name_or_id_schema("organization")
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, _principal: &Principal) -> Result<ToolResult> {
        let (filter, key, value) = match name_or_id(arguments)? {
            Lookup::Id(id) => ("o.id = $id", "id", id),
            Lookup::Name(name) => ("toLower(o.name) = toLower($name)", "name", name),
        };

        let query = CypherQuery::read(format!(
            "MATCH (o:Organization) WHERE {filter} \
             OPTIONAL MATCH (person:Person)-[:MEMBER_OF]->(o) \
             OPTIONAL MATCH (proj:Project)-[:FOR_CLIENT]->(o) \
             RETURN o {{.id, .name, .type, .tier, .industry, .description}} AS organization, \
                    collect(DISTINCT person {{.id, .name, .title}}) AS people, \
                    collect(DISTINCT proj {{.id, .title, .year, .type}})[0..10] AS recent_projects"
        ))
        .param(key, value)
        .returning(["organization", "people", "recent_projects"]);

        let mut rows = self.graph.run(query).await?;
        let Some(mut row) = rows.pop() else {
            return Ok(ToolResult::ok(self.name(), false, json!({})));
        };

        let data = json!({
            "organization": row.remove("organization").unwrap_or(Value::Null),
            "people": row.remove("people").unwrap_or_else(|| json!([])),
            "recent_projects": row.remove("recent_projects").unwrap_or_else(|| json!([])),
        });
        let found = !data["organization"].is_null();
        Ok(ToolResult::ok(self.name(), found, data))
    }
}

/// `find_people_at_organization` - members of an organization by fuzzy name.
pub struct FindPeopleAtOrganization {
    graph: Arc<dyn GraphStore>,
    policy: ToolPolicy,
}

impl FindPeopleAtOrganization {
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
impl GraphTool for FindPeopleAtOrganization {
    fn name(&self) -> &'static str {
        "find_people_at_organization"
    }

    fn description(&self) -> &'static str {
        "List people who are members of an organization, matched by partial name."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "org": {"type": "string", "description": "Organization name (partial match)"}
            },
            "required": ["org"]
        })
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, _principal: &Principal) -> Result<ToolResult> {
        let org = required_str(arguments, "org")?;

        let query = CypherQuery::read(
            "MATCH (person:Person)-[:MEMBER_OF]->(o:Organization) \
             WHERE toLower(o.name) CONTAINS toLower($org) \
             RETURN o.name AS organization, \
                    collect(person {.id, .name, .title, .email}) AS people",
        )
        .param("org", org)
        .returning(["organization", "people"]);

        let mut rows = self.graph.run(query).await?;
        let Some(mut row) = rows.pop() else {
            return Ok(ToolResult::ok(self.name(), false, json!({"people": []})));
        };

        let people = row.remove("people").unwrap_or_else(|| json!([]));
        let found = people.as_array().map_or(false, |a| !a.is_empty());
        let data = json!({
            "organization": row.remove("organization").unwrap_or(Value::Null),
            "people": people,
        });
        Ok(ToolResult::ok(self.name(), found, data))
    }
}
