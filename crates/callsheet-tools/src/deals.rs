//! Deal lookup tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use callsheet_core::error::Result;
use callsheet_core::message::ToolResult;
use callsheet_core::principal::{Principal, Role};
use callsheet_core::rbac::{SensitivityPolicy, ToolPolicy};
use callsheet_graph::{CypherQuery, GraphStore};

use crate::args::required_str;
use crate::GraphTool;

fn deal_sensitivity() -> SensitivityPolicy {
    SensitivityPolicy::new().field("value", 4).field("probability", 4)
}

/// `get_deal_details` - one deal with stage, value, and client.
pub struct GetDealDetails {
    graph: Arc<dyn GraphStore>,
    policy: ToolPolicy,
}

impl GetDealDetails {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            policy: ToolPolicy::open("read:deals")
                .with_min_role(Role::Salesperson)
                .with_sensitivity(deal_sensitivity()),
        }
    }
}

#[async_trait]
impl GraphTool for GetDealDetails {
    fn name(&self) -> &'static str {
        "get_deal_details"
    }

    fn description(&self) -> &'static str {
        "Look up a deal by id: name, stage, status, value, probability, and client organization."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Deal id"}
            },
            "required": ["id"]
        })
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, _principal: &Principal) -> Result<ToolResult> {
        let id = required_str(arguments, "id")?;

        let query = CypherQuery::read(
            "MATCH (d:Deal {id: $id}) \
             OPTIONAL MATCH (d)-[:FOR_CLIENT]->(org:Organization) \
             RETURN d {.id, .name, .stage, .status, .value, .probability, .expectedCloseDate} AS deal, \
                    head(collect(org.name)) AS client",
        )
        .param("id", id)
        .returning(["deal", "client"]);

        let mut rows = self.graph.run(query).await?;
        let Some(mut row) = rows.pop() else {
            return Ok(ToolResult::ok(self.name(), false, json!({})));
        };

        let data = json!({
            "deal": row.remove("deal").unwrap_or(Value::Null),
            "client": row.remove("client").unwrap_or(Value::Null),
        });
        let found = !data["deal"].is_null();
        Ok(ToolResult::ok(self.name(), found, data))
    }
}

/// `get_deal_sourcer` - the person who sourced a deal.
pub struct GetDealSourcer {
    graph: Arc<dyn GraphStore>,
    policy: ToolPolicy,
}

impl GetDealSourcer {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            policy: ToolPolicy::open("read:deals").with_min_role(Role::Salesperson),
        }
    }
}

#[async_trait]
impl GraphTool for GetDealSourcer {
    fn name(&self) -> &'static str {
        "get_deal_sourcer"
    }

    fn description(&self) -> &'static str {
        "Find the person who sourced a deal, by deal id."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Deal id"}
            },
            "required": ["id"]
        })
    }

    fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    async fn call(&self, arguments: &Value, _principal: &Principal) -> Result<ToolResult> {
        let id = required_str(arguments, "id")?;

        let query = CypherQuery::read(
            "MATCH (d:Deal {id: $id})-[:AUTHORED_BY]->(sourcer:Person) \
             RETURN d.name AS deal, sourcer {.id, .name, .title} AS sourcer",
        )
        .param("id", id)
        .returning(["deal", "sourcer"]);

        let mut rows = self.graph.run(query).await?;
        let Some(mut row) = rows.pop() else {
            return Ok(ToolResult::ok(self.name(), false, json!({})));
        };

        let data = json!({
            "deal": row.remove("deal").unwrap_or(Value::Null),
            "sourcer": row.remove("sourcer").unwrap_or(Value::Null),
        });
        let found = !data["sourcer"].is_null();
        Ok(ToolResult::ok(self.name(), found, data))
    }
}
