/// MCP server exposing the guideline agent.
///
/// Tools:
/// - `process_message`: run the pipeline on a conversation and return the reply
/// - `add_guideline`: create a global or conditional guideline
/// - `list_guidelines`: list stored guidelines
/// - `set_guideline_enabled`: enable or disable a guideline
/// - `delete_guideline`: remove a guideline permanently
/// - `reindex_guidelines`: re-read the seed file if it changed
use std::sync::Arc;

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{AgentResponse, ConversationTurn, GuidelineId, GuidelineView};
use crate::pipeline::GuidelineAgent;
use crate::store::GuidelineStore;
use crate::update::UpdateService;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ProcessMessageParams {
    /// The conversation so far, oldest turn first. The last turn is usually the user's.
    pub conversation: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AddGuidelineParams {
    /// What the agent should do, e.g. "Offer a discount instead of a refund".
    pub directive: String,
    /// When the directive applies, e.g. "customer requests refund". Omit for a global guideline.
    pub condition: Option<String>,
    /// Defaults to true when no condition is given.
    pub is_global: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListGuidelinesParams {
    /// Only global (true) or only conditional (false) guidelines. Omit for both.
    pub is_global: Option<bool>,
    /// Skip disabled guidelines (default: false).
    pub enabled_only: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SetGuidelineEnabledParams {
    pub id: GuidelineId,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteGuidelineParams {
    pub id: GuidelineId,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListGuidelinesResponse {
    pub guidelines: Vec<GuidelineView>,
}

/// Acknowledgement for tools that only change state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReindexGuidelinesResponse {
    pub updated: bool,
    pub guideline_count: usize,
}

#[derive(Clone)]
pub struct GuidelineAgentServer {
    agent: GuidelineAgent,
    store: Arc<dyn GuidelineStore>,
    update_service: Arc<UpdateService>,
    tool_router: ToolRouter<GuidelineAgentServer>,
}

impl GuidelineAgentServer {
    pub fn new(
        agent: GuidelineAgent,
        store: Arc<dyn GuidelineStore>,
        update_service: Arc<UpdateService>,
    ) -> Self {
        Self {
            agent,
            store,
            update_service,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl GuidelineAgentServer {
    #[tool(description = "Reply to a customer conversation, following the global guidelines and whichever conditional guidelines apply to it. Always returns a message.")]
    async fn process_message(
        &self,
        Parameters(params): Parameters<ProcessMessageParams>,
    ) -> Result<Json<AgentResponse>, String> {
        Ok(Json(self.agent.process_message(&params.conversation).await))
    }

    #[tool(description = "Add a guideline. Give a condition for a conditional guideline; omit it for one that always applies.")]
    async fn add_guideline(
        &self,
        Parameters(params): Parameters<AddGuidelineParams>,
    ) -> Result<Json<GuidelineView>, String> {
        let condition = params
            .condition
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let guideline = self
            .update_service
            .add_guideline(params.directive.trim().to_string(), condition, params.is_global)
            .await
            .map_err(|e| format!("add failed: {e}"))?;
        Ok(Json(GuidelineView::from(&guideline)))
    }

    #[tool(description = "List stored guidelines, optionally only global or only conditional ones, and optionally only enabled ones.")]
    async fn list_guidelines(
        &self,
        Parameters(params): Parameters<ListGuidelinesParams>,
    ) -> Result<Json<ListGuidelinesResponse>, String> {
        let enabled_only = params.enabled_only.unwrap_or(false);
        let kinds: &[bool] = match params.is_global {
            Some(true) => &[true],
            Some(false) => &[false],
            None => &[true, false],
        };

        let mut guidelines = Vec::new();
        for &is_global in kinds {
            let rows = self
                .store
                .fetch_by_type(is_global, enabled_only)
                .await
                .map_err(|e| format!("list failed: {e}"))?;
            guidelines.extend(rows.iter().map(GuidelineView::from));
        }
        Ok(Json(ListGuidelinesResponse { guidelines }))
    }

    #[tool(description = "Enable or disable a guideline by id. Disabled guidelines are never used when replying.")]
    async fn set_guideline_enabled(
        &self,
        Parameters(params): Parameters<SetGuidelineEnabledParams>,
    ) -> Result<Json<OkResponse>, String> {
        self.store
            .set_disabled(params.id, !params.enabled)
            .await
            .map_err(|e| e.to_string())?;
        info!(id = params.id, enabled = params.enabled, "guideline toggled");
        Ok(Json(OkResponse { ok: true }))
    }

    #[tool(description = "Delete a guideline by id. Unlike disabling, this cannot be undone.")]
    async fn delete_guideline(
        &self,
        Parameters(params): Parameters<DeleteGuidelineParams>,
    ) -> Result<Json<OkResponse>, String> {
        self.store.delete(params.id).await.map_err(|e| e.to_string())?;
        info!(id = params.id, "guideline deleted");
        Ok(Json(OkResponse { ok: true }))
    }

    #[tool(description = "Re-index guidelines from the seed file. Skips the work when the file is unchanged and the store is populated.")]
    async fn reindex_guidelines(&self) -> Result<Json<ReindexGuidelinesResponse>, String> {
        info!("reindex_guidelines tool invoked");
        let result = self
            .update_service
            .update()
            .await
            .map_err(|e| format!("reindex failed: {e}"))?;
        Ok(Json(ReindexGuidelinesResponse {
            updated: result.updated,
            guideline_count: result.guideline_count,
        }))
    }
}

#[tool_handler]
impl ServerHandler for GuidelineAgentServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "guideline-agent".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Guideline-driven customer service agent. Use process_message to get a reply \
                 for a conversation. Manage the guidelines it follows with add_guideline, \
                 list_guidelines, set_guideline_enabled and delete_guideline, and \
                 reindex_guidelines to reload the seed file."
                    .to_string(),
            ),
        }
    }
}
