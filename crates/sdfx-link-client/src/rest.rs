//! Request/response helpers against the backend's HTTP API.
//!
//! Every call returns a `Result`; nothing here panics on a bad response.

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("Backend unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl RestError {
    /// The error response body parsed as JSON, when there is one.
    pub fn body_json(&self) -> Option<Value> {
        match self {
            Self::Status { body, .. } => serde_json::from_str(body).ok(),
            _ => None,
        }
    }
}

/// Where a submitted prompt lands in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Front,
    Back,
    /// Explicit queue number.
    Number(i64),
}

impl QueuePosition {
    /// `-1` means front and `0` means back; anything else is an explicit number.
    pub fn from_index(index: i64) -> Self {
        match index {
            -1 => Self::Front,
            0 => Self::Back,
            n => Self::Number(n),
        }
    }
}

/// Queue listing: prompts currently running and waiting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub queue_running: Vec<Value>,
    #[serde(default)]
    pub queue_pending: Vec<Value>,
}

/// Server-side list that supports delete/clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemList {
    Queue,
    History,
}

impl ItemList {
    fn route(self) -> &'static str {
        match self {
            Self::Queue => "/queue",
            Self::History => "/history",
        }
    }
}

/// Custom node manager operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomNodeAction {
    Install,
    Uninstall,
    Update,
    Fix,
    ToggleActive,
}

impl CustomNodeAction {
    fn route(self) -> &'static str {
        match self {
            Self::Install => "/customnode/install",
            Self::Uninstall => "/customnode/uninstall",
            Self::Update => "/customnode/update",
            Self::Fix => "/customnode/fix",
            Self::ToggleActive => "/customnode/toggle_active",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, route: &str) -> RequestBuilder {
        let url = format!("{}{route}", self.base_url);
        debug!(%method, %url, "REST request");
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn checked(builder: RequestBuilder) -> Result<reqwest::Response, RestError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn execute<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, RestError> {
        let text = Self::checked(builder).await?.text().await?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| RestError::Decode(e.to_string()))
    }

    /// GET a route and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, route: &str) -> Result<T, RestError> {
        Self::execute(self.request(Method::GET, route)).await
    }

    /// Send an optional JSON body with any method and decode the JSON reply.
    pub async fn send_json<T, B>(
        &self,
        method: Method,
        route: &str,
        body: Option<&B>,
    ) -> Result<T, RestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut builder = self.request(method, route);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Self::execute(builder).await
    }

    /// POST and ignore whatever the server answers with.
    async fn post(&self, route: &str, body: Option<Value>) -> Result<(), RestError> {
        let mut builder = self.request(Method::POST, route);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        Self::checked(builder).await?;
        Ok(())
    }

    /// Submit a prompt graph for execution.
    ///
    /// On rejection the returned `RestError::Status` carries the server's
    /// error document; see `sdfx_link_core::report::format_prompt_error`.
    pub async fn queue_prompt(
        &self,
        client_id: &str,
        position: QueuePosition,
        prompt: &Value,
        workflow: Option<&Value>,
    ) -> Result<Value, RestError> {
        let mut body = json!({
            "client_id": client_id,
            "prompt": prompt,
            "extra_data": { "extra_pnginfo": { "workflow": workflow } },
        });
        match position {
            QueuePosition::Front => body["front"] = json!(true),
            QueuePosition::Number(n) => body["number"] = json!(n),
            QueuePosition::Back => {}
        }
        self.send_json(Method::POST, "/prompt", Some(&body)).await
    }

    pub async fn get_queue(&self) -> Result<QueueState, RestError> {
        self.get_json("/queue").await
    }

    /// Most recent history entries, at most `max_items`.
    /// History entries in the order the server lists them.
    pub async fn get_history(&self, max_items: u32) -> Result<Vec<Value>, RestError> {
        let history: serde_json::Map<String, Value> = self
            .get_json(&format!("/history?max_items={max_items}"))
            .await?;
        Ok(history.into_iter().map(|(_, entry)| entry).collect())
    }

    pub async fn delete_item(&self, list: ItemList, id: &str) -> Result<(), RestError> {
        self.post(list.route(), Some(json!({ "delete": [id] }))).await
    }

    pub async fn clear_items(&self, list: ItemList) -> Result<(), RestError> {
        self.post(list.route(), Some(json!({ "clear": true }))).await
    }

    /// Interrupt the running prompt.
    pub async fn interrupt(&self) -> Result<(), RestError> {
        self.post("/interrupt", None).await
    }

    pub async fn get_node_defs(&self) -> Result<Value, RestError> {
        self.get_json("/object_info").await
    }

    pub async fn get_embeddings(&self) -> Result<Vec<String>, RestError> {
        self.get_json("/embeddings").await
    }

    pub async fn get_extensions(&self) -> Result<Vec<String>, RestError> {
        self.get_json("/extensions").await
    }

    pub async fn get_models(&self) -> Result<Value, RestError> {
        self.get_json("/sdfx/model/list").await
    }

    pub async fn get_custom_nodes(&self) -> Result<Value, RestError> {
        let listing: Value = self
            .get_json("/customnode/getlist?mode=url&skip_update=true")
            .await?;
        Ok(listing.get("custom_nodes").cloned().unwrap_or(Value::Null))
    }

    pub async fn get_custom_node_mappings(&self) -> Result<Value, RestError> {
        self.get_json("/customnode/getmappings?mode=local").await
    }

    pub async fn manage_custom_node(
        &self,
        action: CustomNodeAction,
        node: &Value,
    ) -> Result<Value, RestError> {
        self.send_json(Method::POST, action.route(), Some(node)).await
    }

    pub async fn get_custom_node_snapshot(&self) -> Result<Value, RestError> {
        self.get_json("/snapshot/get_current").await
    }

    /// Ask the backend manager to restart the server.
    pub async fn reboot(&self) -> Result<Value, RestError> {
        self.get_json("/manager/reboot").await
    }
}
