use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    require_id, Application, ApplicationPatch, CompleteApplication, Contact, Event, NewApplication,
    NewContact, NewEvent, NewNote, NewStep, Note, Step, StepPatch,
};

// --- Transport trait ---

/// One method per entity verb. Implementations never touch the cache.
#[async_trait]
pub trait ApplicationsApi: Send + Sync {
    async fn list_applications(&self) -> ApiResult<Vec<Application>>;
    async fn get_application(&self, id: &str) -> ApiResult<CompleteApplication>;
    async fn create_application(&self, data: &NewApplication) -> ApiResult<Application>;
    async fn update_application(&self, id: &str, data: &ApplicationPatch) -> ApiResult<Application>;
    async fn delete_application(&self, id: &str) -> ApiResult<()>;
    async fn create_event(&self, id: &str, data: &NewEvent) -> ApiResult<Event>;
    async fn create_step(&self, id: &str, data: &NewStep) -> ApiResult<Step>;
    async fn update_step(&self, step_id: &str, data: &StepPatch) -> ApiResult<Step>;
    async fn create_contact(&self, id: &str, data: &NewContact) -> ApiResult<Contact>;
    async fn create_note(&self, id: &str, data: &NewNote) -> ApiResult<Note>;
}

// --- HTTP client ---

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    client: Client,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: config.base_url.clone(),
            client,
        })
    }

    /// Appends percent-encoded path segments to the base URL.
    fn endpoint(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidInput(format!("Invalid API base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> ApiResult<RequestBuilder> {
        let url = self.endpoint(segments)?;
        debug!(%method, %url, "api request");
        Ok(self.client.request(method, url))
    }

    async fn send_json<T, B>(&self, method: Method, segments: &[&str], body: Option<&B>) -> ApiResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut request = self.request(method, segments)?;
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = check_status(request.send().await?).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::Transport(format!("Failed to parse API response: {}", e)))
    }
}

/// Turns any non-2xx response into [`ApiError::Server`], preferring the
/// message from a JSON error body over the status line.
async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
    });

    debug!(status = status.as_u16(), %message, "api error response");
    Err(ApiError::Server {
        status: status.as_u16(),
        message,
    })
}

fn error_message(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed
        .message
        .or(parsed.error)
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
}

#[async_trait]
impl ApplicationsApi for ApiClient {
    async fn list_applications(&self) -> ApiResult<Vec<Application>> {
        self.send_json(Method::GET, &["applications"], None::<&()>).await
    }

    async fn get_application(&self, id: &str) -> ApiResult<CompleteApplication> {
        let id = require_id(id)?;
        self.send_json(Method::GET, &["applications", id], None::<&()>).await
    }

    async fn create_application(&self, data: &NewApplication) -> ApiResult<Application> {
        data.validate()?;
        self.send_json(Method::POST, &["applications"], Some(data)).await
    }

    async fn update_application(&self, id: &str, data: &ApplicationPatch) -> ApiResult<Application> {
        let id = require_id(id)?;
        data.validate()?;
        self.send_json(Method::PATCH, &["applications", id], Some(data)).await
    }

    async fn delete_application(&self, id: &str) -> ApiResult<()> {
        let id = require_id(id)?;
        let request = self.request(Method::DELETE, &["applications", id])?;
        // Success bodies (if any) are ignored; 204 is the common case.
        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn create_event(&self, id: &str, data: &NewEvent) -> ApiResult<Event> {
        let id = require_id(id)?;
        data.validate()?;
        self.send_json(Method::POST, &["applications", id, "event"], Some(data)).await
    }

    async fn create_step(&self, id: &str, data: &NewStep) -> ApiResult<Step> {
        let id = require_id(id)?;
        data.validate()?;
        self.send_json(Method::POST, &["applications", id, "step"], Some(data)).await
    }

    async fn update_step(&self, step_id: &str, data: &StepPatch) -> ApiResult<Step> {
        let step_id = require_id(step_id)?;
        data.validate()?;
        self.send_json(Method::PATCH, &["applications", "steps", step_id], Some(data))
            .await
    }

    async fn create_contact(&self, id: &str, data: &NewContact) -> ApiResult<Contact> {
        let id = require_id(id)?;
        data.validate()?;
        self.send_json(Method::POST, &["applications", id, "contact"], Some(data)).await
    }

    async fn create_note(&self, id: &str, data: &NewNote) -> ApiResult<Note> {
        let id = require_id(id)?;
        data.validate()?;
        self.send_json(Method::POST, &["applications", id, "note"], Some(data)).await
    }
}
