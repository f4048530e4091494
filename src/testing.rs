use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::api::ApplicationsApi;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    Application, ApplicationPatch, ApplicationStatus, CompleteApplication, Contact, Event,
    NewApplication, NewContact, NewEvent, NewNote, NewStep, Note, Step, StepPatch,
};
use crate::notify::{Notification, NotificationSink};

#[derive(Default)]
struct FakeState {
    applications: Vec<CompleteApplication>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, (ApiError, usize)>,
    next_id: u64,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn find_mut(&mut self, id: &str) -> ApiResult<&mut CompleteApplication> {
        self.applications
            .iter_mut()
            .find(|app| app.application.id == id)
            .ok_or_else(|| not_found("Application not found"))
    }
}

/// Server stand-in that keeps applications in memory and counts every call.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

fn not_found(message: &str) -> ApiError {
    ApiError::Server {
        status: 404,
        message: message.to_string(),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application(id: &str, company: &str, status: ApplicationStatus) -> Self {
        let api = Self::new();
        api.state.lock().applications.push(CompleteApplication {
            application: Application {
                id: id.to_string(),
                company: company.to_string(),
                position: "Engineer".to_string(),
                location: "Remote".to_string(),
                status,
                salary_min: None,
                salary_max: None,
                next_action: String::new(),
                created_at: now(),
                last_updated: now(),
            },
            next_steps: Vec::new(),
            events: Vec::new(),
            contacts: Vec::new(),
            notes: Vec::new(),
        });
        api
    }

    /// Number of times `op` was invoked, failed attempts included.
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Makes the next `times` calls of `op` fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: ApiError, times: usize) {
        self.state.lock().failures.insert(op, (err, times));
    }

    /// Changes server-side state behind the cache's back.
    pub fn set_status(&self, id: &str, status: ApplicationStatus) {
        if let Ok(app) = self.state.lock().find_mut(id) {
            app.application.status = status;
        }
    }

    /// Holds list and detail responses until permits are added to the
    /// returned semaphore. Each read is counted and answered from the state
    /// at call time, then waits on the gate that was current when it was
    /// made. Calling this again starts a new gate for later reads only.
    pub fn hold_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    fn begin(&self, op: &'static str) -> ApiResult<()> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some((err, remaining)) = state.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(err.clone());
            }
        }
        Ok(())
    }

    fn current_gate(&self) -> Option<Arc<Semaphore>> {
        self.gate.lock().clone()
    }

    /// Delivers a response prepared at call time, once the gate in force at
    /// call time lets it through.
    async fn respond<T>(&self, gate: Option<Arc<Semaphore>>, response: ApiResult<T>) -> ApiResult<T> {
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        response
    }
}

fn apply_patch(patch: &ApplicationPatch, app: &mut Application) {
    if let Some(company) = &patch.company {
        app.company = company.clone();
    }
    if let Some(position) = &patch.position {
        app.position = position.clone();
    }
    if let Some(location) = &patch.location {
        app.location = location.clone();
    }
    if let Some(status) = patch.status {
        app.status = status;
    }
    if patch.salary_min.is_some() {
        app.salary_min = patch.salary_min;
    }
    if patch.salary_max.is_some() {
        app.salary_max = patch.salary_max;
    }
    if let Some(next_action) = &patch.next_action {
        app.next_action = next_action.clone();
    }
}

#[async_trait]
impl ApplicationsApi for FakeApi {
    async fn list_applications(&self) -> ApiResult<Vec<Application>> {
        let gate = self.current_gate();
        let response = self.begin("list_applications").map(|()| {
            let state = self.state.lock();
            state.applications.iter().map(|app| app.application.clone()).collect()
        });
        self.respond(gate, response).await
    }

    async fn get_application(&self, id: &str) -> ApiResult<CompleteApplication> {
        let gate = self.current_gate();
        let response = self
            .begin("get_application")
            .and_then(|()| self.state.lock().find_mut(id).map(|app| app.clone()));
        self.respond(gate, response).await
    }

    async fn create_application(&self, data: &NewApplication) -> ApiResult<Application> {
        self.begin("create_application")?;
        let mut state = self.state.lock();
        let application = Application {
            id: state.next_id("app"),
            company: data.company.clone(),
            position: data.position.clone(),
            location: data.location.clone(),
            status: data.status,
            salary_min: data.salary_min,
            salary_max: data.salary_max,
            next_action: String::new(),
            created_at: now(),
            last_updated: now(),
        };
        state.applications.push(CompleteApplication {
            application: application.clone(),
            next_steps: Vec::new(),
            events: Vec::new(),
            contacts: Vec::new(),
            notes: Vec::new(),
        });
        Ok(application)
    }

    async fn update_application(&self, id: &str, data: &ApplicationPatch) -> ApiResult<Application> {
        self.begin("update_application")?;
        let mut state = self.state.lock();
        let app = state.find_mut(id)?;
        apply_patch(data, &mut app.application);
        app.application.last_updated = now();
        Ok(app.application.clone())
    }

    async fn delete_application(&self, id: &str) -> ApiResult<()> {
        self.begin("delete_application")?;
        let mut state = self.state.lock();
        let before = state.applications.len();
        state.applications.retain(|app| app.application.id != id);
        if state.applications.len() == before {
            return Err(not_found("Application not found"));
        }
        Ok(())
    }

    async fn create_event(&self, id: &str, data: &NewEvent) -> ApiResult<Event> {
        self.begin("create_event")?;
        let mut state = self.state.lock();
        let event = Event {
            id: state.next_id("event"),
            application_id: Some(id.to_string()),
            title: data.title.clone(),
            description: data.description.clone(),
            event_date: data.event_date.clone(),
            created_at: now(),
        };
        state.find_mut(id)?.events.push(event.clone());
        Ok(event)
    }

    async fn create_step(&self, id: &str, data: &NewStep) -> ApiResult<Step> {
        self.begin("create_step")?;
        let mut state = self.state.lock();
        let step = Step {
            id: state.next_id("step"),
            application_id: Some(id.to_string()),
            title: data.title.clone(),
            due_date: data.due_date.clone(),
            completed: data.completed,
            created_at: now(),
        };
        state.find_mut(id)?.next_steps.push(step.clone());
        Ok(step)
    }

    async fn update_step(&self, step_id: &str, data: &StepPatch) -> ApiResult<Step> {
        self.begin("update_step")?;
        let mut state = self.state.lock();
        let step = state
            .applications
            .iter_mut()
            .flat_map(|app| app.next_steps.iter_mut())
            .find(|step| step.id == step_id)
            .ok_or_else(|| not_found("Step not found"))?;
        if let Some(title) = &data.title {
            step.title = title.clone();
        }
        if let Some(due_date) = &data.due_date {
            step.due_date = due_date.clone();
        }
        if let Some(completed) = data.completed {
            step.completed = completed;
        }
        Ok(step.clone())
    }

    async fn create_contact(&self, id: &str, data: &NewContact) -> ApiResult<Contact> {
        self.begin("create_contact")?;
        let mut state = self.state.lock();
        let contact = Contact {
            id: state.next_id("contact"),
            application_id: Some(id.to_string()),
            name: data.name.clone(),
            role: data.role.clone(),
            email: data.email.clone(),
            phone: data.phone.clone(),
            created_at: now(),
        };
        state.find_mut(id)?.contacts.push(contact.clone());
        Ok(contact)
    }

    async fn create_note(&self, id: &str, data: &NewNote) -> ApiResult<Note> {
        self.begin("create_note")?;
        let mut state = self.state.lock();
        let note = Note {
            id: state.next_id("note"),
            application_id: Some(id.to_string()),
            content: data.content.clone(),
            created_at: now(),
        };
        state.find_mut(id)?.notes.push(note.clone());
        Ok(note)
    }
}

/// Keeps every notification for later inspection.
#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock())
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &Notification) {
        self.seen.lock().push(notification.clone());
    }
}
