use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::ApplicationsApi;
use crate::cache::{CacheStore, QueryKey};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    require_id, Application, ApplicationPatch, ApplicationStatus, Contact, Event, NewApplication,
    NewContact, NewEvent, NewNote, NewStep, Note, Step, StepPatch,
};
use crate::notify::{Notification, NotificationSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationVerb {
    Create,
    Update,
    Delete,
}

impl MutationVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationVerb::Create => "create",
            MutationVerb::Update => "update",
            MutationVerb::Delete => "delete",
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            MutationVerb::Create => "created",
            MutationVerb::Update => "updated",
            MutationVerb::Delete => "deleted",
        }
    }
}

impl fmt::Display for MutationVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every write the client can issue, with the ids it is addressed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateApplication,
    UpdateApplication { id: String },
    DeleteApplication { id: String },
    CreateEvent { application_id: String },
    CreateStep { application_id: String },
    UpdateStep { application_id: String, step_id: String },
    CreateContact { application_id: String },
    CreateNote { application_id: String },
}

impl Mutation {
    pub fn verb(&self) -> MutationVerb {
        match self {
            Mutation::CreateApplication
            | Mutation::CreateEvent { .. }
            | Mutation::CreateStep { .. }
            | Mutation::CreateContact { .. }
            | Mutation::CreateNote { .. } => MutationVerb::Create,
            Mutation::UpdateApplication { .. } | Mutation::UpdateStep { .. } => MutationVerb::Update,
            Mutation::DeleteApplication { .. } => MutationVerb::Delete,
        }
    }

    pub fn entity(&self) -> &'static str {
        match self {
            Mutation::CreateApplication
            | Mutation::UpdateApplication { .. }
            | Mutation::DeleteApplication { .. } => "application",
            Mutation::CreateEvent { .. } => "event",
            Mutation::CreateStep { .. } | Mutation::UpdateStep { .. } => "step",
            Mutation::CreateContact { .. } => "contact",
            Mutation::CreateNote { .. } => "note",
        }
    }

    /// The parent application the write is addressed through, if any.
    pub fn application_id(&self) -> Option<&str> {
        match self {
            Mutation::CreateApplication => None,
            Mutation::UpdateApplication { id } | Mutation::DeleteApplication { id } => Some(id),
            Mutation::CreateEvent { application_id }
            | Mutation::CreateStep { application_id }
            | Mutation::UpdateStep { application_id, .. }
            | Mutation::CreateContact { application_id }
            | Mutation::CreateNote { application_id } => Some(application_id),
        }
    }

    /// Keys whose cached value this write can change. The listing is always
    /// affected; a brand-new application has no detail key anyone observes.
    pub fn affected_keys(&self) -> Vec<QueryKey> {
        let mut keys = vec![QueryKey::Applications];
        if let Some(id) = self.application_id() {
            keys.push(QueryKey::application(id));
        }
        keys
    }

    pub fn failure_title(&self) -> String {
        format!("Failed to {} {}", self.verb(), self.entity())
    }

    pub fn success_message(&self) -> String {
        let entity = self.entity();
        let mut chars = entity.chars();
        let capitalized = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => String::new(),
        };
        format!("{} {}", capitalized, self.verb().past_tense())
    }

    fn check_ids(&self) -> ApiResult<()> {
        if let Some(id) = self.application_id() {
            require_id(id)?;
        }
        if let Mutation::UpdateStep { step_id, .. } = self {
            require_id(step_id).map_err(|_| ApiError::InvalidInput("Missing step identifier".to_string()))?;
        }
        Ok(())
    }
}

// --- Coordinator ---

#[derive(Clone)]
pub struct MutationCoordinator {
    store: CacheStore,
    api: Arc<dyn ApplicationsApi>,
    sink: Arc<dyn NotificationSink>,
}

impl fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl MutationCoordinator {
    pub fn new(store: CacheStore, api: Arc<dyn ApplicationsApi>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, api, sink }
    }

    /// Runs one write. `payload_check` is evaluated before anything is sent.
    async fn execute<T, Fut>(&self, mutation: Mutation, payload_check: ApiResult<()>, call: Fut) -> ApiResult<T>
    where
        Fut: Future<Output = ApiResult<T>>,
    {
        let result = match mutation.check_ids().and(payload_check) {
            Ok(()) => call.await,
            Err(err) => {
                debug!(?mutation, error = %err, "mutation rejected before dispatch");
                Err(err)
            }
        };

        match result {
            Ok(value) => {
                let keys = mutation.affected_keys();
                info!(?mutation, keys = keys.len(), "mutation succeeded");
                self.store.invalidate_many(&keys);
                self.sink.notify(&Notification::Success {
                    verb: mutation.verb(),
                    message: mutation.success_message(),
                });
                Ok(value)
            }
            Err(error) => {
                self.sink.notify(&Notification::Failure {
                    verb: mutation.verb(),
                    title: mutation.failure_title(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    pub async fn create_application(&self, data: &NewApplication) -> ApiResult<Application> {
        self.execute(
            Mutation::CreateApplication,
            data.validate(),
            self.api.create_application(data),
        )
        .await
    }

    pub async fn update_application(&self, id: &str, patch: &ApplicationPatch) -> ApiResult<Application> {
        self.execute(
            Mutation::UpdateApplication { id: id.trim().to_string() },
            patch.validate(),
            self.api.update_application(id, patch),
        )
        .await
    }

    pub async fn update_status(&self, id: &str, status: ApplicationStatus) -> ApiResult<Application> {
        self.update_application(id, &ApplicationPatch::status(status)).await
    }

    pub async fn delete_application(&self, id: &str) -> ApiResult<()> {
        self.execute(
            Mutation::DeleteApplication { id: id.trim().to_string() },
            Ok(()),
            self.api.delete_application(id),
        )
        .await
    }

    pub async fn create_event(&self, application_id: &str, data: &NewEvent) -> ApiResult<Event> {
        self.execute(
            Mutation::CreateEvent {
                application_id: application_id.trim().to_string(),
            },
            data.validate(),
            self.api.create_event(application_id, data),
        )
        .await
    }

    pub async fn create_step(&self, application_id: &str, data: &NewStep) -> ApiResult<Step> {
        self.execute(
            Mutation::CreateStep {
                application_id: application_id.trim().to_string(),
            },
            data.validate(),
            self.api.create_step(application_id, data),
        )
        .await
    }

    /// Steps are addressed by their own id on the wire but invalidate
    /// through their parent application.
    pub async fn update_step(&self, application_id: &str, step_id: &str, patch: &StepPatch) -> ApiResult<Step> {
        self.execute(
            Mutation::UpdateStep {
                application_id: application_id.trim().to_string(),
                step_id: step_id.trim().to_string(),
            },
            patch.validate(),
            self.api.update_step(step_id, patch),
        )
        .await
    }

    pub async fn set_step_completed(&self, application_id: &str, step_id: &str, completed: bool) -> ApiResult<Step> {
        self.update_step(application_id, step_id, &StepPatch::completed(completed))
            .await
    }

    pub async fn create_contact(&self, application_id: &str, data: &NewContact) -> ApiResult<Contact> {
        self.execute(
            Mutation::CreateContact {
                application_id: application_id.trim().to_string(),
            },
            data.validate(),
            self.api.create_contact(application_id, data),
        )
        .await
    }

    pub async fn create_note(&self, application_id: &str, data: &NewNote) -> ApiResult<Note> {
        self.execute(
            Mutation::CreateNote {
                application_id: application_id.trim().to_string(),
            },
            data.validate(),
            self.api.create_note(application_id, data),
        )
        .await
    }
}

// --- Observable handle ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationState<T> {
    pub status: MutationStatus,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> MutationState<T> {
    fn idle() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        }
    }
}

/// Tracks the lifecycle of one kind of write for a presentation layer:
/// pending flag, last result, last error.
pub struct MutationHandle<T> {
    tx: watch::Sender<MutationState<T>>,
}

impl<T: Clone> MutationHandle<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(MutationState::idle());
        Self { tx }
    }

    /// Triggers the write. The outcome is also returned to the caller.
    pub async fn run<F>(&self, mutation: F) -> ApiResult<T>
    where
        F: Future<Output = ApiResult<T>>,
    {
        self.tx.send_modify(|state| {
            state.status = MutationStatus::Pending;
            state.error = None;
        });

        let result = mutation.await;
        self.tx.send_modify(|state| match &result {
            Ok(value) => {
                state.status = MutationStatus::Success;
                state.data = Some(value.clone());
                state.error = None;
            }
            Err(err) => {
                state.status = MutationStatus::Error;
                state.error = Some(err.clone());
            }
        });
        result
    }

    pub fn state(&self) -> MutationState<T> {
        self.tx.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.tx.borrow().status == MutationStatus::Pending
    }

    pub fn data(&self) -> Option<T> {
        self.tx.borrow().data.clone()
    }

    pub fn error(&self) -> Option<ApiError> {
        self.tx.borrow().error.clone()
    }

    pub fn reset(&self) {
        self.tx.send_replace(MutationState::idle());
    }
}

impl<T: Clone> Default for MutationHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheValue;
    use crate::query::{QueryCoordinator, RetryPolicy};
    use crate::testing::{FakeApi, RecordingSink};

    struct Harness {
        api: Arc<FakeApi>,
        sink: Arc<RecordingSink>,
        queries: QueryCoordinator,
        mutations: MutationCoordinator,
    }

    fn harness(api: FakeApi) -> Harness {
        let api = Arc::new(api);
        let sink = Arc::new(RecordingSink::default());
        let store = CacheStore::new();
        let queries = QueryCoordinator::new(store.clone(), api.clone(), RetryPolicy::immediate(3));
        let mutations = MutationCoordinator::new(store, api.clone(), sink.clone());
        Harness {
            api,
            sink,
            queries,
            mutations,
        }
    }

    fn new_application(company: &str) -> NewApplication {
        NewApplication {
            company: company.to_string(),
            position: "Engineer".to_string(),
            location: "Remote".to_string(),
            status: ApplicationStatus::Saved,
            salary_min: None,
            salary_max: None,
        }
    }

    fn server_error(status: u16) -> ApiError {
        ApiError::Server {
            status,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_impact_table() {
        assert_eq!(Mutation::CreateApplication.affected_keys(), vec![QueryKey::Applications]);

        let both = vec![QueryKey::Applications, QueryKey::application("a1")];
        let id = "a1".to_string();
        assert_eq!(Mutation::UpdateApplication { id: id.clone() }.affected_keys(), both);
        assert_eq!(Mutation::DeleteApplication { id: id.clone() }.affected_keys(), both);
        assert_eq!(Mutation::CreateEvent { application_id: id.clone() }.affected_keys(), both);
        assert_eq!(Mutation::CreateStep { application_id: id.clone() }.affected_keys(), both);
        assert_eq!(
            Mutation::UpdateStep {
                application_id: id.clone(),
                step_id: "s1".to_string()
            }
            .affected_keys(),
            both
        );
        assert_eq!(Mutation::CreateContact { application_id: id.clone() }.affected_keys(), both);
        assert_eq!(Mutation::CreateNote { application_id: id }.affected_keys(), both);
    }

    #[test]
    fn test_messages_name_the_operation() {
        let update = Mutation::UpdateApplication { id: "a1".into() };
        assert_eq!(update.failure_title(), "Failed to update application");
        assert_eq!(update.success_message(), "Application updated");
        assert_eq!(Mutation::CreateStep { application_id: "a1".into() }.failure_title(), "Failed to create step");
        assert_eq!(Mutation::DeleteApplication { id: "a1".into() }.verb(), MutationVerb::Delete);
    }

    #[tokio::test]
    async fn test_status_update_refreshes_list_and_detail() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Applied));
        let list = QueryKey::Applications;
        let detail = QueryKey::application("a1");
        h.queries.query(&list).await;
        h.queries.query(&detail).await;

        h.mutations.update_status("a1", ApplicationStatus::Offer).await.unwrap();

        assert!(h.queries.store().is_stale(&list));
        assert!(h.queries.store().is_stale(&detail));

        let apps = h.queries.fetch(&list).await.unwrap();
        assert_eq!(apps.as_applications().unwrap()[0].status, ApplicationStatus::Offer);
        let app = h.queries.fetch(&detail).await.unwrap();
        assert_eq!(app.as_application().unwrap().application.status, ApplicationStatus::Offer);

        assert_eq!(
            h.sink.take(),
            vec![Notification::Success {
                verb: MutationVerb::Update,
                message: "Application updated".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_observers_see_update_without_manual_reload() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Applied));
        let mut list = h.queries.watch(&QueryKey::Applications);
        let mut detail = h.queries.watch(&QueryKey::application("a1"));
        list.settled().await;
        detail.settled().await;

        h.mutations.update_status("a1", ApplicationStatus::Offer).await.unwrap();

        let list_state = list.settled().await;
        let detail_state = detail.settled().await;
        assert_eq!(list_state.applications().unwrap()[0].status, ApplicationStatus::Offer);
        assert_eq!(
            detail_state.application().unwrap().application.status,
            ApplicationStatus::Offer
        );
        assert_eq!(h.api.calls("list_applications"), 2);
        assert_eq!(h.api.calls("get_application"), 2);
    }

    #[tokio::test]
    async fn test_delete_removes_from_next_list_read() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Applied));
        let list = QueryKey::Applications;
        h.queries.query(&list).await;

        h.mutations.delete_application("a1").await.unwrap();

        let apps = h.queries.fetch(&list).await.unwrap();
        assert!(apps.as_applications().unwrap().iter().all(|a| a.id != "a1"));
    }

    #[tokio::test]
    async fn test_create_step_appears_in_detail() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Applied));
        let detail = QueryKey::application("a1");
        h.queries.query(&detail).await;

        let step = h
            .mutations
            .create_step(
                "a1",
                &NewStep {
                    title: "Follow up".to_string(),
                    due_date: "2024-12-01".to_string(),
                    completed: false,
                },
            )
            .await
            .unwrap();

        let value = h.queries.fetch(&detail).await.unwrap();
        let steps = &value.as_application().unwrap().next_steps;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id, step.id);
        assert_eq!(steps[0].title, "Follow up");
        assert!(!steps[0].completed);

        h.mutations.set_step_completed("a1", &step.id, true).await.unwrap();
        let value = h.queries.fetch(&detail).await.unwrap();
        assert!(value.as_application().unwrap().next_steps[0].completed);
    }

    #[tokio::test]
    async fn test_create_application_only_invalidates_list() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Applied));
        let list = QueryKey::Applications;
        let detail = QueryKey::application("a1");
        h.queries.query(&list).await;
        h.queries.query(&detail).await;

        let created = h.mutations.create_application(&new_application("Globex")).await.unwrap();
        assert!(h.queries.store().is_stale(&list));
        assert!(!h.queries.store().is_stale(&detail));

        let apps = h.queries.fetch(&list).await.unwrap();
        assert!(apps.as_applications().unwrap().iter().any(|a| a.id == created.id));
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_cache_untouched() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Applied));
        let list = QueryKey::Applications;
        let detail = QueryKey::application("a1");
        h.queries.query(&list).await;
        h.queries.query(&detail).await;
        let before: Vec<_> = [&list, &detail].iter().map(|k| h.queries.store().read(k)).collect();

        h.api.fail_next("update_application", server_error(500), 1);
        let err = h
            .mutations
            .update_status("a1", ApplicationStatus::Offer)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);

        let after: Vec<_> = [&list, &detail].iter().map(|k| h.queries.store().read(k)).collect();
        assert_eq!(before, after);
        // Never retried automatically.
        assert_eq!(h.api.calls("update_application"), 1);

        let notes = h.sink.take();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].summary(), "Failed to update application: boom");
    }

    #[tokio::test]
    async fn test_invalid_input_is_never_dispatched() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Applied));

        let err = h.mutations.update_status("  ", ApplicationStatus::Offer).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));

        let mut bad = new_application("Globex");
        bad.salary_min = Some(200_000);
        bad.salary_max = Some(100_000);
        assert!(h.mutations.create_application(&bad).await.is_err());

        let err = h
            .mutations
            .set_step_completed("a1", "", true)
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Missing step identifier");

        assert_eq!(h.api.calls("update_application"), 0);
        assert_eq!(h.api.calls("create_application"), 0);
        assert_eq!(h.api.calls("update_step"), 0);
        assert!(h.sink.take().iter().all(Notification::is_failure));
    }

    #[tokio::test]
    async fn test_detail_not_found_after_delete() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Applied));
        let mut detail = h.queries.watch(&QueryKey::application("a1"));
        detail.settled().await;

        h.mutations.delete_application("a1").await.unwrap();
        let state = detail.settled().await;

        assert!(state.is_error());
        assert!(state.error.as_ref().unwrap().is_not_found());
        // 404 is permanent: one refetch, no retries.
        assert_eq!(h.api.calls("get_application"), 2);
    }

    #[tokio::test]
    async fn test_mutation_handle_tracks_lifecycle() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Applied));
        let handle: MutationHandle<Application> = MutationHandle::new();
        assert_eq!(handle.state().status, MutationStatus::Idle);

        let app = handle
            .run(h.mutations.update_status("a1", ApplicationStatus::Interviewing))
            .await
            .unwrap();
        assert_eq!(app.status, ApplicationStatus::Interviewing);
        assert_eq!(handle.state().status, MutationStatus::Success);
        assert_eq!(handle.data().unwrap().status, ApplicationStatus::Interviewing);

        h.api.fail_next("update_application", server_error(503), 1);
        let result = handle
            .run(h.mutations.update_status("a1", ApplicationStatus::Offer))
            .await;
        assert!(result.is_err());
        assert_eq!(handle.state().status, MutationStatus::Error);
        assert_eq!(handle.error().unwrap().status(), 503);
        assert!(!handle.is_pending());

        handle.reset();
        assert_eq!(handle.state().status, MutationStatus::Idle);
        assert!(handle.data().is_none());
    }

    #[tokio::test]
    async fn test_sub_resource_creates_refresh_parent() {
        let h = harness(FakeApi::with_application("a1", "Acme", ApplicationStatus::Interviewing));
        let detail = QueryKey::application("a1");
        h.queries.query(&detail).await;

        h.mutations
            .create_event(
                "a1",
                &NewEvent {
                    title: "Technical interview".to_string(),
                    description: "System design".to_string(),
                    event_date: "2024-11-10T14:00:00Z".to_string(),
                },
            )
            .await
            .unwrap();
        h.mutations
            .create_contact(
                "a1",
                &NewContact {
                    name: "Sarah Johnson".to_string(),
                    role: Some("Hiring Manager".to_string()),
                    email: None,
                    phone: None,
                },
            )
            .await
            .unwrap();
        h.mutations
            .create_note("a1", &NewNote { content: "Bring portfolio".to_string() })
            .await
            .unwrap();

        let value = h.queries.fetch(&detail).await.unwrap();
        let CacheValue::Application(detail) = value else {
            panic!("expected detail value");
        };
        assert_eq!(detail.events.len(), 1);
        assert_eq!(detail.contacts[0].name, "Sarah Johnson");
        assert_eq!(detail.notes[0].content, "Bring portfolio");
    }
}
