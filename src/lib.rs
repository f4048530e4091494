pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod mutation;
pub mod notify;
pub mod query;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApplicationsApi};
pub use cache::{CacheStore, CacheValue, QueryKey, Subscription};
pub use config::ClientConfig;
pub use error::{ApiError, ApiResult};
pub use mutation::{Mutation, MutationCoordinator, MutationHandle, MutationState, MutationStatus, MutationVerb};
pub use notify::{Notification, NotificationSink, TracingSink};
pub use query::{QueryCoordinator, QueryHandle, QueryState, QueryStatus, RetryPolicy};
