/// Resilience helpers shared by the realtime delivery backend
///
/// - **Backoff**: exponential delay with optional ±30% jitter, resettable after success
/// - **Retry**: run a fallible async operation until it succeeds or the attempt budget runs out
///
/// # Example: reconnect loop
///
/// ```rust,no_run
/// use resilience::{Backoff, BackoffConfig};
///
/// # async fn connect() -> Result<(), String> { Ok(()) }
/// #[tokio::main]
/// async fn main() {
///     let mut backoff = Backoff::new(BackoffConfig::default());
///     while connect().await.is_err() {
///         tokio::time::sleep(backoff.next_delay()).await;
///     }
///     backoff.reset();
/// }
/// ```
pub mod backoff;
pub mod retry;

pub use backoff::{Backoff, BackoffConfig};
pub use retry::{with_retry, RetryConfig, RetryError};
