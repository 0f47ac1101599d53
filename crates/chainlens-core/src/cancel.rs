use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

/// Cancellation signal plus optional deadline for long-running calls.
///
/// Cloning shares the underlying token, so a single ctrl-c handler can stop
/// every in-flight request.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Drive `fut` to completion unless cancelled or past the deadline first.
    pub async fn run<T, F>(&self, what: &'static str, fut: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, CoreError>>,
    {
        if self.is_cancelled() {
            return Err(CoreError::Cancelled(what));
        }
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CoreError::Cancelled(what)),
            _ = deadline => Err(CoreError::Cancelled(what)),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let cancel = Cancellation::new();
        let value = cancel.run("op", async { Ok::<_, CoreError>(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let result = cancel.run("trace", async { Ok::<_, CoreError>(()) }).await;
        assert!(matches!(result, Err(CoreError::Cancelled("trace"))));
    }

    #[tokio::test]
    async fn deadline_interrupts_pending_future() {
        let cancel = Cancellation::new().with_timeout(Duration::from_millis(5));
        let result = cancel
            .run("slow", std::future::pending::<Result<(), CoreError>>())
            .await;
        assert!(matches!(result, Err(CoreError::Cancelled("slow"))));
    }
}
