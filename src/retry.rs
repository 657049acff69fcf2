use std::sync::Mutex;
use std::time::Duration;

use http::{Method, StatusCode};

use crate::error::TransportError;
use crate::util::lock_unpoisoned;

const DEFAULT_MAX_SERVER_ERROR_RETRIES: usize = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub method: Method,
    pub url: String,
    pub status: Option<StatusCode>,
    pub transport_error: Option<TransportError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryVerdict {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryVerdict {
    pub const fn retry_after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }

    pub const fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_server_error_retries: usize,
    retry_delay: Duration,
    retry_connection_aborts: bool,
    connection_abort_delay: Duration,
    max_connection_abort_retries: Option<usize>,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_server_error_retries: DEFAULT_MAX_SERVER_ERROR_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_connection_aborts: true,
            connection_abort_delay: DEFAULT_RETRY_DELAY,
            max_connection_abort_retries: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            max_server_error_retries: 0,
            retry_connection_aborts: false,
            ..Self::standard()
        }
    }

    pub fn max_server_error_retries(mut self, max_retries: usize) -> Self {
        self.max_server_error_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn retry_connection_aborts(mut self, retry: bool) -> Self {
        self.retry_connection_aborts = retry;
        self
    }

    pub fn connection_abort_delay(mut self, delay: Duration) -> Self {
        self.connection_abort_delay = delay;
        self
    }

    pub fn max_connection_abort_retries(mut self, max_retries: usize) -> Self {
        self.max_connection_abort_retries = Some(max_retries);
        self
    }

    pub fn server_error_cap(&self) -> usize {
        self.max_server_error_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryScope {
    #[default]
    PerCall,
    Shared,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
    pub consecutive_retries: usize,
}

#[derive(Debug)]
pub struct Retrier {
    policy: RetryPolicy,
    state: Mutex<RetryState>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(RetryState::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn consecutive_retries(&self) -> usize {
        lock_unpoisoned(&self.state).consecutive_retries
    }

    pub fn set_consecutive_retries(&self, count: usize) {
        lock_unpoisoned(&self.state).consecutive_retries = count;
    }

    pub fn reset(&self) {
        self.set_consecutive_retries(0);
    }

    /// Decides whether a failed attempt is retried, updating the count.
    ///
    /// Aborted connections bypass the server-error cap; 5xx responses are
    /// retried while the count is below the cap. Any declined failure resets
    /// the count.
    pub fn decide(&self, decision: &RetryDecision) -> RetryVerdict {
        let mut state = lock_unpoisoned(&self.state);

        let aborted = decision
            .transport_error
            .as_ref()
            .is_some_and(TransportError::is_connection_abort);
        if aborted && self.policy.retry_connection_aborts {
            let within_limit = self
                .policy
                .max_connection_abort_retries
                .is_none_or(|limit| state.consecutive_retries < limit);
            if within_limit {
                state.consecutive_retries += 1;
                return RetryVerdict::retry_after(self.policy.connection_abort_delay);
            }
        }

        if let Some(status) = decision.status
            && status.is_server_error()
            && state.consecutive_retries < self.policy.max_server_error_retries
        {
            state.consecutive_retries += 1;
            return RetryVerdict::retry_after(self.policy.retry_delay);
        }

        state.consecutive_retries = 0;
        RetryVerdict::give_up()
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryPolicy::standard())
    }
}
