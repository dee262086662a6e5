//! Single-flight access token refresh.
//!
//! The coordinator is `Idle` or `Refreshing`. The first request that fails with
//! an expired token becomes the leader and performs the only refresh call;
//! every other request that needs a token while it runs waits on a oneshot
//! channel and is replayed with the token the leader obtained. A request is
//! retried at most once.
//!
//! A successful password change revokes every token server-side, so the local
//! session is purged as soon as the server confirms it.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{
    errors::SessionError,
    guard::Navigation,
    store::{SessionProfile, SessionStore, StoredSession},
    transport::{ApiRequest, ApiResponse, PASSWORD_PATH, Signal, Transport, classify},
};

type Waiter = oneshot::Sender<Result<String, SessionError>>;

enum State {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

enum Ticket {
    Ready(Result<String, SessionError>),
    Wait(oneshot::Receiver<Result<String, SessionError>>),
    Lead(String),
}

pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    state: Mutex<State>,
    closed: AtomicBool,
}

/// Releases queued requests if the leader is dropped mid-refresh.
struct LeaderGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let released = self.coordinator.take_waiters().len();
            warn!(released, "refresh abandoned, releasing queued requests");
        }
    }
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            transport,
            store,
            state: Mutex::new(State::Idle),
            closed: AtomicBool::new(false),
        }
    }

    /// Log in and persist the resulting session.
    ///
    /// # Errors
    /// Returns the transport error, or `Store` if the session cannot be saved.
    pub async fn login(&self, identifier: &str, password: &str) -> Result<SessionProfile, SessionError> {
        let tokens = self.transport.login(identifier, password).await?;
        let session = StoredSession::from_tokens(&tokens)
            .map_err(|err| SessionError::Transport(format!("unreadable access token: {err}")))?;
        let profile = session.profile.clone();
        self.store.save(session)?;
        info!(subject = %profile.subject, "session started");
        Ok(profile)
    }

    /// Revoke the session server-side and purge it locally.
    ///
    /// The local purge happens even if the server call fails.
    ///
    /// # Errors
    /// Returns `Store` if the local session cannot be cleared.
    pub async fn logout(&self) -> Result<(), SessionError> {
        if let Some(session) = self.store.load()? {
            if let Err(err) = self
                .transport
                .logout(&session.access_token, Some(&session.refresh_token))
                .await
            {
                warn!("server logout failed: {err}");
            }
        }
        self.store.clear()
    }

    /// Send `request` with the current access token, refreshing once on expiry.
    ///
    /// # Errors
    /// - `Unauthenticated` when there is no session or it was invalidated (the
    ///   store has been purged).
    /// - `Expired` when the replay after a refresh is still rejected as expired.
    /// - `PasswordChangeRequired`, `Throttled`, `Transport` as reported.
    /// - `Cancelled` after [`close`](Self::close).
    pub async fn handle(&self, request: &ApiRequest) -> Result<ApiResponse, SessionError> {
        self.ensure_open()?;
        let token = self.current_token().await?;
        let response = self.transport.send(request, Some(&token)).await?;
        if classify(&response) != Signal::Expired {
            return self.finish(request, response);
        }

        self.ensure_open()?;
        debug!(path = %request.path, "access token expired, recovering");
        let fresh = self.recover(&token).await?;
        self.ensure_open()?;
        let replayed = self.transport.send(request, Some(&fresh)).await?;
        self.finish(request, replayed)
    }

    /// Change the password and end the local session.
    ///
    /// On success the store is purged and the caller is sent to login, where
    /// the new password starts a fresh session.
    ///
    /// # Errors
    /// - `Rejected` when the server refuses the change (wrong current password
    ///   or policy); the session is kept.
    /// - Anything [`handle`](Self::handle) reports.
    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<Navigation, SessionError> {
        let request = ApiRequest::post(
            PASSWORD_PATH,
            json!({
                "current_password": current_password,
                "new_password": new_password,
            }),
        );
        let response = self.handle(&request).await?;
        if response.is_success() {
            Ok(Navigation::RedirectToLogin)
        } else {
            Err(SessionError::Rejected {
                status: response.status,
                error: response.error_code().map(str::to_string),
            })
        }
    }

    /// Stop serving: queued requests fail with `Cancelled` and an in-flight
    /// refresh is discarded when it completes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let cancelled = self.take_waiters().len();
        if cancelled > 0 {
            info!(cancelled, "coordinator closed with queued requests");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests currently waiting for a refresh to finish.
    #[must_use]
    pub fn queued(&self) -> usize {
        match &*self.lock() {
            State::Idle => 0,
            State::Refreshing { waiters } => waiters.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn take_waiters(&self) -> Vec<Waiter> {
        match std::mem::replace(&mut *self.lock(), State::Idle) {
            State::Idle => Vec::new(),
            State::Refreshing { waiters } => waiters,
        }
    }

    async fn current_token(&self) -> Result<String, SessionError> {
        let waiting = {
            let mut state = self.lock();
            match &mut *state {
                State::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                State::Idle => None,
            }
        };
        match waiting {
            Some(rx) => rx.await.map_err(|_| SessionError::Cancelled)?,
            None => self
                .store
                .load()?
                .map(|session| session.access_token)
                .ok_or(SessionError::Unauthenticated),
        }
    }

    /// Obtain a token newer than `stale`, refreshing only if nobody else has.
    async fn recover(&self, stale: &str) -> Result<String, SessionError> {
        let ticket = {
            let mut state = self.lock();
            match &mut *state {
                State::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Ticket::Wait(rx)
                }
                State::Idle => match self.store.load() {
                    Err(err) => Ticket::Ready(Err(err)),
                    Ok(None) => Ticket::Ready(Err(SessionError::Unauthenticated)),
                    // A refresh finished while this request was in flight.
                    Ok(Some(session)) if session.access_token != stale => {
                        Ticket::Ready(Ok(session.access_token))
                    }
                    Ok(Some(session)) => {
                        *state = State::Refreshing {
                            waiters: Vec::new(),
                        };
                        Ticket::Lead(session.refresh_token)
                    }
                },
            }
        };

        match ticket {
            Ticket::Ready(result) => result,
            Ticket::Wait(rx) => rx.await.map_err(|_| SessionError::Cancelled)?,
            Ticket::Lead(refresh_token) => self.lead(&refresh_token).await,
        }
    }

    async fn lead(&self, refresh_token: &str) -> Result<String, SessionError> {
        let mut guard = LeaderGuard {
            coordinator: self,
            armed: true,
        };
        let outcome = self.transport.refresh(refresh_token).await;
        guard.armed = false;

        if self.is_closed() {
            self.take_waiters();
            debug!("discarding refresh result after close");
            return Err(SessionError::Cancelled);
        }

        let saved = outcome.and_then(|tokens| {
            let session = StoredSession::from_tokens(&tokens).map_err(|err| {
                SessionError::Transport(format!("unreadable access token: {err}"))
            })?;
            let access_token = session.access_token.clone();
            self.store.save(session)?;
            Ok(access_token)
        });

        let waiters = self.take_waiters();
        match saved {
            Ok(access_token) => {
                debug!(replayed = waiters.len(), "access token refreshed");
                for waiter in waiters {
                    let _ = waiter.send(Ok(access_token.clone()));
                }
                Ok(access_token)
            }
            Err(err @ SessionError::Throttled { .. }) => {
                warn!("refresh throttled: {err}");
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                Err(err)
            }
            Err(err) => {
                warn!(rejected = waiters.len(), "refresh failed, ending session: {err}");
                self.purge();
                for waiter in waiters {
                    let _ = waiter.send(Err(SessionError::Unauthenticated));
                }
                Err(SessionError::Unauthenticated)
            }
        }
    }

    fn finish(
        &self,
        request: &ApiRequest,
        response: ApiResponse,
    ) -> Result<ApiResponse, SessionError> {
        match classify(&response) {
            Signal::Ok => {
                if request.ends_session() && response.is_success() {
                    info!("password changed, ending local session");
                    self.purge();
                }
                Ok(response)
            }
            Signal::Expired => Err(SessionError::Expired),
            Signal::Fatal => {
                self.purge();
                Err(SessionError::Unauthenticated)
            }
            Signal::PasswordChangeRequired => Err(SessionError::PasswordChangeRequired),
            Signal::Throttled {
                retry_after_seconds,
            } => Err(SessionError::Throttled {
                retry_after_seconds,
            }),
        }
    }

    fn purge(&self) {
        if let Err(err) = self.store.clear() {
            error!("failed to purge session: {err}");
        }
    }
}
