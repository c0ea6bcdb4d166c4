//! Session bridge: mirrors the auth provider's session into observable state.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::AuthProvider;
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::models::SessionUser;

pub const MIN_PASSWORD_LEN: usize = 6;

/// What the view layer sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    user: Option<SessionUser>,
    loading: bool,
    pushed: bool,
}

/// Inputs to [`SessionState::reduce`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// A new mount started probing.
    Mounted,
    /// The startup probe finished.
    ProbeResolved(Option<SessionUser>),
    /// A push event or a direct sign in/out changed the session.
    Changed(Option<SessionUser>),
}

impl SessionState {
    pub fn initial() -> Self {
        Self {
            user: None,
            loading: true,
            pushed: false,
        }
    }

    pub fn user(&self) -> Option<&SessionUser> {
        self.user.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn reduce(self, action: SessionAction) -> Self {
        match action {
            SessionAction::Mounted => Self {
                loading: true,
                pushed: false,
                ..self
            },
            // Only the first resolution counts, and a push that landed while
            // the probe was in flight is newer than the probe.
            SessionAction::ProbeResolved(user) if self.loading => Self {
                user: if self.pushed { self.user } else { user },
                loading: false,
                pushed: self.pushed,
            },
            SessionAction::ProbeResolved(_) => self,
            SessionAction::Changed(user) => Self {
                user,
                pushed: true,
                ..self
            },
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Sign-up form input.
#[derive(Debug, Clone)]
pub struct SignUpForm {
    pub email: String,
    pub password: String,
    pub confirm_password: String,
}

impl SignUpForm {
    pub fn new(email: &str, password: &str, confirm_password: &str) -> Self {
        Self {
            email: email.to_string(),
            password: password.to_string(),
            confirm_password: confirm_password.to_string(),
        }
    }

    /// Checks length first, then the confirmation.
    pub fn validate(&self) -> Result<()> {
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::validation(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        if self.password != self.confirm_password {
            return Err(Error::validation("Passwords do not match"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    SignedIn(SessionUser),
    /// The provider wants the address confirmed before issuing a session.
    ConfirmationPending(SessionUser),
}

/// Bridges an [`AuthProvider`] to a `watch` channel of [`SessionState`].
#[derive(Clone)]
pub struct SessionBridge {
    auth: Arc<dyn AuthProvider>,
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionBridge {
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        let (state, _) = watch::channel(SessionState::initial());
        Self {
            auth,
            state: Arc::new(state),
        }
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn apply(&self, action: SessionAction) {
        self.state.send_modify(|state| {
            *state = state.clone().reduce(action);
        });
    }

    /// Probe the provider and follow its push events until the returned
    /// handle is unmounted or dropped.
    pub fn mount(&self) -> SessionMount {
        let lifecycle = Lifecycle::new();
        self.apply(SessionAction::Mounted);

        // Subscribe before probing so nothing between the two is lost.
        let events = self.auth.on_auth_state_change();
        let listener = tokio::spawn(listen(events, self.state.clone(), lifecycle.clone()));

        let auth = self.auth.clone();
        let state = self.state.clone();
        let probe_lifecycle = lifecycle.clone();
        let probe = tokio::spawn(async move {
            let user = match auth.get_session().await {
                Ok(session) => session.as_ref().map(SessionUser::from),
                Err(e) => {
                    warn!(error = %e, "session probe failed, continuing signed out");
                    None
                }
            };
            apply_unless_closed(&state, &probe_lifecycle, SessionAction::ProbeResolved(user));
        });

        SessionMount {
            lifecycle,
            tasks: vec![listener, probe],
        }
    }

    pub async fn sign_up(&self, form: &SignUpForm) -> Result<SignUpOutcome> {
        form.validate()?;
        let response = self.auth.sign_up(&form.email, &form.password).await?;
        let user = SessionUser::from(&response.user);
        match response.session {
            Some(session) => {
                let user = SessionUser::from(&session);
                info!(user_id = %user.id, "signed up");
                self.apply(SessionAction::Changed(Some(user.clone())));
                Ok(SignUpOutcome::SignedIn(user))
            }
            None => {
                info!(user_id = %user.id, "signed up, awaiting confirmation");
                Ok(SignUpOutcome::ConfirmationPending(user))
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SessionUser> {
        let session = self.auth.sign_in_with_password(email, password).await?;
        let user = SessionUser::from(&session);
        info!(user_id = %user.id, "signed in");
        self.apply(SessionAction::Changed(Some(user.clone())));
        Ok(user)
    }

    /// Clears the local user even when the provider call fails.
    pub async fn sign_out(&self) -> Result<()> {
        let result = self.auth.sign_out().await;
        self.apply(SessionAction::Changed(None));
        if let Err(e) = &result {
            warn!(error = %e, "provider sign out failed");
        }
        result
    }
}

fn apply_unless_closed(
    state: &watch::Sender<SessionState>,
    lifecycle: &Lifecycle,
    action: SessionAction,
) {
    state.send_if_modified(|current| {
        if lifecycle.is_closed() {
            return false;
        }
        let next = current.clone().reduce(action);
        let changed = next != *current;
        *current = next;
        changed
    });
}

async fn listen(
    mut events: broadcast::Receiver<solimesh_auth::AuthStateChange>,
    state: Arc<watch::Sender<SessionState>>,
    lifecycle: Lifecycle,
) {
    loop {
        let change = tokio::select! {
            _ = lifecycle.closed() => break,
            change = events.recv() => change,
        };
        match change {
            Ok(change) => {
                debug!(event = ?change.event, "auth state change");
                let user = change.session.as_ref().map(SessionUser::from);
                apply_unless_closed(&state, &lifecycle, SessionAction::Changed(user));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "auth events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// A mounted bridge. Unmount (or drop) to stop following the provider.
pub struct SessionMount {
    lifecycle: Lifecycle,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionMount {
    pub fn unmount(self) {
        drop(self);
    }

    pub fn is_mounted(&self) -> bool {
        !self.lifecycle.is_closed()
    }
}

impl Drop for SessionMount {
    fn drop(&mut self) {
        self.lifecycle.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}
