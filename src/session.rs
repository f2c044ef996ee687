use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::coordinator::state::{Activity, AnalysisState};
use crate::location::LocationStatus;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("an image id is required before analyzing")]
    MissingImageId,

    #[error("an analysis is already running for this session")]
    Busy,
}

/// Work order for one background location lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationTicket {
    pub image_id: String,
    pub generation: u64,
}

/// Everything an analysis cycle needs, captured when it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleTicket {
    pub cycle_id: Uuid,
    pub image_id: String,
    pub location: Option<String>,
}

struct SessionInner {
    image_id: String,
    location: LocationStatus,
    location_generation: u64,
    state: AnalysisState,
    last_seen: Instant,
}

/// One user's analysis context: selected image, its location and the state
/// of the current or last analysis cycle.
pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    activity: watch::Sender<Activity>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub image_id: String,
    pub location: LocationStatus,
    pub location_text: String,
    pub state: AnalysisState,
    pub result: Option<String>,
    pub activity: Activity,
    pub busy: bool,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self::with_location(image_id, LocationStatus::Pending)
    }

    pub fn with_location(image_id: impl Into<String>, location: LocationStatus) -> Self {
        let (activity, _) = watch::channel(Activity::default());
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                image_id: image_id.into().trim().to_string(),
                location,
                location_generation: 0,
                state: AnalysisState::Idle,
                last_seen: Instant::now(),
            }),
            activity,
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn image_id(&self) -> String {
        self.inner().image_id.clone()
    }

    pub fn location(&self) -> LocationStatus {
        self.inner().location.clone()
    }

    pub fn state(&self) -> AnalysisState {
        self.inner().state.clone()
    }

    pub fn activity(&self) -> Activity {
        *self.activity.borrow()
    }

    pub fn subscribe_activity(&self) -> watch::Receiver<Activity> {
        self.activity.subscribe()
    }

    pub(crate) fn activity_sender(&self) -> &watch::Sender<Activity> {
        &self.activity
    }

    pub(crate) fn touch(&self) {
        self.inner().last_seen = Instant::now();
    }

    /// Time since the session was created or last looked up in a store.
    pub fn idle_for(&self) -> Duration {
        self.inner().last_seen.elapsed()
    }

    pub fn is_busy(&self) -> bool {
        self.inner().state.is_in_flight()
    }

    /// Switches to a new image and invalidates the location. Returns the
    /// lookup to run, or `None` when the new id is blank.
    pub fn select_image(&self, image_id: &str) -> Result<Option<LocationTicket>, SessionError> {
        let mut inner = self.inner();
        if inner.state.is_in_flight() {
            return Err(SessionError::Busy);
        }

        inner.image_id = image_id.trim().to_string();
        inner.location = LocationStatus::Pending;
        inner.location_generation += 1;

        if inner.image_id.is_empty() {
            return Ok(None);
        }

        Ok(Some(LocationTicket {
            image_id: inner.image_id.clone(),
            generation: inner.location_generation,
        }))
    }

    /// Lookup for the current image without changing it.
    pub fn location_ticket(&self) -> Option<LocationTicket> {
        let inner = self.inner();
        if inner.image_id.is_empty() {
            return None;
        }
        Some(LocationTicket {
            image_id: inner.image_id.clone(),
            generation: inner.location_generation,
        })
    }

    /// Stores a lookup result if it still belongs to the current image.
    pub fn apply_location(&self, generation: u64, status: LocationStatus) -> bool {
        let mut inner = self.inner();
        if inner.location_generation != generation {
            return false;
        }
        inner.location = status;
        true
    }

    /// Validates the trigger and moves to `Dispatched` atomically. On error
    /// nothing is touched.
    pub(crate) fn begin_cycle(&self) -> Result<CycleTicket, SessionError> {
        let mut inner = self.inner();

        if inner.image_id.trim().is_empty() {
            return Err(SessionError::MissingImageId);
        }
        if inner.state.is_in_flight() {
            return Err(SessionError::Busy);
        }

        let cycle_id = Uuid::new_v4();
        inner.state = AnalysisState::Dispatched { cycle_id };

        Ok(CycleTicket {
            cycle_id,
            image_id: inner.image_id.clone(),
            location: inner.location.descriptor().map(str::to_string),
        })
    }

    /// Moves an in-flight cycle to `next`. Ignored once the cycle has settled
    /// or been replaced.
    pub(crate) fn advance(&self, cycle_id: Uuid, next: AnalysisState) -> bool {
        let mut inner = self.inner();
        if !inner.state.is_in_flight() || inner.state.cycle_id() != Some(cycle_id) {
            return false;
        }
        inner.state = next;
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner();
        SessionSnapshot {
            id: self.id,
            image_id: inner.image_id.clone(),
            location_text: inner.location.display_text().to_string(),
            location: inner.location.clone(),
            result: inner.state.result_text(),
            busy: inner.state.is_in_flight(),
            state: inner.state.clone(),
            activity: *self.activity.borrow(),
            created_at: self.created_at,
        }
    }
}

/// In-memory registry of live sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, image_id: impl Into<String>) -> Arc<Session> {
        let session = Arc::new(Session::new(image_id));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id(), session.clone());
        session
    }

    /// Looks a session up and marks it as seen.
    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()?;
        session.touch();
        Some(session)
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops sessions idle for longer than `ttl`. A session with a cycle in
    /// flight is kept until that cycle settles.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| session.is_busy() || session.idle_for() <= ttl);
        before - sessions.len()
    }

    /// Runs [`SessionStore::evict_idle`] every `every` until the runtime shuts down.
    pub fn spawn_sweeper(self: Arc<Self>, ttl: Duration, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let evicted = self.evict_idle(ttl);
                if evicted > 0 {
                    tracing::info!(evicted, remaining = self.len(), "Evicted idle sessions");
                }
            }
        })
    }
}
