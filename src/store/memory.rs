use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::writer::{WalCommand, wal_writer_loop};
use super::{Store, StoreError, Transaction};

pub type SharedSubjectState = Arc<RwLock<SubjectState>>;

/// In-process store: per-subject state behind async RwLocks, optionally made
/// durable by a group-commit WAL.
pub struct MemoryStore {
    subjects: DashMap<Subject, SharedSubjectState>,
    /// Booking id → subject, for committed bookings.
    booking_index: Arc<DashMap<Ulid, Subject>>,
    /// Exception id → staff id.
    exception_index: DashMap<Ulid, Ulid>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Writers hold this shared for their whole lifetime; compaction takes it
    /// exclusively so the snapshot and the WAL swap see no in-flight write.
    gate: Arc<RwLock<()>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store. Nothing survives the process.
    pub fn new() -> Self {
        Self {
            subjects: DashMap::new(),
            booking_index: Arc::new(DashMap::new()),
            exception_index: DashMap::new(),
            wal_tx: None,
            gate: Arc::new(RwLock::new(())),
        }
    }

    /// Durable store backed by the WAL at `path`. Replays existing records and
    /// spawns the group-commit writer, so this must run inside a tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let records = Wal::replay(path).map_err(|e| StoreError::Wal(e.to_string()))?;
        let wal = Wal::open(path).map_err(|e| StoreError::Wal(e.to_string()))?;

        let mut store = Self::new();
        let mut states: HashMap<Subject, SubjectState> = HashMap::new();
        let record_count = records.len();
        for event in records.into_iter().flatten() {
            store.apply_replayed(&mut states, event);
        }
        for (subject, state) in states {
            store.subjects.insert(subject, Arc::new(RwLock::new(state)));
        }
        info!(
            path = %path.display(),
            records = record_count,
            bookings = store.booking_index.len(),
            exceptions = store.exception_index.len(),
            "replayed WAL"
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        store.wal_tx = Some(wal_tx);
        Ok(store)
    }

    fn apply_replayed(&self, states: &mut HashMap<Subject, SubjectState>, event: Event) {
        match event {
            Event::BookingWritten(booking) => {
                self.booking_index.insert(booking.id, booking.subject);
                states.entry(booking.subject).or_default().upsert_booking(booking);
            }
            Event::ExceptionWritten(exception) => {
                self.exception_index.insert(exception.id, exception.staff_id);
                states
                    .entry(Subject::Staff(exception.staff_id))
                    .or_default()
                    .upsert_exception(exception);
            }
            Event::WorkingHoursSet { staff_id, hours } => {
                states.entry(Subject::Staff(staff_id)).or_default().hours = hours;
            }
        }
    }

    pub fn is_durable(&self) -> bool {
        self.wal_tx.is_some()
    }

    /// State for `subject`, created empty on first use.
    fn state(&self, subject: Subject) -> SharedSubjectState {
        self.subjects.entry(subject).or_default().clone()
    }

    fn existing(&self, subject: Subject) -> Option<SharedSubjectState> {
        self.subjects.get(&subject).map(|e| e.value().clone())
    }

    /// Every subject's state, in subject order.
    fn all_states(&self) -> Vec<(Subject, SharedSubjectState)> {
        let mut all: Vec<_> = self
            .subjects
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(s, _)| *s);
        all
    }

    fn exception_owner(&self, id: Ulid) -> Result<Ulid, StoreError> {
        self.exception_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))
    }

    async fn wal_append(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let Some(tx) = &self.wal_tx else {
            return Ok(());
        };
        let rx = send_record(tx, events).await?;
        await_record(rx).await
    }

    /// Rewrite the WAL as one snapshot record per subject.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(tx) = &self.wal_tx else {
            return Ok(());
        };
        let _exclusive = self.gate.write().await;

        let mut records = Vec::new();
        for (subject, state) in self.all_states() {
            let guard = state.read().await;
            let events = guard.snapshot(subject);
            if !events.is_empty() {
                records.push(events);
            }
        }

        let (response, rx) = oneshot::channel();
        let record_count = records.len();
        tx.send(WalCommand::Compact { records, response })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        info!(records = record_count, "compacted WAL");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(tx) = &self.wal_tx else {
            return 0;
        };
        let (response, rx) = oneshot::channel();
        if tx.send(WalCommand::AppendsSinceCompact { response }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn send_record(
    tx: &mpsc::Sender<WalCommand>,
    events: Vec<Event>,
) -> Result<oneshot::Receiver<std::io::Result<()>>, StoreError> {
    let (response, rx) = oneshot::channel();
    tx.send(WalCommand::Append { events, response })
        .await
        .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
    Ok(rx)
}

async fn await_record(rx: oneshot::Receiver<std::io::Result<()>>) -> Result<(), StoreError> {
    rx.await
        .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
        .map_err(|e| StoreError::Wal(e.to_string()))
}

fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, subjects: &[Subject]) -> Result<Box<dyn Transaction>, StoreError> {
        let gate = self.gate.clone().read_owned().await;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut sorted = subjects.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = BTreeMap::new();
        for subject in sorted {
            let guard = self.state(subject).write_owned().await;
            guards.insert(subject, guard);
        }

        Ok(Box::new(MemoryTransaction {
            guards,
            undo: Vec::new(),
            events: Vec::new(),
            booking_index: self.booking_index.clone(),
            wal_tx: self.wal_tx.clone(),
            state: TxState::Open,
            _gate: gate,
        }))
    }

    async fn get_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        let subject = self
            .booking_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let state = self.existing(subject).ok_or(StoreError::NotFound(id))?;
        let guard = state.read().await;
        guard.booking(id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn query_bookings(
        &self,
        subject: Subject,
        span: Span,
        active_only: bool,
    ) -> Result<Vec<Booking>, StoreError> {
        let Some(state) = self.existing(subject) else {
            return Ok(Vec::new());
        };
        let guard = state.read().await;
        Ok(guard
            .overlapping(&span)
            .filter(|b| !active_only || b.is_active())
            .cloned()
            .collect())
    }

    async fn list_bookings(&self, query: &BookingQuery) -> Result<Vec<Booking>, StoreError> {
        let states = match query.scope {
            BookingScope::Staff(id) => self
                .existing(Subject::Staff(id))
                .map(|s| vec![(Subject::Staff(id), s)])
                .unwrap_or_default(),
            BookingScope::Resource(id) => self
                .existing(Subject::Resource(id))
                .map(|s| vec![(Subject::Resource(id), s)])
                .unwrap_or_default(),
            BookingScope::Business(_) | BookingScope::Client(_) => self.all_states(),
        };

        let mut found = Vec::new();
        for (_, state) in states {
            let guard = state.read().await;
            found.extend(
                guard
                    .overlapping(&query.span)
                    .filter(|b| query.include_deleted || !b.deleted)
                    .filter(|b| match query.scope {
                        BookingScope::Business(id) => b.business_id == id,
                        BookingScope::Client(id) => b.client_id == Some(id),
                        BookingScope::Staff(_) | BookingScope::Resource(_) => true,
                    })
                    .cloned(),
            );
        }
        found.sort_by_key(|b| (b.span.start, b.id));
        Ok(paginate(found, query.offset, query.limit))
    }

    async fn insert_exception(&self, exception: AvailabilityException) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let state = self.state(Subject::Staff(exception.staff_id));
        let mut guard = state.write().await;
        if self.exception_index.contains_key(&exception.id) {
            return Err(StoreError::AlreadyExists(exception.id));
        }
        self.wal_append(vec![Event::ExceptionWritten(exception.clone())]).await?;
        self.exception_index.insert(exception.id, exception.staff_id);
        guard.upsert_exception(exception);
        Ok(())
    }

    async fn get_exception(&self, id: Ulid) -> Result<AvailabilityException, StoreError> {
        let staff_id = self.exception_owner(id)?;
        let state = self
            .existing(Subject::Staff(staff_id))
            .ok_or(StoreError::NotFound(id))?;
        let guard = state.read().await;
        guard.exception(id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn replace_exception(&self, exception: AvailabilityException) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let staff_id = self.exception_owner(exception.id)?;
        if staff_id != exception.staff_id {
            return Err(StoreError::NotFound(exception.id));
        }
        let state = self.state(Subject::Staff(staff_id));
        let mut guard = state.write().await;
        if guard.exception(exception.id).is_none() {
            return Err(StoreError::NotFound(exception.id));
        }
        self.wal_append(vec![Event::ExceptionWritten(exception.clone())]).await?;
        guard.upsert_exception(exception);
        Ok(())
    }

    async fn soft_delete_exception(
        &self,
        id: Ulid,
        actor: Option<Ulid>,
        at: Ms,
    ) -> Result<AvailabilityException, StoreError> {
        let _shared = self.gate.read().await;
        let staff_id = self.exception_owner(id)?;
        let state = self.state(Subject::Staff(staff_id));
        let mut guard = state.write().await;
        let mut exception = guard.exception(id).cloned().ok_or(StoreError::NotFound(id))?;
        exception.deleted = true;
        exception.audit.tombstone(actor, at);
        self.wal_append(vec![Event::ExceptionWritten(exception.clone())]).await?;
        guard.upsert_exception(exception.clone());
        Ok(exception)
    }

    async fn query_exceptions(
        &self,
        staff_id: Ulid,
        span: Span,
        active_only: bool,
    ) -> Result<Vec<AvailabilityException>, StoreError> {
        let Some(state) = self.existing(Subject::Staff(staff_id)) else {
            return Ok(Vec::new());
        };
        let guard = state.read().await;
        Ok(guard
            .exceptions_for(&span)
            .filter(|e| !active_only || e.is_active())
            .cloned()
            .collect())
    }

    async fn list_exceptions(&self, query: &ExceptionQuery) -> Result<Vec<AvailabilityException>, StoreError> {
        let states = match query.scope {
            ExceptionScope::Staff(id) => self
                .existing(Subject::Staff(id))
                .map(|s| vec![(Subject::Staff(id), s)])
                .unwrap_or_default(),
            ExceptionScope::Business(_) => self
                .all_states()
                .into_iter()
                .filter(|(subject, _)| subject.is_staff())
                .collect(),
        };

        let mut found = Vec::new();
        for (_, state) in states {
            let guard = state.read().await;
            found.extend(
                guard
                    .exceptions_for(&query.span)
                    .filter(|e| query.include_deleted || !e.deleted)
                    .filter(|e| match query.scope {
                        ExceptionScope::Business(id) => e.business_id == id,
                        ExceptionScope::Staff(_) => true,
                    })
                    .cloned(),
            );
        }
        found.sort_by_key(|e| (e.span.start, e.id));
        Ok(paginate(found, query.offset, query.limit))
    }

    async fn working_hours(&self, staff_id: Ulid) -> Result<Option<WeeklyHours>, StoreError> {
        let Some(state) = self.existing(Subject::Staff(staff_id)) else {
            return Ok(None);
        };
        let guard = state.read().await;
        Ok(guard.hours.clone())
    }

    async fn set_working_hours(&self, staff_id: Ulid, hours: Option<WeeklyHours>) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let state = self.state(Subject::Staff(staff_id));
        let mut guard = state.write().await;
        self.wal_append(vec![Event::WorkingHoursSet {
            staff_id,
            hours: hours.clone(),
        }])
        .await?;
        guard.hours = hours;
        Ok(())
    }
}

// ── Transactions ─────────────────────────────────────────────────

enum Undo {
    Inserted { subject: Subject, id: Ulid },
    Replaced { previous: Booking },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    /// WAL record handed to the writer; the changes are kept even if the
    /// caller stops waiting for the fsync.
    Sealed,
    Finished,
}

/// Transaction over a sorted set of subject write locks.
pub struct MemoryTransaction {
    guards: BTreeMap<Subject, OwnedRwLockWriteGuard<SubjectState>>,
    undo: Vec<Undo>,
    events: Vec<Event>,
    booking_index: Arc<DashMap<Ulid, Subject>>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    state: TxState,
    _gate: OwnedRwLockReadGuard<()>,
}

impl MemoryTransaction {
    fn locked(&mut self, subject: Subject) -> Result<&mut SubjectState, StoreError> {
        self.guards
            .get_mut(&subject)
            .map(|g| &mut **g)
            .ok_or(StoreError::NotLocked(subject))
    }

    fn find(&self, id: Ulid) -> Result<&Booking, StoreError> {
        if let Some(b) = self.guards.values().find_map(|g| g.booking(id)) {
            return Ok(b);
        }
        match self.booking_index.get(&id).map(|e| *e.value()) {
            Some(subject) => Err(StoreError::NotLocked(subject)),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Write `updated` over its current version, enforcing the exclusion constraint.
    fn replace(&mut self, updated: Booking) -> Result<Booking, StoreError> {
        if Span::checked(updated.span.start, updated.span.end).is_none() {
            return Err(StoreError::Invalid(format!("empty span {}", updated.span)));
        }
        let state = self.locked(updated.subject)?;
        if updated.is_active()
            && let Some(other) = state
                .overlapping(&updated.span)
                .find(|b| b.id != updated.id && b.is_active())
        {
            return Err(StoreError::ExclusionViolation(other.id));
        }
        let previous = state
            .upsert_booking(updated.clone())
            .ok_or(StoreError::NotFound(updated.id))?;
        self.undo.push(Undo::Replaced { previous });
        self.events.push(Event::BookingWritten(updated.clone()));
        Ok(updated)
    }

    fn undo_all(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Inserted { subject, id } => {
                    if let Some(g) = self.guards.get_mut(&subject) {
                        g.remove_booking(id);
                    }
                }
                Undo::Replaced { previous } => {
                    if let Some(g) = self.guards.get_mut(&previous.subject) {
                        g.upsert_booking(previous);
                    }
                }
            }
        }
        self.events.clear();
    }

    fn publish_inserts(&mut self) {
        for step in self.undo.drain(..) {
            if let Undo::Inserted { subject, id } = step {
                self.booking_index.insert(id, subject);
            }
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, id: Ulid) -> Result<Booking, StoreError> {
        self.find(id).cloned()
    }

    async fn query_overlapping(
        &mut self,
        subject: Subject,
        span: Span,
        active_only: bool,
    ) -> Result<Vec<Booking>, StoreError> {
        let state = self.locked(subject)?;
        Ok(state
            .overlapping(&span)
            .filter(|b| !active_only || b.is_active())
            .cloned()
            .collect())
    }

    async fn exceptions(&mut self, staff_id: Ulid, span: Span) -> Result<Vec<AvailabilityException>, StoreError> {
        let state = self.locked(Subject::Staff(staff_id))?;
        Ok(state
            .exceptions_for(&span)
            .filter(|e| e.is_active())
            .cloned()
            .collect())
    }

    async fn working_hours(&mut self, staff_id: Ulid) -> Result<Option<WeeklyHours>, StoreError> {
        Ok(self.locked(Subject::Staff(staff_id))?.hours.clone())
    }

    async fn insert(&mut self, booking: Booking) -> Result<(), StoreError> {
        if Span::checked(booking.span.start, booking.span.end).is_none() {
            return Err(StoreError::Invalid(format!("empty span {}", booking.span)));
        }
        let id_taken = self.booking_index.contains_key(&booking.id)
            || self.guards.values().any(|g| g.booking(booking.id).is_some());
        if id_taken {
            return Err(StoreError::AlreadyExists(booking.id));
        }
        let subject = booking.subject;
        let state = self.locked(subject)?;
        if booking.is_active()
            && let Some(other) = state.overlapping(&booking.span).find(|b| b.is_active())
        {
            return Err(StoreError::ExclusionViolation(other.id));
        }
        state.insert_booking(booking.clone());
        self.undo.push(Undo::Inserted { subject, id: booking.id });
        self.events.push(Event::BookingWritten(booking));
        Ok(())
    }

    async fn update_fields(
        &mut self,
        id: Ulid,
        changes: &BookingChanges,
        actor: Option<Ulid>,
        at: Ms,
    ) -> Result<Booking, StoreError> {
        let mut updated = self.find(id)?.clone();
        updated.apply(changes);
        updated.audit.touch(actor, at);
        self.replace(updated)
    }

    async fn soft_delete(&mut self, id: Ulid, actor: Option<Ulid>, at: Ms) -> Result<Booking, StoreError> {
        let mut updated = self.find(id)?.clone();
        updated.deleted = true;
        updated.audit.tombstone(actor, at);
        self.replace(updated)
    }

    async fn commit(&mut self) -> Result<Vec<Event>, StoreError> {
        if self.state != TxState::Open {
            return Ok(Vec::new());
        }
        if self.events.is_empty() {
            self.state = TxState::Finished;
            return Ok(Vec::new());
        }

        if let Some(tx) = self.wal_tx.clone() {
            let rx = match send_record(&tx, self.events.clone()).await {
                Ok(rx) => rx,
                Err(e) => {
                    self.rollback().await;
                    return Err(e);
                }
            };
            self.state = TxState::Sealed;
            if let Err(e) = await_record(rx).await {
                // The writer reported failure: the record is not durable.
                self.state = TxState::Open;
                self.rollback().await;
                return Err(e);
            }
        }

        self.publish_inserts();
        self.state = TxState::Finished;
        Ok(std::mem::take(&mut self.events))
    }

    async fn rollback(&mut self) {
        if self.state == TxState::Open {
            self.undo_all();
        }
        self.state = TxState::Finished;
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        match self.state {
            TxState::Open if !self.undo.is_empty() => {
                debug!(steps = self.undo.len(), "rolling back uncommitted transaction");
                self.undo_all();
            }
            TxState::Sealed => self.publish_inserts(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};
    use std::path::PathBuf;

    const H: Ms = 3_600_000;
    const BASE: Ms = 1_767_225_600_000; // 2026-01-01T00:00:00Z

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotguard_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn booking(subject: Subject, start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            business_id: Ulid::nil(),
            subject,
            client_id: None,
            service_id: None,
            appointment_id: None,
            span: Span::new(start, end),
            status: BookingStatus::Scheduled,
            notes: None,
            deleted: false,
            audit: AuditInfo::created(None, 0),
        }
    }

    fn exception(staff_id: Ulid, start: Ms, end: Ms) -> AvailabilityException {
        AvailabilityException {
            id: Ulid::new(),
            business_id: Ulid::nil(),
            staff_id,
            kind: ExceptionKind::TimeOff,
            span: Span::new(start, end),
            is_full_day: false,
            recurrence: None,
            notes: None,
            deleted: false,
            audit: AuditInfo::created(None, 0),
        }
    }

    async fn commit_one(store: &MemoryStore, b: Booking) -> Result<(), StoreError> {
        let mut tx = store.begin(&[b.subject]).await?;
        tx.insert(b).await?;
        tx.commit().await.map(|_| ())
    }

    #[tokio::test]
    async fn insert_commit_and_get() {
        let store = MemoryStore::new();
        let staff = Subject::Staff(Ulid::new());
        let b = booking(staff, BASE, BASE + H);

        let mut tx = store.begin(&[staff]).await.unwrap();
        tx.insert(b.clone()).await.unwrap();
        let events = tx.commit().await.unwrap();
        assert_eq!(events, vec![Event::BookingWritten(b.clone())]);

        assert_eq!(store.get_booking(b.id).await.unwrap(), b);
        let found = store
            .query_bookings(staff, Span::new(BASE, BASE + 2 * H), true)
            .await
            .unwrap();
        assert_eq!(found, vec![b]);
    }

    #[tokio::test]
    async fn exclusion_rejects_overlap_without_engine_checks() {
        let store = MemoryStore::new();
        let room = Subject::Resource(Ulid::new());
        let first = booking(room, BASE, BASE + H);
        commit_one(&store, first.clone()).await.unwrap();

        let err = commit_one(&store, booking(room, BASE + H / 2, BASE + 2 * H))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::ExclusionViolation(first.id));

        // Back-to-back is fine
        commit_one(&store, booking(room, BASE + H, BASE + 2 * H)).await.unwrap();
    }

    #[tokio::test]
    async fn inactive_bookings_do_not_hold_time() {
        let store = MemoryStore::new();
        let staff = Subject::Staff(Ulid::new());
        let mut cancelled = booking(staff, BASE, BASE + H);
        cancelled.status = BookingStatus::Cancelled;
        commit_one(&store, cancelled).await.unwrap();
        commit_one(&store, booking(staff, BASE, BASE + H)).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let staff = Subject::Staff(Ulid::new());
        let b = booking(staff, BASE, BASE + H);
        {
            let mut tx = store.begin(&[staff]).await.unwrap();
            tx.insert(b.clone()).await.unwrap();
            // dropped without commit
        }
        assert_eq!(store.get_booking(b.id).await, Err(StoreError::NotFound(b.id)));
        assert!(
            store
                .query_bookings(staff, Span::new(BASE, BASE + H), false)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn rollback_restores_updated_booking() {
        let store = MemoryStore::new();
        let staff = Subject::Staff(Ulid::new());
        let b = booking(staff, BASE, BASE + H);
        commit_one(&store, b.clone()).await.unwrap();

        let mut tx = store.begin(&[staff]).await.unwrap();
        let moved = tx
            .update_fields(b.id, &BookingChanges::reschedule(BASE + 3 * H, BASE + 4 * H), None, 1)
            .await
            .unwrap();
        assert_eq!(moved.span, Span::new(BASE + 3 * H, BASE + 4 * H));
        tx.rollback().await;
        drop(tx);

        assert_eq!(store.get_booking(b.id).await.unwrap(), b);
    }

    #[tokio::test]
    async fn update_does_not_collide_with_itself() {
        let store = MemoryStore::new();
        let staff = Subject::Staff(Ulid::new());
        let b = booking(staff, BASE, BASE + 2 * H);
        commit_one(&store, b.clone()).await.unwrap();

        let mut tx = store.begin(&[staff]).await.unwrap();
        let updated = tx
            .update_fields(b.id, &BookingChanges::reschedule(BASE + H, BASE + 3 * H), None, 1)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.get_booking(b.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn soft_delete_frees_the_slot() {
        let store = MemoryStore::new();
        let staff = Subject::Staff(Ulid::new());
        let b = booking(staff, BASE, BASE + H);
        commit_one(&store, b.clone()).await.unwrap();

        let actor = Ulid::new();
        let mut tx = store.begin(&[staff]).await.unwrap();
        let deleted = tx.soft_delete(b.id, Some(actor), 7).await.unwrap();
        tx.commit().await.unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.audit.deleted_by, Some(actor));

        commit_one(&store, booking(staff, BASE, BASE + H)).await.unwrap();
        // Still retrievable by id
        assert!(store.get_booking(b.id).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn access_outside_locked_subjects_is_refused() {
        let store = MemoryStore::new();
        let a = Subject::Staff(Ulid::new());
        let b = Subject::Staff(Ulid::new());
        let existing = booking(b, BASE, BASE + H);
        commit_one(&store, existing.clone()).await.unwrap();

        let mut tx = store.begin(&[a]).await.unwrap();
        assert_eq!(
            tx.insert(booking(b, BASE + 2 * H, BASE + 3 * H)).await,
            Err(StoreError::NotLocked(b))
        );
        assert_eq!(tx.get(existing.id).await, Err(StoreError::NotLocked(b)));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = MemoryStore::new();
        let staff = Subject::Staff(Ulid::new());
        let b = booking(staff, BASE, BASE + H);
        commit_one(&store, b.clone()).await.unwrap();

        let mut again = b.clone();
        again.span = Span::new(BASE + 5 * H, BASE + 6 * H);
        assert_eq!(commit_one(&store, again).await, Err(StoreError::AlreadyExists(b.id)));
    }

    #[tokio::test]
    async fn list_orders_filters_and_pages() {
        let store = MemoryStore::new();
        let business = Ulid::new();
        let client = Ulid::new();
        let staff = Subject::Staff(Ulid::new());
        let room = Subject::Resource(Ulid::new());

        let mut expected = Vec::new();
        for (i, subject) in [staff, room, staff, room].into_iter().enumerate() {
            let start = BASE + (i as Ms) * H;
            let mut b = booking(subject, start, start + H);
            b.business_id = business;
            b.client_id = Some(client);
            commit_one(&store, b.clone()).await.unwrap();
            expected.push(b);
        }
        // Another business, same time
        commit_one(&store, booking(Subject::Staff(Ulid::new()), BASE, BASE + H))
            .await
            .unwrap();

        let mut query = BookingQuery {
            scope: BookingScope::Business(business),
            span: Span::new(BASE, BASE + 24 * H),
            include_deleted: false,
            offset: 0,
            limit: 10,
        };
        assert_eq!(store.list_bookings(&query).await.unwrap(), expected);

        query.offset = 1;
        query.limit = 2;
        assert_eq!(store.list_bookings(&query).await.unwrap(), expected[1..3].to_vec());

        query.scope = BookingScope::Client(client);
        query.offset = 0;
        query.limit = 10;
        assert_eq!(store.list_bookings(&query).await.unwrap().len(), 4);

        query.scope = BookingScope::Resource(room.id());
        let rooms = store.list_bookings(&query).await.unwrap();
        assert_eq!(rooms, vec![expected[1].clone(), expected[3].clone()]);
    }

    #[tokio::test]
    async fn exceptions_and_hours_roundtrip() {
        let store = MemoryStore::new();
        let staff_id = Ulid::new();
        let exc = exception(staff_id, BASE, BASE + H);
        store.insert_exception(exc.clone()).await.unwrap();
        assert_eq!(
            store.insert_exception(exc.clone()).await,
            Err(StoreError::AlreadyExists(exc.id))
        );
        assert_eq!(store.get_exception(exc.id).await.unwrap(), exc);

        let window = Span::new(BASE - H, BASE + 2 * H);
        assert_eq!(store.query_exceptions(staff_id, window, true).await.unwrap().len(), 1);

        let deleted = store.soft_delete_exception(exc.id, None, 5).await.unwrap();
        assert!(deleted.deleted);
        assert!(store.query_exceptions(staff_id, window, true).await.unwrap().is_empty());
        assert_eq!(store.query_exceptions(staff_id, window, false).await.unwrap().len(), 1);

        let hours = WeeklyHours::uniform(
            &[Weekday::Tue],
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        );
        store.set_working_hours(staff_id, Some(hours.clone())).await.unwrap();
        assert_eq!(store.working_hours(staff_id).await.unwrap(), Some(hours));
        assert_eq!(store.working_hours(Ulid::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn durable_store_replays_after_reopen() {
        let path = test_wal_path("reopen.wal");
        let staff_id = Ulid::new();
        let staff = Subject::Staff(staff_id);
        let b = booking(staff, BASE, BASE + H);
        let exc = exception(staff_id, BASE + 2 * H, BASE + 3 * H);
        let hours = WeeklyHours::uniform(
            &[Weekday::Mon],
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        );

        {
            let store = MemoryStore::open(&path).unwrap();
            assert!(store.is_durable());
            commit_one(&store, b.clone()).await.unwrap();
            store.insert_exception(exc.clone()).await.unwrap();
            store.set_working_hours(staff_id, Some(hours.clone())).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 3);
        }

        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.get_booking(b.id).await.unwrap(), b);
        assert_eq!(store.get_exception(exc.id).await.unwrap(), exc);
        assert_eq!(store.working_hours(staff_id).await.unwrap(), Some(hours));

        // Exclusion still holds against replayed state
        assert_eq!(
            commit_one(&store, booking(staff, BASE, BASE + H)).await,
            Err(StoreError::ExclusionViolation(b.id))
        );
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compact.wal");
        let room = Subject::Resource(Ulid::new());
        let keep = booking(room, BASE, BASE + H);

        {
            let store = MemoryStore::open(&path).unwrap();
            commit_one(&store, keep.clone()).await.unwrap();
            // Churn: book and cancel the same hour repeatedly
            for _ in 0..10 {
                let b = booking(room, BASE + 2 * H, BASE + 3 * H);
                commit_one(&store, b.clone()).await.unwrap();
                let mut tx = store.begin(&[room]).await.unwrap();
                tx.update_fields(b.id, &BookingChanges::status(BookingStatus::Cancelled), None, 1)
                    .await
                    .unwrap();
                tx.commit().await.unwrap();
            }
            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        }

        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.get_booking(keep.id).await.unwrap(), keep);
        let all = store
            .query_bookings(room, Span::new(BASE, BASE + 4 * H), false)
            .await
            .unwrap();
        assert_eq!(all.len(), 11);
        assert_eq!(all.iter().filter(|b| b.is_active()).count(), 1);
    }
}
