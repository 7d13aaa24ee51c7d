mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{free_spans, merge_overlapping, subtract_intervals, utilization_pct};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::auth::Principal;
use crate::limits;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// When set, self-service bookings start `pending` until an admin
    /// confirms them. Admin bookings are always `confirmed`.
    pub require_approval: bool,
    /// Fixed UTC offset in minutes defining the portal's local day.
    pub tz_offset_min: i32,
    /// Email provisioned as an active admin on first login.
    pub bootstrap_admin: Option<String>,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub resources: DashMap<Ulid, SharedResourceState>,
    pub(super) members: DashMap<Ulid, Member>,
    /// Lowercased email → member id, the login identity index.
    pub(super) email_index: DashMap<String, Ulid>,
    /// Reverse lookup: booking id → resource id.
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held across first-login provisioning so one email maps to one member.
    provision_lock: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
}

/// Apply a booking-level event directly to a ResourceState (no locking —
/// the caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            resource_id,
            booking,
        } => {
            rs.insert_booking(booking.clone());
            booking_index.insert(booking.id, *resource_id);
        }
        Event::BookingRescheduled { id, span, at, .. } => {
            if let Some(mut booking) = rs.remove_booking(*id) {
                booking.span = *span;
                booking.updated_at = *at;
                rs.insert_booking(booking);
            }
        }
        Event::BookingStatusChanged { id, status, at, .. } => {
            if let Some(booking) = rs.booking_mut(*id) {
                booking.status = *status;
                booking.updated_at = *at;
            }
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            booking_index.remove(id);
        }
        Event::ResourceUpdated { resource } => {
            rs.apply_desc(resource);
        }
        // Member and resource create/delete are handled at the DashMap level
        _ => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            members: DashMap::new(),
            email_index: DashMap::new(),
            booking_index: DashMap::new(),
            wal_tx,
            provision_lock: Mutex::new(()),
            notify,
            config,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this runs inside an async context.
        for event in &events {
            match event {
                Event::MemberCreated { member } | Event::MemberUpdated { member } => {
                    engine
                        .email_index
                        .insert(member.email.to_lowercase(), member.id);
                    engine.members.insert(member.id, member.clone());
                }
                Event::MemberDeleted { id } => {
                    if let Some((_, member)) = engine.members.remove(id) {
                        engine.email_index.remove(&member.email.to_lowercase());
                    }
                }
                Event::ResourceCreated { resource } => {
                    let rs = ResourceState::new(resource.clone());
                    engine
                        .resources
                        .insert(resource.id, Arc::new(RwLock::new(rs)));
                }
                Event::ResourceDeleted { id } => {
                    if let Some((_, arc)) = engine.resources.remove(id) {
                        let rs = arc.try_read().expect("replay: uncontended read");
                        for booking in &rs.bookings {
                            engine.booking_index.remove(&booking.id);
                        }
                    }
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = engine.resources.get(&resource_id)
                    {
                        let rs_arc = entry.clone();
                        let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                        apply_to_resource(&mut guard, other, &engine.booking_index);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn resource_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    pub fn member(&self, id: &Ulid) -> Option<Member> {
        self.members.get(id).map(|e| e.value().clone())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        resource_id: Ulid,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.booking_index);
        self.notify.send(resource_id, event);
        Ok(())
    }

    /// Member events don't live under a resource lock; persist and update
    /// the member maps directly.
    pub(super) async fn persist_member_event(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        match event {
            Event::MemberCreated { member } | Event::MemberUpdated { member } => {
                self.email_index
                    .insert(member.email.to_lowercase(), member.id);
                self.members.insert(member.id, member.clone());
            }
            Event::MemberDeleted { id } => {
                if let Some((_, member)) = self.members.remove(id) {
                    self.email_index.remove(&member.email.to_lowercase());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Lookup booking → resource, get resource, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .resource_of_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }

    /// Resolve a login email to a portal identity, provisioning unknown
    /// emails on first sight. The configured bootstrap admin comes up
    /// active/admin; everyone else starts pending until an admin activates
    /// them.
    pub async fn authenticate(&self, email: &str) -> Result<Principal, EngineError> {
        let email = email.trim();
        if email.is_empty() || email.len() > limits::MAX_EMAIL_LEN || !email.contains('@') {
            return Err(EngineError::Validation("login user must be an email"));
        }
        let key = email.to_lowercase();
        if let Some(principal) = self.principal_for(&key) {
            return Ok(principal);
        }

        // First sight. Serialize provisioning and re-check under the lock,
        // so two concurrent first logins cannot both miss the index and
        // create two members sharing one email.
        let _guard = self.provision_lock.lock().await;
        if let Some(principal) = self.principal_for(&key) {
            return Ok(principal);
        }

        let is_bootstrap = self
            .config
            .bootstrap_admin
            .as_deref()
            .is_some_and(|admin| admin.eq_ignore_ascii_case(email));
        let now = conflict::now_ms();
        let member = Member {
            id: Ulid::new(),
            name: email.split('@').next().unwrap_or(email).to_string(),
            email: email.to_string(),
            company: None,
            department: None,
            phone: None,
            status: if is_bootstrap {
                MemberStatus::Active
            } else {
                MemberStatus::Pending
            },
            role: if is_bootstrap {
                MemberRole::Admin
            } else {
                MemberRole::Member
            },
            joined_at: now,
            updated_at: now,
        };
        let principal = Principal {
            member_id: member.id,
            email: member.email.clone(),
            role: member.role,
            status: member.status,
        };
        self.persist_member_event(&Event::MemberCreated { member })
            .await?;
        Ok(principal)
    }

    fn principal_for(&self, key: &str) -> Option<Principal> {
        let id = *self.email_index.get(key)?.value();
        let member = self.member(&id)?;
        Some(Principal {
            member_id: member.id,
            email: member.email,
            role: member.role,
            status: member.status,
        })
    }
}

/// Extract the resource_id from a booking-level event.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { resource_id, .. }
        | Event::BookingRescheduled { resource_id, .. }
        | Event::BookingStatusChanged { resource_id, .. }
        | Event::BookingDeleted { resource_id, .. } => Some(*resource_id),
        Event::ResourceUpdated { resource } => Some(resource.id),
        _ => None,
    }
}
