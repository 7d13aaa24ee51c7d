use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::auth::Principal;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_slot_free, now_ms, validate_range};
use super::{Engine, EngineError, WalCommand};

fn require_admin(who: &Principal) -> Result<(), EngineError> {
    if who.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized("admin role required"))
    }
}

fn check_len(value: &Option<String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    if let Some(v) = value
        && v.len() > max
    {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    // ── Members ──────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_member(
        &self,
        who: &Principal,
        id: Ulid,
        name: String,
        email: String,
        company: Option<String>,
        department: Option<String>,
        phone: Option<String>,
        role: MemberRole,
    ) -> Result<(), EngineError> {
        require_admin(who)?;
        if self.members.len() >= MAX_MEMBERS {
            return Err(EngineError::LimitExceeded("too many members"));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("member name missing or too long"));
        }
        if email.is_empty() || email.len() > MAX_EMAIL_LEN || !email.contains('@') {
            return Err(EngineError::Validation("invalid email"));
        }
        check_len(&company, MAX_FIELD_LEN, "company too long")?;
        check_len(&department, MAX_FIELD_LEN, "department too long")?;
        check_len(&phone, MAX_FIELD_LEN, "phone too long")?;
        if self.members.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.email_index.contains_key(&email.to_lowercase()) {
            return Err(EngineError::EmailInUse(email));
        }

        let now = now_ms();
        let member = Member {
            id,
            name,
            email,
            company,
            department,
            phone,
            // Admin-created members are ready to book immediately.
            status: MemberStatus::Active,
            role,
            joined_at: now,
            updated_at: now,
        };
        self.persist_member_event(&Event::MemberCreated { member })
            .await
    }

    /// Members may edit their own profile fields; changing status or role
    /// takes an admin. Email is the identity key and never changes.
    pub async fn update_member(
        &self,
        who: &Principal,
        id: Ulid,
        patch: MemberPatch,
    ) -> Result<(), EngineError> {
        let self_edit = who.member_id == id;
        if !self_edit {
            require_admin(who)?;
        }
        if !who.is_admin() && (patch.status.is_some() || patch.role.is_some()) {
            return Err(EngineError::Unauthorized(
                "only admins change status or role",
            ));
        }
        if let Some(ref n) = patch.name
            && (n.is_empty() || n.len() > MAX_NAME_LEN)
        {
            return Err(EngineError::Validation("member name missing or too long"));
        }
        check_len(&patch.company, MAX_FIELD_LEN, "company too long")?;
        check_len(&patch.department, MAX_FIELD_LEN, "department too long")?;
        check_len(&patch.phone, MAX_FIELD_LEN, "phone too long")?;

        let mut member = self.member(&id).ok_or(EngineError::NotFound(id))?;
        if let Some(name) = patch.name {
            member.name = name;
        }
        if let Some(company) = patch.company {
            member.company = Some(company);
        }
        if let Some(department) = patch.department {
            member.department = Some(department);
        }
        if let Some(phone) = patch.phone {
            member.phone = Some(phone);
        }
        if let Some(status) = patch.status {
            member.status = status;
        }
        if let Some(role) = patch.role {
            member.role = role;
        }
        member.updated_at = now_ms();
        self.persist_member_event(&Event::MemberUpdated { member })
            .await
    }

    /// Remove a member and cancel every active booking they hold.
    pub async fn delete_member(&self, who: &Principal, id: Ulid) -> Result<(), EngineError> {
        require_admin(who)?;
        if !self.members.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let resource_arcs: Vec<(Ulid, super::SharedResourceState)> = self
            .resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let now = now_ms();
        for (resource_id, arc) in resource_arcs {
            let mut guard = arc.write().await;
            let to_cancel: Vec<Ulid> = guard
                .bookings
                .iter()
                .filter(|b| b.member_id == id && b.status.is_active())
                .map(|b| b.id)
                .collect();
            for booking_id in to_cancel {
                let event = Event::BookingStatusChanged {
                    id: booking_id,
                    resource_id,
                    status: BookingStatus::Cancelled,
                    at: now,
                };
                self.persist_and_apply(resource_id, &mut guard, &event)
                    .await?;
            }
        }

        self.persist_member_event(&Event::MemberDeleted { id })
            .await
    }

    // ── Resources ────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_resource(
        &self,
        who: &Principal,
        id: Ulid,
        name: String,
        category: ResourceCategory,
        capacity: u32,
        location: Option<String>,
        description: Option<String>,
    ) -> Result<(), EngineError> {
        require_admin(who)?;
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("resource name missing or too long"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("capacity must be positive"));
        }
        check_len(&location, MAX_FIELD_LEN, "location too long")?;
        check_len(&description, MAX_DESCRIPTION_LEN, "description too long")?;
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let desc = ResourceDesc {
            id,
            name,
            category,
            capacity,
            location,
            description,
            status: ResourceStatus::Available,
        };
        let event = Event::ResourceCreated {
            resource: desc.clone(),
        };
        self.wal_append(&event).await?;
        self.resources
            .insert(id, Arc::new(RwLock::new(ResourceState::new(desc))));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_resource(
        &self,
        who: &Principal,
        id: Ulid,
        patch: ResourcePatch,
    ) -> Result<(), EngineError> {
        require_admin(who)?;
        if let Some(ref n) = patch.name
            && (n.is_empty() || n.len() > MAX_NAME_LEN)
        {
            return Err(EngineError::Validation("resource name missing or too long"));
        }
        if patch.capacity == Some(0) {
            return Err(EngineError::Validation("capacity must be positive"));
        }
        check_len(&patch.location, MAX_FIELD_LEN, "location too long")?;
        check_len(&patch.description, MAX_DESCRIPTION_LEN, "description too long")?;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let mut desc = guard.desc();
        if let Some(name) = patch.name {
            desc.name = name;
        }
        if let Some(category) = patch.category {
            desc.category = category;
        }
        if let Some(capacity) = patch.capacity {
            desc.capacity = capacity;
        }
        if let Some(location) = patch.location {
            desc.location = Some(location);
        }
        if let Some(description) = patch.description {
            desc.description = Some(description);
        }
        if let Some(status) = patch.status {
            desc.status = status;
        }

        let event = Event::ResourceUpdated { resource: desc };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Remove a resource and everything booked on it.
    pub async fn delete_resource(&self, who: &Principal, id: Ulid) -> Result<(), EngineError> {
        require_admin(who)?;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        let booking_ids: Vec<Ulid> = guard.bookings.iter().map(|b| b.id).collect();
        drop(guard);

        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        self.resources.remove(&id);
        for booking_id in booking_ids {
            self.booking_index.remove(&booking_id);
        }
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────

    /// Reserve a slot. The conflict check and the insert happen under the
    /// same resource write lock, so two racing requests for the same slot
    /// serialize and exactly one wins.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_booking(
        &self,
        who: &Principal,
        id: Ulid,
        resource_id: Ulid,
        member_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        purpose: Option<String>,
    ) -> Result<(), EngineError> {
        let owner_id = member_id.unwrap_or(who.member_id);
        if owner_id != who.member_id {
            require_admin(who).map_err(|_| {
                EngineError::Unauthorized("cannot book on behalf of another member")
            })?;
        }
        let owner = self.member(&owner_id).ok_or(EngineError::NotFound(owner_id))?;
        if owner.status != MemberStatus::Active {
            return Err(EngineError::Validation("member is not active"));
        }
        let span = validate_range(start, end)?;
        check_len(&purpose, MAX_PURPOSE_LEN, "purpose too long")?;
        if self.booking_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        if guard.status == ResourceStatus::Maintenance {
            return Err(EngineError::Validation("resource is under maintenance"));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }

        check_slot_free(&guard, &span, None)?;

        let status = if self.config.require_approval && !who.is_admin() {
            BookingStatus::Pending
        } else {
            BookingStatus::Confirmed
        };
        let now = now_ms();
        let event = Event::BookingCreated {
            resource_id,
            booking: Booking {
                id,
                member_id: owner_id,
                span,
                status,
                purpose,
                created_at: now,
                updated_at: now,
            },
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await
    }

    /// Move a booking to a new span on the same resource. The booking's
    /// own current slot never counts against it.
    pub async fn reschedule_booking(
        &self,
        who: &Principal,
        id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Ulid, EngineError> {
        let span = validate_range(start, end)?;
        let (resource_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        if booking.member_id != who.member_id {
            require_admin(who)
                .map_err(|_| EngineError::Unauthorized("not your booking"))?;
        }
        if !booking.status.is_active() {
            return Err(EngineError::Validation("cannot reschedule a finished booking"));
        }

        check_slot_free(&guard, &span, Some(id))?;

        let event = Event::BookingRescheduled {
            id,
            resource_id,
            span,
            at: now_ms(),
        };
        self.persist_and_apply(resource_id, &mut guard, &event)
            .await?;
        Ok(resource_id)
    }

    /// Approve a pending booking. Idempotent for already-confirmed ones.
    pub async fn confirm_booking(&self, who: &Principal, id: Ulid) -> Result<Ulid, EngineError> {
        require_admin(who)?;
        let (resource_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        match booking.status {
            BookingStatus::Confirmed => return Ok(resource_id),
            BookingStatus::Pending => {}
            from => {
                return Err(EngineError::InvalidTransition {
                    from,
                    to: BookingStatus::Confirmed,
                });
            }
        }

        let event = Event::BookingStatusChanged {
            id,
            resource_id,
            status: BookingStatus::Confirmed,
            at: now_ms(),
        };
        self.persist_and_apply(resource_id, &mut guard, &event)
            .await?;
        Ok(resource_id)
    }

    /// Cancel a booking, freeing its slot. Idempotent: cancelling an
    /// already-cancelled booking succeeds without a new event.
    pub async fn cancel_booking(&self, who: &Principal, id: Ulid) -> Result<Ulid, EngineError> {
        let (resource_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        if booking.member_id != who.member_id {
            require_admin(who)
                .map_err(|_| EngineError::Unauthorized("not your booking"))?;
        }
        match booking.status {
            BookingStatus::Cancelled => return Ok(resource_id),
            BookingStatus::Completed => {
                return Err(EngineError::InvalidTransition {
                    from: BookingStatus::Completed,
                    to: BookingStatus::Cancelled,
                });
            }
            _ => {}
        }

        let event = Event::BookingStatusChanged {
            id,
            resource_id,
            status: BookingStatus::Cancelled,
            at: now_ms(),
        };
        self.persist_and_apply(resource_id, &mut guard, &event)
            .await?;
        Ok(resource_id)
    }

    /// Hard-delete a booking record. Admin only; members cancel instead.
    pub async fn delete_booking(&self, who: &Principal, id: Ulid) -> Result<Ulid, EngineError> {
        require_admin(who)?;
        let (resource_id, mut guard) = self.resolve_booking_write(&id).await?;
        if guard.booking(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BookingDeleted { id, resource_id };
        self.persist_and_apply(resource_id, &mut guard, &event)
            .await?;
        Ok(resource_id)
    }

    /// Persist `completed` on every active booking whose end has passed,
    /// so the stored status catches up with the effective one. Returns the
    /// number of bookings swept.
    pub async fn sweep_completed(&self) -> Result<usize, EngineError> {
        let resource_arcs: Vec<(Ulid, super::SharedResourceState)> = self
            .resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let now = now_ms();
        let mut swept = 0;
        for (resource_id, arc) in resource_arcs {
            let mut guard = arc.write().await;
            let elapsed: Vec<Ulid> = guard
                .bookings
                .iter()
                .filter(|b| b.status.is_active() && b.span.end <= now)
                .map(|b| b.id)
                .collect();
            for booking_id in elapsed {
                let event = Event::BookingStatusChanged {
                    id: booking_id,
                    resource_id,
                    status: BookingStatus::Completed,
                    at: now,
                };
                self.persist_and_apply(resource_id, &mut guard, &event)
                    .await?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let mut members: Vec<Member> = self.members.iter().map(|e| e.value().clone()).collect();
        members.sort_by_key(|m| m.id);
        for member in members {
            events.push(Event::MemberCreated { member });
        }

        // Collect Arcs first so reads don't hold DashMap shard locks.
        let resource_arcs: Vec<super::SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        for arc in resource_arcs {
            let guard = arc.read().await;
            events.push(Event::ResourceCreated {
                resource: guard.desc(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    resource_id: guard.id,
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

