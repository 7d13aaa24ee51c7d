use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Closed enumerations ──────────────────────────────────────────
//
// String spellings are validated at the boundary; inside the engine
// only these enums exist.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceCategory {
    MeetingRoom,
    PhoneBooth,
    Desk,
    Equipment,
}

impl ResourceCategory {
    pub const ALL: [ResourceCategory; 4] = [
        ResourceCategory::MeetingRoom,
        ResourceCategory::PhoneBooth,
        ResourceCategory::Desk,
        ResourceCategory::Equipment,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "meeting_room" | "meeting room" => Some(Self::MeetingRoom),
            "phone_booth" | "phone booth" => Some(Self::PhoneBooth),
            "desk" => Some(Self::Desk),
            "equipment" => Some(Self::Equipment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MeetingRoom => "meeting_room",
            Self::PhoneBooth => "phone_booth",
            Self::Desk => "desk",
            Self::Equipment => "equipment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Available,
    InUse,
    Maintenance,
}

impl ResourceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "available" => Some(Self::Available),
            // "booked" is the legacy spelling still used by older clients.
            "in_use" | "in-use" | "booked" => Some(Self::InUse),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::InUse => "in_use",
            Self::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Active,
    Inactive,
    Pending,
}

impl MemberStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Member,
    Admin,
}

impl MemberRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    /// A booking holds its slot while pending or confirmed.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Ulid,
    pub name: String,
    /// Identity key. Unique, immutable after creation.
    pub email: String,
    pub company: Option<String>,
    pub department: Option<String>,
    pub phone: Option<String>,
    pub status: MemberStatus,
    pub role: MemberRole,
    pub joined_at: Ms,
    pub updated_at: Ms,
}

impl Member {
    pub fn is_admin(&self) -> bool {
        self.role == MemberRole::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub member_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub purpose: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    /// Display status: an explicit cancel or complete wins, otherwise a
    /// booking whose end has passed reads as completed.
    pub fn effective_status(&self, now: Ms) -> BookingStatus {
        match self.status {
            BookingStatus::Cancelled => BookingStatus::Cancelled,
            BookingStatus::Completed => BookingStatus::Completed,
            _ if now >= self.span.end => BookingStatus::Completed,
            stored => stored,
        }
    }
}

/// The bookable-resource record without its booking list. Used in WAL
/// events and query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDesc {
    pub id: Ulid,
    pub name: String,
    pub category: ResourceCategory,
    /// Seat count, descriptive only — a resource is one bookable slot.
    pub capacity: u32,
    pub location: Option<String>,
    pub description: Option<String>,
    pub status: ResourceStatus,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub category: ResourceCategory,
    pub capacity: u32,
    pub location: Option<String>,
    pub description: Option<String>,
    pub status: ResourceStatus,
    /// All bookings regardless of status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(desc: ResourceDesc) -> Self {
        Self {
            id: desc.id,
            name: desc.name,
            category: desc.category,
            capacity: desc.capacity,
            location: desc.location,
            description: desc.description,
            status: desc.status,
            bookings: Vec::new(),
        }
    }

    pub fn desc(&self) -> ResourceDesc {
        ResourceDesc {
            id: self.id,
            name: self.name.clone(),
            category: self.category,
            capacity: self.capacity,
            location: self.location.clone(),
            description: self.description.clone(),
            status: self.status,
        }
    }

    pub fn apply_desc(&mut self, desc: &ResourceDesc) {
        self.name = desc.name.clone();
        self.category = desc.category;
        self.capacity = desc.capacity;
        self.location = desc.location.clone();
        self.description = desc.description.clone();
        self.status = desc.status;
    }

    /// Insert a booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// WAL record format. Replaying these from an empty state reproduces
/// the full portal state, so every field a record needs must be here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MemberCreated {
        member: Member,
    },
    MemberUpdated {
        member: Member,
    },
    MemberDeleted {
        id: Ulid,
    },
    ResourceCreated {
        resource: ResourceDesc,
    },
    ResourceUpdated {
        resource: ResourceDesc,
    },
    ResourceDeleted {
        id: Ulid,
    },
    BookingCreated {
        resource_id: Ulid,
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub member_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    /// Effective status at query time, not the stored one.
    pub status: BookingStatus,
    pub purpose: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryUtilization {
    pub category: ResourceCategory,
    /// Share of the business-hours window booked today, 0..=100.
    pub busy_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardStats {
    pub bookings_today: u64,
    pub active_members: u64,
    pub resources_available_now: u64,
    /// One entry per category, in `ResourceCategory::ALL` order.
    pub utilization: Vec<CategoryUtilization>,
}

// ── Boundary patch types ─────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberPatch {
    pub name: Option<String>,
    pub company: Option<String>,
    pub department: Option<String>,
    pub phone: Option<String>,
    pub status: Option<MemberStatus>,
    pub role: Option<MemberRole>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub category: Option<ResourceCategory>,
    pub capacity: Option<u32>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub status: Option<ResourceStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(category: ResourceCategory) -> ResourceDesc {
        ResourceDesc {
            id: Ulid::new(),
            name: "Aurora".into(),
            category,
            capacity: 4,
            location: None,
            description: None,
            status: ResourceStatus::Available,
        }
    }

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            member_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            purpose: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn category_parse_round_trip() {
        for cat in ResourceCategory::ALL {
            assert_eq!(ResourceCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(ResourceCategory::parse("meeting room"), Some(ResourceCategory::MeetingRoom));
        assert_eq!(ResourceCategory::parse("lounge"), None);
    }

    #[test]
    fn resource_status_accepts_legacy_booked() {
        assert_eq!(ResourceStatus::parse("booked"), Some(ResourceStatus::InUse));
        assert_eq!(ResourceStatus::parse("in_use"), Some(ResourceStatus::InUse));
        assert_eq!(ResourceStatus::parse("free"), None);
    }

    #[test]
    fn booking_status_activity() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Confirmed.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
        assert!(!BookingStatus::Completed.is_active());
    }

    #[test]
    fn effective_status_cancelled_wins_over_elapsed() {
        let b = booking(1000, 2000, BookingStatus::Cancelled);
        assert_eq!(b.effective_status(5000), BookingStatus::Cancelled);
    }

    #[test]
    fn effective_status_elapsed_reads_completed() {
        let b = booking(1000, 2000, BookingStatus::Confirmed);
        assert_eq!(b.effective_status(1999), BookingStatus::Confirmed);
        assert_eq!(b.effective_status(2000), BookingStatus::Completed);
        let p = booking(1000, 2000, BookingStatus::Pending);
        assert_eq!(p.effective_status(2500), BookingStatus::Completed);
    }

    #[test]
    fn booking_ordering() {
        let mut rs = ResourceState::new(desc(ResourceCategory::MeetingRoom));
        rs.insert_booking(booking(300, 400, BookingStatus::Confirmed));
        rs.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        rs.insert_booking(booking(200, 300, BookingStatus::Pending));
        assert_eq!(rs.bookings[0].span.start, 100);
        assert_eq!(rs.bookings[1].span.start, 200);
        assert_eq!(rs.bookings[2].span.start, 300);
    }

    #[test]
    fn booking_remove_preserves_order() {
        let mut rs = ResourceState::new(desc(ResourceCategory::Desk));
        let mut ids = Vec::new();
        for i in 0..3 {
            let b = booking(i * 100, i * 100 + 50, BookingStatus::Confirmed);
            ids.push(b.id);
            rs.insert_booking(b);
        }
        rs.remove_booking(ids[1]);
        assert_eq!(rs.bookings.len(), 2);
        assert_eq!(rs.bookings[0].id, ids[0]);
        assert_eq!(rs.bookings[1].id, ids[2]);
        assert!(rs.remove_booking(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_out_of_window() {
        let mut rs = ResourceState::new(desc(ResourceCategory::PhoneBooth));
        rs.insert_booking(booking(100, 200, BookingStatus::Confirmed)); // past
        rs.insert_booking(booking(450, 600, BookingStatus::Confirmed)); // hit
        rs.insert_booking(booking(1000, 1100, BookingStatus::Confirmed)); // future

        let query = Span::new(500, 800);
        let hits: Vec<_> = rs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // A booking ending exactly at query.start is NOT overlapping (half-open).
        let mut rs = ResourceState::new(desc(ResourceCategory::Equipment));
        rs.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_single_ms() {
        let mut rs = ResourceState::new(desc(ResourceCategory::Desk));
        // [100, 201) overlaps [200, 300) by exactly 1ms.
        rs.insert_booking(booking(100, 201, BookingStatus::Confirmed));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn overlapping_empty_resource() {
        let rs = ResourceState::new(desc(ResourceCategory::MeetingRoom));
        assert!(rs.overlapping(&Span::new(0, 1000)).next().is_none());
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = Event::BookingCreated {
            resource_id: Ulid::new(),
            booking: booking(1000, 2000, BookingStatus::Pending),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn desc_round_trip() {
        let d = desc(ResourceCategory::MeetingRoom);
        let rs = ResourceState::new(d.clone());
        assert_eq!(rs.desc(), d);
    }
}
