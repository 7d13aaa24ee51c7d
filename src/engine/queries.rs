use std::collections::HashMap;

use ulid::Ulid;

use crate::clock;
use crate::limits::*;
use crate::model::*;

use super::availability::{busy_minutes, free_spans, is_busy_at, utilization_pct};
use super::conflict::now_ms;
use super::{Engine, EngineError, SharedResourceState};

impl Engine {
    pub fn list_members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.iter().map(|e| e.value().clone()).collect();
        members.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        members
    }

    pub fn member_by_email(&self, email: &str) -> Option<Member> {
        let id = *self.email_index.get(&email.to_lowercase())?.value();
        self.member(&id)
    }

    pub async fn list_resources(&self) -> Vec<ResourceDesc> {
        let arcs: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            out.push(arc.read().await.desc());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Bookings across the portal, optionally filtered by resource and
    /// member. Statuses are effective at query time: an elapsed confirmed
    /// booking reads `completed` even before the sweeper persists it.
    pub async fn list_bookings(
        &self,
        resource_id: Option<Ulid>,
        member_id: Option<Ulid>,
    ) -> Vec<BookingView> {
        let arcs: Vec<(Ulid, SharedResourceState)> = match resource_id {
            Some(rid) => self
                .get_resource(&rid)
                .map(|arc| vec![(rid, arc)])
                .unwrap_or_default(),
            None => self
                .resources
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        };

        let now = now_ms();
        let mut out = Vec::new();
        for (rid, arc) in arcs {
            let guard = arc.read().await;
            for booking in &guard.bookings {
                if member_id.is_some_and(|mid| booking.member_id != mid) {
                    continue;
                }
                out.push(BookingView {
                    id: booking.id,
                    resource_id: rid,
                    member_id: booking.member_id,
                    start: booking.span.start,
                    end: booking.span.end,
                    status: booking.effective_status(now),
                    purpose: booking.purpose.clone(),
                    created_at: booking.created_at,
                    updated_at: booking.updated_at,
                });
            }
        }
        out.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Free intervals on a resource within the window. A missing resource
    /// yields no rows rather than an error, matching SELECT semantics.
    pub async fn compute_availability(
        &self,
        resource_id: Ulid,
        query_start: Ms,
        query_end: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        if query_end <= query_start {
            return Err(EngineError::Validation("end must be after start"));
        }
        if query_end - query_start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = match self.get_resource(&resource_id) {
            Some(rs) => rs,
            None => return Ok(vec![]),
        };
        let guard = rs.read().await;
        Ok(free_spans(&guard, &Span::new(query_start, query_end)))
    }

    pub async fn dashboard_stats(&self) -> DashboardStats {
        self.dashboard_stats_at(now_ms()).await
    }

    /// The four dashboard numbers, computed against a given instant so
    /// tests can pin "today".
    pub async fn dashboard_stats_at(&self, now: Ms) -> DashboardStats {
        let day_start = clock::local_day_start(now, self.config.tz_offset_min);
        let day = Span::new(day_start, day_start + clock::MS_PER_DAY);
        let work_window = Span::new(
            day_start + WORK_DAY_START_MIN as Ms * clock::MS_PER_MINUTE,
            day_start + WORK_DAY_END_MIN as Ms * clock::MS_PER_MINUTE,
        );
        let work_minutes = (WORK_DAY_END_MIN - WORK_DAY_START_MIN) as i64;

        let active_members = self
            .members
            .iter()
            .filter(|e| e.value().status == MemberStatus::Active)
            .count() as u64;

        let arcs: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();

        let mut bookings_today = 0u64;
        let mut resources_available_now = 0u64;
        // Per category: (resource count, busy minutes in the work window).
        let mut per_category: HashMap<ResourceCategory, (i64, i64)> = HashMap::new();

        for arc in arcs {
            let guard = arc.read().await;
            let tally = per_category.entry(guard.category).or_insert((0, 0));
            tally.0 += 1;
            tally.1 += busy_minutes(&guard, &work_window);

            if guard.status == ResourceStatus::Available && !is_busy_at(&guard, now) {
                resources_available_now += 1;
            }
            // Swept (completed) bookings still count toward today; only
            // cancelled and pending ones are out.
            bookings_today += guard
                .bookings
                .iter()
                .filter(|b| {
                    matches!(
                        b.status,
                        BookingStatus::Confirmed | BookingStatus::Completed
                    ) && day.contains_instant(b.span.start)
                })
                .count() as u64;
        }

        let utilization = ResourceCategory::ALL
            .iter()
            .map(|&category| {
                let (count, busy) = per_category.get(&category).copied().unwrap_or((0, 0));
                CategoryUtilization {
                    category,
                    busy_pct: utilization_pct(busy, work_minutes * count),
                }
            })
            .collect();

        DashboardStats {
            bookings_today,
            active_members,
            resources_available_now,
            utilization,
        }
    }
}
