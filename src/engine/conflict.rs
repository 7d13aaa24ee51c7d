//! Span validation and the double-booking check. The check is only
//! meaningful while the caller holds the resource's write lock: check and
//! insert must happen under the same guard or two clients can race past
//! each other and both win the slot.

use std::time::{SystemTime, UNIX_EPOCH};

use ulid::Ulid;

use crate::limits;
use crate::model::{Ms, ResourceState, Span};

use super::error::EngineError;

pub(crate) fn now_ms() -> Ms {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Validate a requested booking range and return it as a `Span`.
pub(crate) fn validate_range(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::Validation("end must be after start"));
    }
    if start < limits::MIN_VALID_TIMESTAMP_MS || end > limits::MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > limits::MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(Span::new(start, end))
}

/// Reject the span if any active booking on the resource overlaps it.
/// `exclude` skips one booking id so a reschedule does not collide with
/// itself.
pub(crate) fn check_slot_free(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for existing in rs.overlapping(span) {
        if !existing.status.is_active() {
            continue;
        }
        if exclude == Some(existing.id) {
            continue;
        }
        return Err(EngineError::SlotConflict {
            booking_id: existing.id,
            resource_id: rs.id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Booking, BookingStatus, ResourceCategory, ResourceDesc, ResourceStatus,
    };

    fn resource() -> ResourceState {
        ResourceState::new(ResourceDesc {
            id: Ulid::new(),
            name: "Booth 1".into(),
            category: ResourceCategory::PhoneBooth,
            capacity: 1,
            location: None,
            description: None,
            status: ResourceStatus::Available,
        })
    }

    fn add(rs: &mut ResourceState, start: Ms, end: Ms, status: BookingStatus) -> Ulid {
        let id = Ulid::new();
        rs.insert_booking(Booking {
            id,
            member_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            purpose: None,
            created_at: 0,
            updated_at: 0,
        });
        id
    }

    const HOUR: Ms = 3_600_000;

    #[test]
    fn range_rejects_inverted_and_empty() {
        assert!(matches!(
            validate_range(1000, 1000),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_range(2000, 1000),
            Err(EngineError::Validation(_))
        ));
        assert!(validate_range(1000, 2000).is_ok());
    }

    #[test]
    fn range_rejects_out_of_bounds() {
        assert!(matches!(
            validate_range(-5, 1000),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_range(0, limits::MAX_VALID_TIMESTAMP_MS + 1),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_range(0, limits::MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn overlap_is_a_conflict() {
        // 14:00-15:00 booked, 14:30-15:30 requested.
        let mut rs = resource();
        let held = add(&mut rs, 14 * HOUR, 15 * HOUR, BookingStatus::Confirmed);
        let err = check_slot_free(&rs, &Span::new(14 * HOUR + HOUR / 2, 15 * HOUR + HOUR / 2), None)
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::SlotConflict {
                booking_id: held,
                resource_id: rs.id
            }
        );
    }

    #[test]
    fn back_to_back_is_free() {
        let mut rs = resource();
        add(&mut rs, 14 * HOUR, 15 * HOUR, BookingStatus::Confirmed);
        assert!(check_slot_free(&rs, &Span::new(15 * HOUR, 16 * HOUR), None).is_ok());
        assert!(check_slot_free(&rs, &Span::new(13 * HOUR, 14 * HOUR), None).is_ok());
    }

    #[test]
    fn identical_span_conflicts() {
        let mut rs = resource();
        add(&mut rs, 14 * HOUR, 15 * HOUR, BookingStatus::Pending);
        assert!(check_slot_free(&rs, &Span::new(14 * HOUR, 15 * HOUR), None).is_err());
    }

    #[test]
    fn cancelled_and_completed_do_not_block() {
        let mut rs = resource();
        add(&mut rs, 14 * HOUR, 15 * HOUR, BookingStatus::Cancelled);
        add(&mut rs, 15 * HOUR, 16 * HOUR, BookingStatus::Completed);
        assert!(check_slot_free(&rs, &Span::new(14 * HOUR, 16 * HOUR), None).is_ok());
    }

    #[test]
    fn exclude_skips_own_booking() {
        let mut rs = resource();
        let own = add(&mut rs, 14 * HOUR, 15 * HOUR, BookingStatus::Confirmed);
        let other = add(&mut rs, 16 * HOUR, 17 * HOUR, BookingStatus::Confirmed);
        // Widening own booking over its old slot is fine.
        assert!(check_slot_free(&rs, &Span::new(14 * HOUR, 16 * HOUR), Some(own)).is_ok());
        // But not over someone else's.
        let err =
            check_slot_free(&rs, &Span::new(14 * HOUR, 17 * HOUR), Some(own)).unwrap_err();
        assert_eq!(
            err,
            EngineError::SlotConflict {
                booking_id: other,
                resource_id: rs.id
            }
        );
    }
}
