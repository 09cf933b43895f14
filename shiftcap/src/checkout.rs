//! Caller-side capacity validation for shopping carts.
//!
//! The cart UI calls [`CheckoutClient::pre_check_capacity`] while the user
//! edits quantities (best effort, never blocks) and
//! [`CheckoutClient::validate_cart`] at the moment of payment (authoritative).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::errors::ReservationError;
use crate::service::{CapacityCheck, CapacityRequest, ReservationService};
use crate::types::{EventId, ProductId, ShiftId};

/// One line of a shopping cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    /// Product being purchased.
    pub product_id: ProductId,
    /// Shift the product is assigned to, if any.
    pub shift_id: Option<ShiftId>,
    /// Units of the product.
    pub quantity: u32,
}

impl CartItem {
    /// A line item assigned to a shift.
    pub const fn for_shift(product_id: ProductId, shift_id: ShiftId, quantity: u32) -> Self {
        Self {
            product_id,
            shift_id: Some(shift_id),
            quantity,
        }
    }

    /// A line item with no shift (no capacity constraint).
    pub const fn without_shift(product_id: ProductId, quantity: u32) -> Self {
        Self {
            product_id,
            shift_id: None,
            quantity,
        }
    }
}

/// Sums quantities per shift, ignoring items without a shift.
pub fn group_by_shift(items: &[CartItem]) -> BTreeMap<ShiftId, u32> {
    items
        .iter()
        .filter_map(|item| item.shift_id.as_ref().map(|shift_id| (shift_id, item.quantity)))
        .fold(BTreeMap::new(), |mut grouped, (shift_id, quantity)| {
            let total = grouped.entry(shift_id.clone()).or_insert(0_u32);
            *total = total.saturating_add(quantity);
            grouped
        })
}

/// Why one shift of a cart cannot be booked, with the numbers to fix it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftShortfall {
    /// Shift that failed.
    pub shift_id: ShiftId,
    /// Quantity the cart asks for.
    pub requested: u32,
    /// Places actually left (zero when unknown).
    pub available: u32,
    /// Human-readable explanation.
    pub reason: String,
}

/// Verdict on a whole cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartValidation {
    /// Every shift in the cart has room.
    pub success: bool,
    /// Summary for display.
    pub message: String,
    /// Per-shift detail when `success` is false.
    pub failed_shifts: Vec<ShiftShortfall>,
}

/// Non-authoritative availability shown while quantities are being edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveAvailability {
    /// The quantity currently fits.
    pub can_book: bool,
    /// Places left.
    pub available: u32,
    /// No places left.
    pub is_full: bool,
    /// The quantity would take the last places.
    pub will_be_full: bool,
    /// False when the figures are the optimistic fallback after an error.
    pub authoritative: bool,
}

/// Translates carts into capacity verdicts.
#[derive(Debug, Clone)]
pub struct CheckoutClient {
    service: ReservationService,
}

impl CheckoutClient {
    /// Wraps a reservation service.
    pub const fn new(service: ReservationService) -> Self {
        Self { service }
    }

    /// Validates the cart's combined demand per shift.
    #[instrument(name = "checkout.validate_cart", skip(self, items), fields(event = %event_id, items = items.len()))]
    pub async fn validate_cart(&self, event_id: &EventId, items: &[CartItem]) -> CartValidation {
        let grouped = group_by_shift(items);
        if grouped.is_empty() {
            return CartValidation {
                success: true,
                message: "No shift capacity limits apply to this cart".to_string(),
                failed_shifts: Vec::new(),
            };
        }

        let requests = grouped
            .into_iter()
            .map(|(shift_id, quantity)| CapacityRequest::new(event_id.clone(), shift_id, quantity))
            .collect();
        let report = self.service.batch_check_capacity(requests).await;

        if report.all_can_book {
            return CartValidation {
                success: true,
                message: "All shifts have enough capacity".to_string(),
                failed_shifts: Vec::new(),
            };
        }

        let failed_shifts: Vec<ShiftShortfall> =
            report.failed_checks.iter().map(shortfall).collect();
        let details = failed_shifts
            .iter()
            .map(|failed| {
                format!(
                    "{} (requested {}, available {})",
                    failed.shift_id, failed.requested, failed.available
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        warn!(failed = failed_shifts.len(), "[checkout.validate_cart] cart exceeds shift capacity");

        CartValidation {
            success: false,
            message: format!("Not enough capacity for {} shift(s): {details}", failed_shifts.len()),
            failed_shifts,
        }
    }

    /// Best-effort availability while the user is still editing quantities.
    ///
    /// Errors, and stores slower than the configured pre-check timeout, are
    /// answered optimistically; `validate_cart` repeats the check
    /// authoritatively at payment time.
    #[instrument(name = "checkout.pre_check_capacity", skip(self), fields(event = %event_id, shift = %shift_id))]
    pub async fn pre_check_capacity(
        &self,
        event_id: &EventId,
        shift_id: &ShiftId,
        quantity: u32,
    ) -> LiveAvailability {
        let timeout = self.service.config().pre_check_timeout();
        let check = self.service.check_capacity(event_id, shift_id, quantity);

        match tokio::time::timeout(timeout, check).await {
            Ok(Ok(verdict)) => LiveAvailability {
                can_book: verdict.can_book,
                available: verdict.available,
                is_full: verdict.is_full,
                will_be_full: verdict.will_be_full,
                authoritative: true,
            },
            Ok(Err(error)) => {
                warn!(%error, "[checkout.pre_check_degraded] returning optimistic availability");
                self.optimistic()
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.service.config().pre_check_timeout_ms,
                    "[checkout.pre_check_degraded] capacity check timed out, returning optimistic availability"
                );
                self.optimistic()
            }
        }
    }

    fn optimistic(&self) -> LiveAvailability {
        LiveAvailability {
            can_book: true,
            available: self.service.config().optimistic_available,
            is_full: false,
            will_be_full: false,
            authoritative: false,
        }
    }
}

fn shortfall(check: &CapacityCheck) -> ShiftShortfall {
    let shift_id = check.request.shift_id.clone();
    let requested = check.request.quantity;

    let (available, reason) = match &check.outcome {
        Ok(verdict) if verdict.is_full => (
            0,
            format!("Shift {shift_id} is full; remove {requested} place(s) from your cart"),
        ),
        Ok(verdict) => (
            verdict.available,
            format!(
                "Only {} place(s) left for shift {shift_id}; reduce your quantity by {}",
                verdict.available,
                verdict.shortfall()
            ),
        ),
        Err(ReservationError::NotFound { .. }) => {
            (0, format!("Shift {shift_id} does not exist for this event"))
        }
        Err(error) if error.is_retryable() => (
            0,
            format!("Capacity for shift {shift_id} could not be verified; please try again"),
        ),
        Err(error) => (0, error.to_string()),
    };

    ShiftShortfall {
        shift_id,
        requested,
        available,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str) -> ProductId {
        ProductId::try_new(id).unwrap()
    }

    fn shift(id: &str) -> ShiftId {
        ShiftId::try_new(id).unwrap()
    }

    #[test]
    fn grouping_sums_quantities_per_shift_and_skips_unassigned_items() {
        let items = vec![
            CartItem::for_shift(product("adult"), shift("morning"), 2),
            CartItem::for_shift(product("child"), shift("morning"), 1),
            CartItem::for_shift(product("adult"), shift("evening"), 4),
            CartItem::without_shift(product("t-shirt"), 3),
        ];

        let grouped = group_by_shift(&items);

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&shift("morning")], 3);
        assert_eq!(grouped[&shift("evening")], 4);
    }

    #[test]
    fn grouping_an_unassigned_cart_is_empty() {
        let items = vec![CartItem::without_shift(product("t-shirt"), 3)];
        assert!(group_by_shift(&items).is_empty());
    }

    #[test]
    fn grouping_saturates_instead_of_overflowing() {
        let items = vec![
            CartItem::for_shift(product("a"), shift("morning"), u32::MAX),
            CartItem::for_shift(product("b"), shift("morning"), 5),
        ];
        assert_eq!(group_by_shift(&items)[&shift("morning")], u32::MAX);
    }
}
