//! Payments integration events.
//!
//! Payment processing itself lives outside this system; only the completion
//! notification crosses the boundary, published on the events queue like any
//! domain event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use confreg_core::OrderId;

/// Published by the payments system when payment for an order clears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

impl confreg_messaging::Event for PaymentCompleted {
    fn event_type(&self) -> &'static str {
        "payments.payment_completed"
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
