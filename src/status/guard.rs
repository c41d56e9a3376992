use crate::api::models::{Order, OrderStatus, PaymentStatus};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    /// Already in the requested state.
    NoOp,
}

pub fn check_order_transition(order: &Order, target: OrderStatus) -> Result<Transition, SyncError> {
    let current = order.order_status;
    if current == target {
        return Ok(Transition::NoOp);
    }
    if current.is_terminal() {
        return Err(SyncError::BusinessRuleRejected(format!(
            "Order is already {} and cannot be changed",
            current
        )));
    }
    let needs_payment = matches!(target, OrderStatus::Delivered | OrderStatus::Preparation);
    if needs_payment && order.payment_status() != PaymentStatus::Paid {
        return Err(SyncError::BusinessRuleRejected(format!(
            "Cannot set order to {} before payment is confirmed",
            target
        )));
    }
    Ok(Transition::Apply)
}

pub fn check_payment_transition(order: &Order, target: PaymentStatus) -> Result<Transition, SyncError> {
    let current = order.payment_status();
    if current == target {
        return Ok(Transition::NoOp);
    }
    let shipped = matches!(order.order_status, OrderStatus::Ontheway | OrderStatus::Delivered);
    if current == PaymentStatus::Paid && target == PaymentStatus::Unpaid && shipped {
        return Err(SyncError::BusinessRuleRejected(format!(
            "Cannot mark payment unpaid once the order is {}",
            order.order_status
        )));
    }
    Ok(Transition::Apply)
}
