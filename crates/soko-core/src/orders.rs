use crate::error::MarketError;
use crate::types::{
    order_number, record_id, CartItem, CheckoutRequest, Order, OrderItem, OrderStatus,
    PaymentStatus,
};
use chrono::Utc;
use std::collections::BTreeMap;

/// Allowed order status transitions.
///
/// `disputed` is reachable from any non-terminal state, but only the dispute
/// manager takes that edge; callers of the regular lifecycle never pass
/// `Disputed` here.
pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    match (from, to) {
        (Pending, Confirmed) | (Pending, Cancelled) => true,
        (Confirmed, Processing) | (Confirmed, Cancelled) => true,
        (Processing, Shipped) => true,
        (Shipped, Delivered) => true,
        // Refund of a held escrow cancels the order even after fulfilment started.
        (Processing, Cancelled) | (Shipped, Cancelled) => true,
        (from, Disputed) if !from.is_terminal() => true,
        (Disputed, Cancelled) | (Disputed, Delivered) => true,
        _ => false,
    }
}

/// Cart lines grouped per vendor, in deterministic vendor order.
pub fn partition_by_vendor(items: &[CartItem]) -> BTreeMap<String, Vec<CartItem>> {
    let mut groups: BTreeMap<String, Vec<CartItem>> = BTreeMap::new();
    for item in items {
        groups
            .entry(item.vendor_id.clone())
            .or_default()
            .push(item.clone());
    }
    groups
}

/// Subtotal for one vendor group, with overflow treated as bad input.
pub fn group_subtotal_minor(items: &[OrderItem]) -> Result<u64, MarketError> {
    let mut subtotal: u64 = 0;
    for item in items {
        let line = item
            .line_total_minor()
            .ok_or_else(|| MarketError::validation("cart line total overflows"))?;
        subtotal = subtotal
            .checked_add(line)
            .ok_or_else(|| MarketError::validation("cart subtotal overflows"))?;
    }
    Ok(subtotal)
}

/// Build every per-vendor order for a checkout. Returns the orders unpersisted;
/// the caller commits them as one atomic batch so a multi-vendor checkout is
/// all-or-nothing.
pub fn build_orders(request: &CheckoutRequest) -> Result<Vec<Order>, MarketError> {
    if request.buyer_id.trim().is_empty() {
        return Err(MarketError::validation("buyer_id is required"));
    }
    if request.items.is_empty() {
        return Err(MarketError::validation("cart is empty"));
    }
    for item in &request.items {
        if item.quantity == 0 {
            return Err(MarketError::validation(format!(
                "cart item '{}' has zero quantity",
                item.product_id
            )));
        }
        if item.unit_price_minor == 0 {
            return Err(MarketError::validation(format!(
                "cart item '{}' has zero unit price",
                item.product_id
            )));
        }
    }

    let now = Utc::now();
    let mut orders = Vec::new();
    for (vendor_id, group) in partition_by_vendor(&request.items) {
        let items: Vec<OrderItem> = group
            .into_iter()
            .map(|item| OrderItem {
                product_id: item.product_id,
                title: item.title,
                image_url: item.image_url,
                quantity: item.quantity,
                unit_price_minor: item.unit_price_minor,
            })
            .collect();

        let subtotal_minor = group_subtotal_minor(&items)?;
        let shipping_fee_minor = request
            .shipping_by_vendor
            .get(&vendor_id)
            .copied()
            .unwrap_or(0);
        let total_minor = subtotal_minor
            .checked_add(shipping_fee_minor)
            .ok_or_else(|| MarketError::validation("order total overflows"))?;
        if total_minor == 0 {
            return Err(MarketError::validation(format!(
                "order total for vendor '{vendor_id}' is zero"
            )));
        }

        orders.push(Order {
            order_id: record_id("order"),
            order_number: order_number(),
            buyer_id: request.buyer_id.clone(),
            vendor_id,
            items,
            delivery_address_id: request.delivery_address_id.clone(),
            delivery_type: request.delivery_type,
            subtotal_minor,
            shipping_fee_minor,
            total_minor,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_reference: None,
            payment_channel: None,
            tracking_number: None,
            created_at: now,
            updated_at: now,
        });
    }

    Ok(orders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryType;

    fn cart_item(vendor: &str, product: &str, quantity: u32, unit_price: u64) -> CartItem {
        CartItem {
            product_id: product.to_string(),
            title: format!("product {product}"),
            image_url: None,
            vendor_id: vendor.to_string(),
            quantity,
            unit_price_minor: unit_price,
        }
    }

    fn checkout(items: Vec<CartItem>) -> CheckoutRequest {
        CheckoutRequest {
            buyer_id: "buyer-1".to_string(),
            items,
            delivery_address_id: "addr-1".to_string(),
            delivery_type: DeliveryType::HomeDelivery,
            shipping_by_vendor: BTreeMap::from([
                ("vendor-a".to_string(), 1_500),
                ("vendor-b".to_string(), 1_000),
            ]),
        }
    }

    #[test]
    fn splits_cart_into_one_order_per_vendor() {
        let request = checkout(vec![
            cart_item("vendor-a", "p-1", 2, 5_000),
            cart_item("vendor-b", "p-2", 1, 8_000),
            cart_item("vendor-a", "p-3", 1, 5_000),
        ]);

        let orders = build_orders(&request).unwrap();
        assert_eq!(orders.len(), 2);

        let a = orders.iter().find(|o| o.vendor_id == "vendor-a").unwrap();
        assert_eq!(a.subtotal_minor, 15_000);
        assert_eq!(a.shipping_fee_minor, 1_500);
        assert_eq!(a.total_minor, 16_500);
        assert_eq!(a.items.len(), 2);

        let b = orders.iter().find(|o| o.vendor_id == "vendor-b").unwrap();
        assert_eq!(b.subtotal_minor, 8_000);
        assert_eq!(b.total_minor, 9_000);

        for order in &orders {
            assert_eq!(order.total_minor, order.subtotal_minor + order.shipping_fee_minor);
            let line_sum: u64 = order
                .items
                .iter()
                .map(|i| i.line_total_minor().unwrap())
                .sum();
            assert_eq!(order.subtotal_minor, line_sum);
            assert_eq!(order.status, OrderStatus::Pending);
            assert_eq!(order.payment_status, PaymentStatus::Pending);
        }
    }

    #[test]
    fn rejects_empty_cart_and_zero_lines() {
        let err = build_orders(&checkout(vec![])).unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));

        let err = build_orders(&checkout(vec![cart_item("vendor-a", "p-1", 0, 5_000)]))
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));

        let err = build_orders(&checkout(vec![cart_item("vendor-a", "p-1", 1, 0)])).unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
    }

    #[test]
    fn missing_shipping_entry_defaults_to_zero() {
        let mut request = checkout(vec![cart_item("vendor-c", "p-9", 1, 4_000)]);
        request.shipping_by_vendor.clear();

        let orders = build_orders(&request).unwrap();
        assert_eq!(orders[0].shipping_fee_minor, 0);
        assert_eq!(orders[0].total_minor, 4_000);
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use OrderStatus::*;
        assert!(can_transition(Pending, Confirmed));
        assert!(can_transition(Pending, Cancelled));
        assert!(can_transition(Confirmed, Processing));
        assert!(can_transition(Confirmed, Cancelled));
        assert!(can_transition(Processing, Shipped));
        assert!(can_transition(Shipped, Delivered));
        assert!(can_transition(Shipped, Disputed));
        assert!(can_transition(Disputed, Delivered));

        assert!(!can_transition(Delivered, Disputed));
        assert!(!can_transition(Cancelled, Confirmed));
        assert!(!can_transition(Pending, Shipped));
        assert!(!can_transition(Delivered, Cancelled));
    }
}
