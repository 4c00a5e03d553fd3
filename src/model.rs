//! Domain payload types for the synchronized POS state.
//!
//! These are the concrete value types the terminals replicate under the
//! well-known logical keys. camelCase serde matches the wire shapes the
//! register, kitchen display, and customer devices exchange. Business rules
//! (payroll formulas, maintenance thresholds) live with the views that own
//! them, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known logical state keys.
pub mod keys {
    /// Orders currently being taken, prepared, or awaiting hand-off.
    pub const ACTIVE_ORDERS: &str = "activeOrders";
    /// The menu as shown on registers and customer devices.
    pub const MENU_ITEMS: &str = "menuItems";
    /// Dining table occupancy.
    pub const TABLES: &str = "tables";
    /// Stock levels maintained by the back office.
    pub const STOCK_ITEMS: &str = "stockItems";
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    DineIn,
    Pickup,
    Delivery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    pub subtotal: f64,
    pub total_amount: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(order_number: &str, order_type: OrderType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            order_number: order_number.to_string(),
            items: Vec::new(),
            status: OrderStatus::Pending,
            order_type,
            table_id: None,
            subtotal: 0.0,
            total_amount: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of line totals across all items.
    pub fn items_subtotal(&self) -> f64 {
        self.items
            .iter()
            .map(|item| item.price * f64::from(item.quantity))
            .sum()
    }

    pub fn item_count(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    /// Whether the order still needs kitchen or hand-off attention.
    pub fn is_open(&self) -> bool {
        !matches!(self.status, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Menu
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    pub category: String,
    pub price: f64,
    pub available: bool,
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Available,
    Occupied,
    Reserved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiningTable {
    pub id: String,
    pub name: String,
    pub seats: u32,
    pub status: TableStatus,
}

impl DiningTable {
    pub fn is_free(&self) -> bool {
        self.status == TableStatus::Available
    }
}

// ---------------------------------------------------------------------------
// Stock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockItem {
    pub id: String,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    pub low_stock_threshold: f64,
}

impl StockItem {
    pub fn is_low(&self) -> bool {
        self.quantity <= self.low_stock_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coffee(quantity: u32) -> OrderItem {
        OrderItem {
            name: "Coffee".to_string(),
            quantity,
            price: 2.5,
            notes: None,
        }
    }

    #[test]
    fn test_order_totals_and_counts() {
        let mut order = Order::new("ORD-06082026-00001", OrderType::Pickup);
        order.items.push(coffee(2));
        order.items.push(OrderItem {
            name: "Toast".to_string(),
            quantity: 1,
            price: 3.0,
            notes: Some("no butter".to_string()),
        });

        assert_eq!(order.item_count(), 3);
        assert!((order.items_subtotal() - 8.0).abs() < f64::EPSILON);
        assert!(order.is_open());

        order.status = OrderStatus::Completed;
        assert!(!order.is_open());
    }

    #[test]
    fn test_order_wire_shape_is_camel_case() {
        let order = Order::new("ORD-1", OrderType::DineIn);
        let wire = serde_json::to_value(&order).unwrap();
        assert!(wire.get("orderNumber").is_some());
        assert!(wire.get("totalAmount").is_some());
        assert!(wire.get("createdAt").is_some());
        assert_eq!(wire.get("orderType"), Some(&serde_json::json!("dine_in")));
        assert_eq!(wire.get("status"), Some(&serde_json::json!("pending")));
        // Unset optionals stay off the wire.
        assert!(wire.get("tableId").is_none());
    }

    #[test]
    fn test_order_round_trip() {
        let mut order = Order::new("ORD-2", OrderType::Delivery);
        order.items.push(coffee(1));
        order.table_id = Some("t-4".to_string());

        let raw = serde_json::to_string(&order).unwrap();
        let parsed: Order = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, order);
    }

    #[test]
    fn test_table_and_stock_helpers() {
        let table = DiningTable {
            id: "t-1".to_string(),
            name: "Window 1".to_string(),
            seats: 4,
            status: TableStatus::Available,
        };
        assert!(table.is_free());

        let flour = StockItem {
            id: "s-1".to_string(),
            name: "Flour".to_string(),
            quantity: 2.0,
            unit: "kg".to_string(),
            low_stock_threshold: 5.0,
        };
        assert!(flour.is_low());
    }
}
