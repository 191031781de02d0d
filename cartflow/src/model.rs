//! Cart mutations and the versioned update requests that carry them downstream.
//!
//! A [`MutationAction`] is the unit a caller submits to the coordinator: a product and a signed
//! quantity delta. A [`CartUpdateRequest`] is the unit that travels on the event stream: the
//! entries applied to one user's cart, tagged with the optimistic-concurrency version a
//! consumer must see as the exact successor of the last version it applied.
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// A single change to a cart line.
///
/// A zero adjustment is admissible and has no material effect downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationAction {
    product_id: String,
    quantity_adjustment: i64,
}

impl MutationAction {
    /// Creates a new action adjusting the quantity of `product_id` by `quantity_adjustment`.
    pub fn new(product_id: impl Into<String>, quantity_adjustment: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity_adjustment,
        }
    }

    /// Returns the product the action applies to.
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Returns the signed quantity delta.
    pub fn quantity_adjustment(&self) -> i64 {
        self.quantity_adjustment
    }

    /// Returns true if applying the action has no effect.
    pub fn is_noop(&self) -> bool {
        self.quantity_adjustment == 0
    }
}

/// The kind of change carried by a [`CartEntry`].
///
/// The set is open: a tag this library does not know is kept verbatim as
/// [`ActionKind::Unsupported`] instead of failing the decode, so consumers can report it as a
/// distinct outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    QtyChange,
    Add,
    Remove,
    DropItem,
    AbandonCart,
    Unsupported(String),
}

impl ActionKind {
    /// Returns the wire tag of the kind.
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::QtyChange => "QTY_CHANGE",
            ActionKind::Add => "ADD",
            ActionKind::Remove => "REMOVE",
            ActionKind::DropItem => "DROP_ITEM",
            ActionKind::AbandonCart => "ABANDON_CART",
            ActionKind::Unsupported(tag) => tag,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, ActionKind::Unsupported(_))
    }
}

impl From<String> for ActionKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "QTY_CHANGE" => ActionKind::QtyChange,
            "ADD" => ActionKind::Add,
            "REMOVE" => ActionKind::Remove,
            "DROP_ITEM" => ActionKind::DropItem,
            "ABANDON_CART" => ActionKind::AbandonCart,
            _ => ActionKind::Unsupported(tag),
        }
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Unsupported(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a consumer is expected to do with a [`CartEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The entry changes the cart.
    Apply,
    /// The entry is a quantity change of zero.
    NoOp,
    /// The entry carries a kind the consumer does not know how to apply.
    Unsupported(String),
}

/// One line of a [`CartUpdateRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartEntry {
    pub product_id: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(alias = "quantityAdjustment")]
    pub qty_adjustment: i64,
    #[serde(alias = "actionKind")]
    pub action: ActionKind,
}

impl CartEntry {
    pub fn new(
        product_id: impl Into<String>,
        product_name: impl Into<String>,
        qty_adjustment: i64,
        action: ActionKind,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            product_name: product_name.into(),
            qty_adjustment,
            action,
        }
    }

    /// Creates a `QTY_CHANGE` entry.
    pub fn qty_change(
        product_id: impl Into<String>,
        product_name: impl Into<String>,
        qty_adjustment: i64,
    ) -> Self {
        Self::new(product_id, product_name, qty_adjustment, ActionKind::QtyChange)
    }

    /// Classifies the entry for a consumer.
    pub fn outcome(&self) -> EntryOutcome {
        match &self.action {
            ActionKind::Unsupported(tag) => EntryOutcome::Unsupported(tag.clone()),
            ActionKind::QtyChange | ActionKind::Add | ActionKind::Remove
                if self.qty_adjustment == 0 =>
            {
                EntryOutcome::NoOp
            }
            _ => EntryOutcome::Apply,
        }
    }
}

impl From<MutationAction> for CartEntry {
    fn from(action: MutationAction) -> Self {
        CartEntry::qty_change(action.product_id, "", action.quantity_adjustment)
    }
}

/// A versioned batch of changes to one user's cart.
///
/// `user_id` identifies the cart and is the partition key of the request on the event stream.
/// `version_number` is the optimistic-concurrency token: a consumer applies the request only
/// if it is exactly one unit ahead of the last version it applied for the same user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartUpdateRequest {
    pub user_id: String,
    pub version_number: u64,
    #[serde(default)]
    pub entries: Vec<CartEntry>,
}

impl CartUpdateRequest {
    /// Creates a request without entries.
    pub fn new(user_id: impl Into<String>, version_number: u64) -> Self {
        Self {
            user_id: user_id.into(),
            version_number,
            entries: vec![],
        }
    }

    /// Appends an entry to the request.
    pub fn with_entry(mut self, entry: impl Into<CartEntry>) -> Self {
        self.entries.push(entry.into());
        self
    }

    /// Returns the ids of the products touched by the request, in entry order.
    pub fn product_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.product_id.as_str()).collect()
    }

    /// Returns the bytes used to route the request to its ordered lane.
    pub fn partition_key(&self) -> &[u8] {
        self.user_id.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;

    #[test]
    fn it_serializes_requests_with_wire_field_names() {
        let request =
            CartUpdateRequest::new("user_1", 1).with_entry(CartEntry::qty_change("P001", "Laptop", 1));

        let json = serde_json::to_value(&request).unwrap();

        check!(
            json == serde_json::json!({
                "userId": "user_1",
                "versionNumber": 1,
                "entries": [{
                    "productId": "P001",
                    "productName": "Laptop",
                    "qtyAdjustment": 1,
                    "action": "QTY_CHANGE"
                }]
            })
        );
    }

    #[test]
    fn it_reads_entries_with_long_field_names() {
        let entry: CartEntry = serde_json::from_value(serde_json::json!({
            "productId": "P001",
            "productName": "Laptop",
            "quantityAdjustment": 2,
            "actionKind": "QTY_CHANGE"
        }))
        .unwrap();

        check!(entry == CartEntry::qty_change("P001", "Laptop", 2));
        check!(serde_json::to_value(&entry).unwrap()["qtyAdjustment"] == 2);
    }

    #[test]
    fn it_keeps_unknown_action_kinds() {
        let entry: CartEntry = serde_json::from_value(serde_json::json!({
            "productId": "P001",
            "productName": "Laptop",
            "qtyAdjustment": 1,
            "action": "GIFT_WRAP"
        }))
        .unwrap();

        check!(entry.action == ActionKind::Unsupported("GIFT_WRAP".to_string()));
        check!(!entry.action.is_supported());
        check!(entry.outcome() == EntryOutcome::Unsupported("GIFT_WRAP".to_string()));
        check!(serde_json::to_value(&entry).unwrap()["action"] == "GIFT_WRAP");
    }

    #[test]
    fn it_classifies_zero_adjustments_as_noop() {
        check!(CartEntry::qty_change("P001", "Laptop", 0).outcome() == EntryOutcome::NoOp);
        check!(CartEntry::qty_change("P001", "Laptop", -3).outcome() == EntryOutcome::Apply);
        check!(
            CartEntry::new("P001", "Laptop", 0, ActionKind::DropItem).outcome()
                == EntryOutcome::Apply
        );
    }

    #[test]
    fn it_converts_a_mutation_action_into_a_quantity_change() {
        let action = MutationAction::new("P002", -2);
        check!(!action.is_noop());

        let entry = CartEntry::from(action);

        check!(entry == CartEntry::qty_change("P002", "", -2));
    }

    #[test]
    fn it_lists_product_ids_in_entry_order() {
        let request = CartUpdateRequest::new("user_1", 4)
            .with_entry(CartEntry::qty_change("P002", "Mouse", 1))
            .with_entry(MutationAction::new("P001", 3));

        check!(request.product_ids() == vec!["P002", "P001"]);
        check!(request.partition_key() == b"user_1");
    }

    #[test]
    fn it_accepts_requests_without_entries_or_product_names() {
        let request: CartUpdateRequest = serde_json::from_str(
            r#"{"userId":"user_9","versionNumber":7,"entries":[{"productId":"P1","qtyAdjustment":2,"action":"ADD"}]}"#,
        )
        .unwrap();
        check!(request.entries[0].product_name == "");
        check!(request.entries[0].action == ActionKind::Add);

        let empty: CartUpdateRequest =
            serde_json::from_str(r#"{"userId":"user_9","versionNumber":8}"#).unwrap();
        check!(empty.entries.is_empty());
    }
}
