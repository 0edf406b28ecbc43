use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMode {
    pub code: String,
    pub name: String,
}

/// Per-conversation checkout progress. At most one active cart per
/// conversation; a placed order consumes the cart, so the id is cleared and a
/// later cart-mutating call starts a fresh cart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutState {
    pub cart_id: Option<String>,
    pub delivery_modes: Vec<DeliveryMode>,
    pub last_order_code: Option<String>,
}

impl CheckoutState {
    pub fn clear_cart(&mut self) {
        self.cart_id = None;
        self.delivery_modes.clear();
    }
}
