use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Closed catalog of remote commerce operations the engine may invoke.
///
/// Dispatch is by tagged variant, never by untyped string lookup; unknown
/// names from the completion provider fail at the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    SearchProducts,
    GetProduct,
    ListCategories,
    ListCountries,
    GetSiteConfig,
    GetCart,
    CreateCart,
    AddCartEntry,
    SetDeliveryAddress,
    GetDeliveryModes,
    SetDeliveryMode,
    SetPaymentDetails,
    PlaceOrder,
    OrderHistory,
    OrderStatus,
}

impl ToolKind {
    pub const ALL: [ToolKind; 15] = [
        Self::SearchProducts,
        Self::GetProduct,
        Self::ListCategories,
        Self::ListCountries,
        Self::GetSiteConfig,
        Self::GetCart,
        Self::CreateCart,
        Self::AddCartEntry,
        Self::SetDeliveryAddress,
        Self::GetDeliveryModes,
        Self::SetDeliveryMode,
        Self::SetPaymentDetails,
        Self::PlaceOrder,
        Self::OrderHistory,
        Self::OrderStatus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::SearchProducts => "search_products",
            Self::GetProduct => "get_product",
            Self::ListCategories => "list_categories",
            Self::ListCountries => "list_countries",
            Self::GetSiteConfig => "get_site_config",
            Self::GetCart => "get_cart",
            Self::CreateCart => "create_cart",
            Self::AddCartEntry => "add_cart_entry",
            Self::SetDeliveryAddress => "set_delivery_address",
            Self::GetDeliveryModes => "get_delivery_modes",
            Self::SetDeliveryMode => "set_delivery_mode",
            Self::SetPaymentDetails => "set_payment_details",
            Self::PlaceOrder => "place_order",
            Self::OrderHistory => "order_history",
            Self::OrderStatus => "order_status",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    /// Tools gated behind the caller's authentication flag. The flag is
    /// carried on the request, never inferred from conversation content.
    pub fn requires_auth(&self) -> bool {
        matches!(self, Self::OrderHistory | Self::OrderStatus | Self::PlaceOrder)
    }

    /// Read-only catalog/location lookups that are safe to serve from cache.
    /// Cart, checkout, and order operations are never cached.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            Self::SearchProducts
                | Self::GetProduct
                | Self::ListCategories
                | Self::ListCountries
                | Self::GetSiteConfig
        )
    }

    /// Operations addressed to a specific cart; the engine injects the
    /// conversation's cart id before dispatch.
    pub fn is_cart_scoped(&self) -> bool {
        matches!(
            self,
            Self::GetCart
                | Self::AddCartEntry
                | Self::SetDeliveryAddress
                | Self::GetDeliveryModes
                | Self::SetDeliveryMode
                | Self::SetPaymentDetails
                | Self::PlaceOrder
        )
    }

    /// Cart-mutating operations create a cart transparently when the
    /// conversation has none yet.
    pub fn mutates_cart(&self) -> bool {
        matches!(
            self,
            Self::AddCartEntry
                | Self::SetDeliveryAddress
                | Self::SetDeliveryMode
                | Self::SetPaymentDetails
                | Self::PlaceOrder
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::SearchProducts => "Search the product catalog by free-text query",
            Self::GetProduct => "Fetch one product by its code",
            Self::ListCategories => "List the store's category tree",
            Self::ListCountries => "List supported delivery countries",
            Self::GetSiteConfig => "Fetch store-wide configuration (currency, locale)",
            Self::GetCart => "Show the current cart contents",
            Self::CreateCart => "Create a new empty cart",
            Self::AddCartEntry => "Add a product to the cart",
            Self::SetDeliveryAddress => "Set the cart's delivery address",
            Self::GetDeliveryModes => "List delivery modes available for the cart",
            Self::SetDeliveryMode => "Select a delivery mode by its code",
            Self::SetPaymentDetails => "Attach payment details to the cart",
            Self::PlaceOrder => "Place the order for the current cart",
            Self::OrderHistory => "List the customer's past orders",
            Self::OrderStatus => "Look up one order by its code",
        }
    }

    pub fn argument_schema(&self) -> Value {
        match self {
            Self::SearchProducts => object_schema(
                json!({
                    "query": { "type": "string", "description": "Free-text search query" },
                    "page_size": { "type": "integer", "minimum": 1, "maximum": 50 }
                }),
                &["query"],
            ),
            Self::GetProduct => object_schema(
                json!({ "product_code": { "type": "string" } }),
                &["product_code"],
            ),
            Self::ListCategories | Self::ListCountries | Self::GetSiteConfig => {
                object_schema(json!({}), &[])
            }
            Self::GetCart | Self::CreateCart | Self::GetDeliveryModes | Self::PlaceOrder => {
                object_schema(json!({}), &[])
            }
            Self::AddCartEntry => object_schema(
                json!({
                    "product_code": { "type": "string" },
                    "quantity": { "type": "integer", "minimum": 1, "default": 1 }
                }),
                &["product_code"],
            ),
            Self::SetDeliveryAddress => object_schema(
                json!({
                    "first_name": { "type": "string" },
                    "last_name": { "type": "string" },
                    "line1": { "type": "string" },
                    "town": { "type": "string" },
                    "postal_code": { "type": "string" },
                    "country_code": { "type": "string" }
                }),
                &["line1", "town", "postal_code", "country_code"],
            ),
            Self::SetDeliveryMode => object_schema(
                json!({ "delivery_code": { "type": "string" } }),
                &["delivery_code"],
            ),
            Self::SetPaymentDetails => object_schema(
                json!({
                    "account_holder": { "type": "string" },
                    "card_number": { "type": "string" },
                    "expiry_month": { "type": "string" },
                    "expiry_year": { "type": "string" }
                }),
                &["account_holder", "card_number", "expiry_month", "expiry_year"],
            ),
            Self::OrderHistory => object_schema(
                json!({ "page_size": { "type": "integer", "minimum": 1, "maximum": 20 } }),
                &[],
            ),
            Self::OrderStatus => {
                object_schema(json!({ "order_code": { "type": "string" } }), &["order_code"])
            }
        }
    }

    /// The catalog offered to the completion provider for one turn.
    pub fn catalog_for(authenticated: bool) -> Vec<ToolKind> {
        Self::ALL
            .iter()
            .copied()
            .filter(|kind| authenticated || !kind.requires_auth())
            .collect()
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub kind: ToolKind,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, kind: ToolKind, arguments: Value) -> Self {
        Self { id: id.into(), kind, arguments }
    }
}

/// Result of one tool execution. Errors never cross this boundary as `Err`;
/// they are encoded in the payload so the completion provider can react.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub content: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: Value) -> Self {
        Self { content, is_error: false }
    }

    pub fn error(content: Value) -> Self {
        Self { content, is_error: true }
    }
}

#[cfg(test)]
mod tests {
    use super::ToolKind;

    #[test]
    fn names_round_trip_through_parse() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::parse("drop_database"), None);
    }

    #[test]
    fn anonymous_catalog_excludes_order_tools() {
        let catalog = ToolKind::catalog_for(false);
        assert!(!catalog.contains(&ToolKind::OrderStatus));
        assert!(!catalog.contains(&ToolKind::OrderHistory));
        assert!(!catalog.contains(&ToolKind::PlaceOrder));
        assert!(catalog.contains(&ToolKind::SearchProducts));
        assert!(catalog.contains(&ToolKind::AddCartEntry));
    }

    #[test]
    fn authenticated_catalog_is_complete() {
        assert_eq!(ToolKind::catalog_for(true).len(), ToolKind::ALL.len());
    }

    #[test]
    fn mutations_are_never_cacheable() {
        for kind in ToolKind::ALL {
            assert!(
                !(kind.is_cacheable() && kind.mutates_cart()),
                "{kind} is both cacheable and cart-mutating"
            );
        }
    }

    #[test]
    fn every_tool_declares_an_object_schema() {
        for kind in ToolKind::ALL {
            let schema = kind.argument_schema();
            assert_eq!(schema["type"], "object", "{kind} schema is not an object");
            assert!(schema["required"].is_array());
        }
    }
}
