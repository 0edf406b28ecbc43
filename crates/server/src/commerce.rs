//! reqwest-backed commerce backend: pure field mapping from the tool catalog
//! to the store's REST surface. No orchestration semantics live here.

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use cartwheel_agent::gateway::{BackendError, CommerceBackend};
use cartwheel_core::config::CommerceConfig;
use cartwheel_core::domain::tool::ToolKind;

pub struct HttpCommerceBackend {
    client: reqwest::Client,
    base_url: String,
    site_id: String,
    api_token: Option<SecretString>,
}

impl HttpCommerceBackend {
    pub fn from_config(config: &CommerceConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            site_id: config.site_id.clone(),
            api_token: config.api_token.clone(),
        })
    }
}

/// One routed REST call: method, site-relative path (with query), body.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

fn argument_str<'a>(arguments: &'a Value, key: &str) -> &'a str {
    arguments.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Maps a tool invocation onto the store's REST surface. Cart-scoped calls
/// expect `cart_id` to have been injected by the orchestration engine.
pub fn route(tool: ToolKind, arguments: &Value, site_id: &str) -> RoutedCall {
    let cart_id = arguments.get("cart_id").and_then(Value::as_str).unwrap_or("current");
    match tool {
        ToolKind::SearchProducts => {
            let query = argument_str(arguments, "query");
            let page_size = arguments.get("page_size").and_then(Value::as_u64).unwrap_or(10);
            RoutedCall {
                method: Method::GET,
                path: format!("/{site_id}/products/search?query={query}&pageSize={page_size}"),
                body: None,
            }
        }
        ToolKind::GetProduct => RoutedCall {
            method: Method::GET,
            path: format!("/{site_id}/products/{}", argument_str(arguments, "product_code")),
            body: None,
        },
        ToolKind::ListCategories => RoutedCall {
            method: Method::GET,
            path: format!("/{site_id}/categories"),
            body: None,
        },
        ToolKind::ListCountries => RoutedCall {
            method: Method::GET,
            path: format!("/{site_id}/countries"),
            body: None,
        },
        ToolKind::GetSiteConfig => RoutedCall {
            method: Method::GET,
            path: format!("/{site_id}/config"),
            body: None,
        },
        ToolKind::GetCart => RoutedCall {
            method: Method::GET,
            path: format!("/{site_id}/carts/{cart_id}"),
            body: None,
        },
        ToolKind::CreateCart => RoutedCall {
            method: Method::POST,
            path: format!("/{site_id}/carts"),
            body: Some(json!({})),
        },
        ToolKind::AddCartEntry => RoutedCall {
            method: Method::POST,
            path: format!("/{site_id}/carts/{cart_id}/entries"),
            body: Some(json!({
                "product_code": argument_str(arguments, "product_code"),
                "quantity": arguments.get("quantity").and_then(Value::as_u64).unwrap_or(1),
            })),
        },
        ToolKind::SetDeliveryAddress => {
            let mut body = arguments.clone();
            if let Some(fields) = body.as_object_mut() {
                fields.remove("cart_id");
            }
            RoutedCall {
                method: Method::POST,
                path: format!("/{site_id}/carts/{cart_id}/addresses/delivery"),
                body: Some(body),
            }
        }
        ToolKind::GetDeliveryModes => RoutedCall {
            method: Method::GET,
            path: format!("/{site_id}/carts/{cart_id}/deliverymodes"),
            body: None,
        },
        ToolKind::SetDeliveryMode => RoutedCall {
            method: Method::PUT,
            path: format!("/{site_id}/carts/{cart_id}/deliverymode"),
            body: Some(json!({ "delivery_code": argument_str(arguments, "delivery_code") })),
        },
        ToolKind::SetPaymentDetails => {
            let mut body = arguments.clone();
            if let Some(fields) = body.as_object_mut() {
                fields.remove("cart_id");
            }
            RoutedCall {
                method: Method::POST,
                path: format!("/{site_id}/carts/{cart_id}/paymentdetails"),
                body: Some(body),
            }
        }
        ToolKind::PlaceOrder => RoutedCall {
            method: Method::POST,
            path: format!("/{site_id}/orders"),
            body: Some(json!({ "cart_id": cart_id })),
        },
        ToolKind::OrderHistory => {
            let page_size = arguments.get("page_size").and_then(Value::as_u64).unwrap_or(10);
            RoutedCall {
                method: Method::GET,
                path: format!("/{site_id}/users/current/orders?pageSize={page_size}"),
                body: None,
            }
        }
        ToolKind::OrderStatus => RoutedCall {
            method: Method::GET,
            path: format!(
                "/{site_id}/users/current/orders/{}",
                argument_str(arguments, "order_code")
            ),
            body: None,
        },
    }
}

#[async_trait]
impl CommerceBackend for HttpCommerceBackend {
    async fn call(
        &self,
        tool: ToolKind,
        arguments: &Value,
        access_token: Option<&str>,
    ) -> Result<Value, BackendError> {
        let routed = route(tool, arguments, &self.site_id);
        let url = format!("{}{}", self.base_url, routed.path);

        let mut request = self.client.request(routed.method, &url);
        if let Some(body) = &routed.body {
            request = request.json(body);
        }
        // the caller's token carries end-user identity; the service token is
        // the fallback for anonymous traffic
        match (access_token, &self.api_token) {
            (Some(token), _) => request = request.bearer_auth(token),
            (None, Some(token)) => request = request.bearer_auth(token.expose_secret()),
            (None, None) => {}
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Transport(error.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| BackendError::Transport(error.to_string()))?;

        if !status.is_success() {
            return Err(BackendError::Status { status: status.as_u16(), message: text });
        }

        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text })))
    }
}
