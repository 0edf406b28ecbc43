use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use cartwheel_core::config::SessionConfig;
use cartwheel_core::domain::checkout::{CheckoutState, DeliveryMode};
use cartwheel_core::domain::conversation::{Conversation, ConversationId, Message};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),
}

struct SessionEntry {
    conversation: Conversation,
    checkout: CheckoutState,
    /// Serializes turn processing per conversation; also guards
    /// resolve-or-create of the cart id against duplicate creation.
    turn_lock: Arc<tokio::sync::Mutex<()>>,
    last_touched: DateTime<Utc>,
}

impl SessionEntry {
    fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            checkout: CheckoutState::default(),
            turn_lock: Arc::new(tokio::sync::Mutex::new(())),
            last_touched: Utc::now(),
        }
    }
}

/// In-memory store of conversations and their checkout state.
///
/// All per-conversation mutation goes through scoped accessors on this type;
/// nothing else holds the maps. Checkout state shares the conversation's
/// lifecycle and is deleted with it. Conversations are evicted LRU-style by
/// last update once the ceiling is exceeded.
pub struct SessionStore {
    config: SessionConfig,
    entries: RwLock<HashMap<ConversationId, SessionEntry>>,
    /// Guards the create-then-maybe-evict sequence.
    create_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self { config, entries: RwLock::new(HashMap::new()), create_lock: Mutex::new(()) }
    }

    pub fn create_conversation(&self, owner_id: Option<&str>) -> ConversationId {
        let _create_guard = self.create_lock.lock().expect("session create lock poisoned");
        let id = ConversationId::generate();
        let conversation = Conversation::new(id.clone(), owner_id.map(str::to_owned));

        let mut entries = self.entries.write().expect("session store lock poisoned");
        if entries.len() >= self.config.max_conversations {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_touched)
                .map(|(id, _)| id.clone());
            if let Some(victim) = oldest {
                entries.remove(&victim);
                info!(
                    event_name = "session.evicted",
                    conversation_id = %victim,
                    "conversation ceiling reached, evicted least recently updated"
                );
            }
        }
        entries.insert(id.clone(), SessionEntry::new(conversation));
        id
    }

    pub fn exists(&self, id: &ConversationId) -> bool {
        self.entries.read().expect("session store lock poisoned").contains_key(id)
    }

    /// Resolves the requested conversation or creates a fresh one. Returns
    /// the id and whether it was created.
    pub fn ensure_conversation(
        &self,
        requested: Option<&str>,
        owner_id: Option<&str>,
    ) -> (ConversationId, bool) {
        if let Some(raw) = requested {
            let id = ConversationId::from(raw);
            if self.exists(&id) {
                return (id, false);
            }
        }
        (self.create_conversation(owner_id), true)
    }

    pub fn append_message(
        &self,
        id: &ConversationId,
        message: Message,
    ) -> Result<(), SessionError> {
        self.with_entry_mut(id, |entry| {
            entry.conversation.push_bounded(message, self.config.max_messages);
        })
    }

    pub fn messages(&self, id: &ConversationId) -> Result<Vec<Message>, SessionError> {
        self.with_entry(id, |entry| entry.conversation.messages.clone())
    }

    pub fn recent_messages(
        &self,
        id: &ConversationId,
        count: usize,
    ) -> Result<Vec<Message>, SessionError> {
        self.with_entry(id, |entry| entry.conversation.recent(count).to_vec())
    }

    /// Empties the message history but keeps the conversation id and its
    /// checkout state alive.
    pub fn clear(&self, id: &ConversationId) -> Result<(), SessionError> {
        self.with_entry_mut(id, |entry| entry.conversation.messages.clear())
    }

    pub fn remove(&self, id: &ConversationId) {
        self.entries.write().expect("session store lock poisoned").remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("session store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn turn_lock(
        &self,
        id: &ConversationId,
    ) -> Result<Arc<tokio::sync::Mutex<()>>, SessionError> {
        self.with_entry(id, |entry| entry.turn_lock.clone())
    }

    pub fn cart_id(&self, id: &ConversationId) -> Result<Option<String>, SessionError> {
        self.with_entry(id, |entry| entry.checkout.cart_id.clone())
    }

    pub fn set_cart_id(&self, id: &ConversationId, cart_id: String) -> Result<(), SessionError> {
        self.with_entry_mut(id, |entry| entry.checkout.cart_id = Some(cart_id))
    }

    /// Invoked after a successful order placement: the cart has converted to
    /// an order and must never be reused.
    pub fn clear_cart(&self, id: &ConversationId) -> Result<(), SessionError> {
        self.with_entry_mut(id, |entry| entry.checkout.clear_cart())
    }

    pub fn delivery_modes(&self, id: &ConversationId) -> Result<Vec<DeliveryMode>, SessionError> {
        self.with_entry(id, |entry| entry.checkout.delivery_modes.clone())
    }

    pub fn set_delivery_modes(
        &self,
        id: &ConversationId,
        modes: Vec<DeliveryMode>,
    ) -> Result<(), SessionError> {
        self.with_entry_mut(id, |entry| entry.checkout.delivery_modes = modes)
    }

    pub fn last_order_code(&self, id: &ConversationId) -> Result<Option<String>, SessionError> {
        self.with_entry(id, |entry| entry.checkout.last_order_code.clone())
    }

    pub fn set_last_order_code(
        &self,
        id: &ConversationId,
        code: String,
    ) -> Result<(), SessionError> {
        self.with_entry_mut(id, |entry| entry.checkout.last_order_code = Some(code))
    }

    fn with_entry<T>(
        &self,
        id: &ConversationId,
        read: impl FnOnce(&SessionEntry) -> T,
    ) -> Result<T, SessionError> {
        let entries = self.entries.read().expect("session store lock poisoned");
        entries.get(id).map(read).ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    fn with_entry_mut<T>(
        &self,
        id: &ConversationId,
        mutate: impl FnOnce(&mut SessionEntry) -> T,
    ) -> Result<T, SessionError> {
        let mut entries = self.entries.write().expect("session store lock poisoned");
        match entries.get_mut(id) {
            Some(entry) => {
                entry.last_touched = Utc::now();
                Ok(mutate(entry))
            }
            None => Err(SessionError::NotFound(id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use cartwheel_core::config::SessionConfig;
    use cartwheel_core::domain::checkout::DeliveryMode;
    use cartwheel_core::domain::conversation::{ConversationId, Message};

    use super::{SessionError, SessionStore};

    fn store() -> SessionStore {
        SessionStore::new(SessionConfig {
            max_messages: 50,
            max_conversations: 1000,
            context_window: 10,
        })
    }

    #[test]
    fn append_to_unknown_conversation_is_not_found() {
        let store = store();
        let missing = ConversationId::from("missing");

        assert_eq!(
            store.append_message(&missing, Message::user("hi")),
            Err(SessionError::NotFound(missing))
        );
    }

    #[test]
    fn history_is_capped_and_prunes_plain_messages_first() {
        let store = SessionStore::new(SessionConfig {
            max_messages: 3,
            max_conversations: 10,
            context_window: 3,
        });
        let id = store.create_conversation(Some("u1"));

        store
            .append_message(&id, Message::user("pinned").as_system_context())
            .expect("append pinned");
        for index in 0..4 {
            store.append_message(&id, Message::user(format!("m{index}"))).expect("append");
        }

        let messages = store.messages(&id).expect("messages");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text(), "pinned");
        assert_eq!(messages[1].text(), "m2");
        assert_eq!(messages[2].text(), "m3");
    }

    #[test]
    fn clear_empties_messages_but_preserves_the_conversation() {
        let store = store();
        let id = store.create_conversation(None);
        store.append_message(&id, Message::user("hi")).expect("append");

        store.clear(&id).expect("clear");

        assert!(store.exists(&id));
        assert!(store.messages(&id).expect("messages").is_empty());
    }

    #[test]
    fn checkout_state_lives_and_dies_with_the_conversation() {
        let store = store();
        let id = store.create_conversation(Some("u1"));

        store.set_cart_id(&id, "cart-1".to_owned()).expect("set cart");
        store
            .set_delivery_modes(
                &id,
                vec![DeliveryMode { code: "standard".into(), name: "Standard".into() }],
            )
            .expect("set modes");
        store.set_last_order_code(&id, "00012345".to_owned()).expect("set code");

        assert_eq!(store.cart_id(&id).expect("cart"), Some("cart-1".to_owned()));
        assert_eq!(store.delivery_modes(&id).expect("modes").len(), 1);

        store.remove(&id);
        assert_eq!(store.cart_id(&id), Err(SessionError::NotFound(id)));
    }

    #[test]
    fn clear_cart_retires_the_cart_id() {
        let store = store();
        let id = store.create_conversation(None);
        store.set_cart_id(&id, "cart-1".to_owned()).expect("set cart");

        store.clear_cart(&id).expect("clear cart");

        assert_eq!(store.cart_id(&id).expect("cart"), None);
    }

    #[test]
    fn conversation_ceiling_evicts_least_recently_updated() {
        let store = SessionStore::new(SessionConfig {
            max_messages: 50,
            max_conversations: 2,
            context_window: 10,
        });

        let first = store.create_conversation(None);
        let second = store.create_conversation(None);
        // touch the first so the second becomes the eviction candidate
        store.append_message(&first, Message::user("keep me fresh")).expect("append");

        let third = store.create_conversation(None);

        assert_eq!(store.len(), 2);
        assert!(store.exists(&first));
        assert!(!store.exists(&second));
        assert!(store.exists(&third));
    }

    #[test]
    fn ensure_conversation_reuses_known_ids_and_creates_otherwise() {
        let store = store();
        let id = store.create_conversation(Some("u1"));

        let (resolved, created) = store.ensure_conversation(Some(&id.0), Some("u1"));
        assert_eq!(resolved, id);
        assert!(!created);

        let (fresh, created) = store.ensure_conversation(Some("unknown-id"), Some("u1"));
        assert_ne!(fresh, id);
        assert!(created);
    }
}
