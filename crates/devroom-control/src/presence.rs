//! Presence and room registry.
//!
//! [`PresenceRegistry`] is the process-wide table of live connections and
//! their topic subscriptions. It is one explicitly constructed object shared by
//! every namespace. All state sits behind a single mutex so that a disconnect
//! removes a connection from every topic at once: a concurrent subscribe on the
//! same connection either lands before the disconnect (and is removed with it)
//! or fails with `ConnectionClosed`.
//!
//! [`Presence`] layers the store-backed access check on top: `join` recomputes
//! the caller's room access on every call.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use devroom_core::{ConnectionId, UserId};
use devroom_store::{PublicUser, Store};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::access::{self, RoomAccess};
use crate::error::{ControlError, Result};
use crate::events::{Namespace, ServerEvent, Topic};

/// Per-connection outbound queue.
pub type Outbox = mpsc::UnboundedSender<Arc<ServerEvent>>;

struct ConnectionEntry {
    user: Option<PublicUser>,
    outbox: Outbox,
    topics: BTreeSet<Topic>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    topics: HashMap<Topic, BTreeSet<ConnectionId>>,
}

impl RegistryState {
    fn remove_from_topic(&mut self, topic: &Topic, conn: &ConnectionId) {
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(conn);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    fn distinct_users(&self, topic: &Topic) -> Vec<PublicUser> {
        let mut seen = BTreeSet::new();
        let mut users = Vec::new();
        for conn in self.topics.get(topic).into_iter().flatten() {
            if let Some(user) = self.connections.get(conn).and_then(|c| c.user.as_ref()) {
                if seen.insert(user.id) {
                    users.push(user.clone());
                }
            }
        }
        users
    }
}

/// What a disconnect removed.
#[derive(Debug, Clone)]
pub struct Departure {
    /// The connection's identity, if it had authenticated.
    pub user: Option<PublicUser>,
    /// Topics it was subscribed to.
    pub topics: Vec<Topic>,
}

/// Process-local table of connections and topic subscriptions.
#[derive(Default)]
pub struct PresenceRegistry {
    state: Mutex<RegistryState>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, not yet authenticated connection.
    pub fn connect(&self, outbox: Outbox) -> ConnectionId {
        let conn = ConnectionId::generate();
        self.state.lock().connections.insert(
            conn,
            ConnectionEntry {
                user: None,
                outbox,
                topics: BTreeSet::new(),
            },
        );
        conn
    }

    /// Attach a verified identity to a connection.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the connection is gone, or `Forbidden` if
    /// it already authenticated as someone else.
    pub fn authenticate(&self, conn: ConnectionId, user: PublicUser) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .connections
            .get_mut(&conn)
            .ok_or(ControlError::ConnectionClosed(conn))?;

        match &entry.user {
            Some(existing) if existing.id != user.id => Err(ControlError::Forbidden(
                "connection is bound to another user".to_string(),
            )),
            _ => {
                entry.user = Some(user);
                Ok(())
            }
        }
    }

    /// The identity of a connection.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the connection is gone, or
    /// `Unauthenticated` if it has no identity yet.
    pub fn identity(&self, conn: ConnectionId) -> Result<PublicUser> {
        let state = self.state.lock();
        let entry = state
            .connections
            .get(&conn)
            .ok_or(ControlError::ConnectionClosed(conn))?;
        entry.user.clone().ok_or(ControlError::Unauthenticated)
    }

    /// Subscribe a connection to a topic.
    ///
    /// Returns the distinct users present in the topic after subscribing.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the connection is gone.
    pub fn subscribe(&self, conn: ConnectionId, topic: Topic) -> Result<Vec<PublicUser>> {
        let mut state = self.state.lock();
        let entry = state
            .connections
            .get_mut(&conn)
            .ok_or(ControlError::ConnectionClosed(conn))?;
        entry.topics.insert(topic);
        state.topics.entry(topic).or_default().insert(conn);
        Ok(state.distinct_users(&topic))
    }

    /// Unsubscribe a connection from a topic. Returns false if it wasn't subscribed.
    pub fn unsubscribe(&self, conn: ConnectionId, topic: &Topic) -> bool {
        let mut state = self.state.lock();
        let removed = state
            .connections
            .get_mut(&conn)
            .is_some_and(|entry| entry.topics.remove(topic));
        if removed {
            state.remove_from_topic(topic, &conn);
        }
        removed
    }

    /// Whether a connection is subscribed to a topic.
    #[must_use]
    pub fn is_subscribed(&self, conn: ConnectionId, topic: &Topic) -> bool {
        self.state
            .lock()
            .connections
            .get(&conn)
            .is_some_and(|entry| entry.topics.contains(topic))
    }

    /// Remove a connection from every topic and forget it.
    pub fn disconnect(&self, conn: ConnectionId) -> Option<Departure> {
        let mut state = self.state.lock();
        let entry = state.connections.remove(&conn)?;
        for topic in &entry.topics {
            state.remove_from_topic(topic, &conn);
        }
        Some(Departure {
            user: entry.user,
            topics: entry.topics.into_iter().collect(),
        })
    }

    /// Deliver an event to every subscriber of `topic` except `exclude`.
    ///
    /// Returns the number of outboxes the event was queued on. Closed outboxes
    /// belong to connections that are going away and are skipped.
    pub fn broadcast(&self, topic: &Topic, event: ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let event = Arc::new(event);
        let state = self.state.lock();
        let Some(members) = state.topics.get(topic) else {
            return 0;
        };

        members
            .iter()
            .filter(|conn| Some(**conn) != exclude)
            .filter_map(|conn| state.connections.get(conn))
            .filter(|entry| entry.outbox.send(Arc::clone(&event)).is_ok())
            .count()
    }

    /// Deliver an event once to every connection subscribed to any of
    /// `topics`, except `exclude`.
    pub fn broadcast_all(
        &self,
        topics: &[Topic],
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let event = Arc::new(event);
        let state = self.state.lock();
        let recipients: BTreeSet<ConnectionId> = topics
            .iter()
            .filter_map(|topic| state.topics.get(topic))
            .flatten()
            .copied()
            .filter(|conn| Some(*conn) != exclude)
            .collect();

        recipients
            .iter()
            .filter_map(|conn| state.connections.get(conn))
            .filter(|entry| entry.outbox.send(Arc::clone(&event)).is_ok())
            .count()
    }

    /// Deliver an event to a single connection.
    pub fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        self.state
            .lock()
            .connections
            .get(&conn)
            .is_some_and(|entry| entry.outbox.send(Arc::new(event)).is_ok())
    }

    /// Distinct users currently subscribed to a topic.
    #[must_use]
    pub fn room_members(&self, topic: &Topic) -> Vec<PublicUser> {
        self.state.lock().distinct_users(topic)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Number of topics with at least one subscriber.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.state.lock().topics.len()
    }

    /// Drop every connection. Their outboxes close, which ends their writers.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.connections.len();
        state.connections.clear();
        state.topics.clear();
        count
    }
}

/// Result of a successful join.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    /// Room joined.
    pub room_id: devroom_core::RoomId,
    /// Namespace joined through.
    pub namespace: Namespace,
    /// The caller's access.
    pub access: RoomAccess,
    /// Users present, including the caller.
    pub members: Vec<PublicUser>,
}

/// Store-backed join/leave on top of the registry.
pub struct Presence<S: Store> {
    store: Arc<S>,
    registry: Arc<PresenceRegistry>,
}

impl<S: Store> Presence<S> {
    /// Create the presence service.
    #[must_use]
    pub fn new(store: Arc<S>, registry: Arc<PresenceRegistry>) -> Self {
        Self { store, registry }
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the shared registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    /// The public identity of a user, falling back to a placeholder when the
    /// store has no profile.
    #[must_use]
    pub fn public_user(&self, user_id: &UserId) -> PublicUser {
        match self.store.get_user(user_id) {
            Ok(Some(user)) => user.public(),
            Ok(None) => PublicUser::anonymous(*user_id),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to load user profile");
                PublicUser::anonymous(*user_id)
            }
        }
    }

    /// Bind a verified user to a connection.
    ///
    /// # Errors
    ///
    /// See [`PresenceRegistry::authenticate`].
    pub fn authenticate(&self, conn: ConnectionId, user_id: &UserId) -> Result<PublicUser> {
        let user = self.public_user(user_id);
        self.registry.authenticate(conn, user.clone())?;
        Ok(user)
    }

    /// Join a room through a namespace.
    ///
    /// Access is recomputed from the store. On success the caller is
    /// subscribed and every other subscriber receives `member-joined`.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated`, `NotFound` (unknown room), `Forbidden`
    /// (no access; nothing is subscribed), or `ConnectionClosed` if the
    /// connection disconnected concurrently.
    pub fn join(&self, conn: ConnectionId, topic: Topic) -> Result<Membership> {
        let user = self.registry.identity(conn)?;
        let (_, access) = access::load_room(self.store.as_ref(), &topic.room_id, &user.id)?;

        let members = self.registry.subscribe(conn, topic)?;

        tracing::debug!(
            connection_id = %conn,
            topic = %topic,
            user_id = %user.id,
            "Joined room"
        );

        self.registry.broadcast(
            &topic,
            ServerEvent::MemberJoined {
                room_id: topic.room_id,
                user,
                at: Utc::now(),
            },
            Some(conn),
        );

        Ok(Membership {
            room_id: topic.room_id,
            namespace: topic.namespace,
            access,
            members,
        })
    }

    /// Leave a room. Leaving a room the connection isn't in is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` or `Unauthenticated` for unknown connections.
    pub fn leave(&self, conn: ConnectionId, topic: Topic) -> Result<()> {
        let user = self.registry.identity(conn)?;
        if self.registry.unsubscribe(conn, &topic) {
            tracing::debug!(connection_id = %conn, topic = %topic, "Left room");
            self.registry.broadcast(
                &topic,
                ServerEvent::MemberLeft {
                    room_id: topic.room_id,
                    user,
                    at: Utc::now(),
                },
                None,
            );
        }
        Ok(())
    }

    /// Forget a connection, implicitly leaving every room it was in.
    pub fn disconnect(&self, conn: ConnectionId) -> Option<Departure> {
        let departure = self.registry.disconnect(conn)?;

        if let Some(user) = &departure.user {
            for topic in &departure.topics {
                self.registry.broadcast(
                    topic,
                    ServerEvent::MemberLeft {
                        room_id: topic.room_id,
                        user: user.clone(),
                        at: Utc::now(),
                    },
                    None,
                );
            }
        }

        tracing::debug!(
            connection_id = %conn,
            rooms = departure.topics.len(),
            "Connection closed"
        );
        Some(departure)
    }

    /// Check that a connection may act in a room it has joined.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated`, `Forbidden` (not joined, access revoked or
    /// read-only when `write` is set), or `NotFound`.
    pub fn authorize(
        &self,
        conn: ConnectionId,
        topic: &Topic,
        write: bool,
    ) -> Result<(PublicUser, RoomAccess)> {
        let user = self.registry.identity(conn)?;
        if !self.registry.is_subscribed(conn, topic) {
            return Err(ControlError::Forbidden(format!(
                "join room {} first",
                topic.room_id
            )));
        }

        let (_, access) = access::load_room(self.store.as_ref(), &topic.room_id, &user.id)?;
        if write {
            access::require_write(access, &topic.room_id)?;
        }
        Ok((user, access))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain_events, Fixture};
    use devroom_core::RoomId;

    fn outbox() -> (Outbox, mpsc::UnboundedReceiver<Arc<ServerEvent>>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn broadcast_excludes_sender_and_other_topics() {
        let registry = PresenceRegistry::new();
        let room = RoomId::generate();
        let topic = Topic::collab(room);

        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();
        let (tx_c, mut rx_c) = outbox();
        let a = registry.connect(tx_a);
        let b = registry.connect(tx_b);
        let c = registry.connect(tx_c);

        registry.subscribe(a, topic).unwrap();
        registry.subscribe(b, topic).unwrap();
        registry.subscribe(c, Topic::deploy(room)).unwrap();

        let event = ServerEvent::MemberLeft {
            room_id: room,
            user: PublicUser::anonymous(UserId::generate()),
            at: Utc::now(),
        };
        assert_eq!(registry.broadcast(&topic, event, Some(a)), 1);

        assert!(drain_events(&mut rx_a).is_empty());
        assert_eq!(drain_events(&mut rx_b).len(), 1);
        assert!(drain_events(&mut rx_c).is_empty());
    }

    #[test]
    fn broadcast_all_delivers_once_per_connection() {
        let registry = PresenceRegistry::new();
        let room = RoomId::generate();
        let topics = [Topic::bridge(room), Topic::collab(room)];

        let (tx_both, mut rx_both) = outbox();
        let (tx_one, mut rx_one) = outbox();
        let both = registry.connect(tx_both);
        let one = registry.connect(tx_one);
        registry.subscribe(both, topics[0]).unwrap();
        registry.subscribe(both, topics[1]).unwrap();
        registry.subscribe(one, topics[1]).unwrap();

        let event = ServerEvent::MemberLeft {
            room_id: room,
            user: PublicUser::anonymous(UserId::generate()),
            at: Utc::now(),
        };
        assert_eq!(registry.broadcast_all(&topics, event, None), 2);
        assert_eq!(drain_events(&mut rx_both).len(), 1);
        assert_eq!(drain_events(&mut rx_one).len(), 1);
    }

    #[test]
    fn disconnect_removes_every_subscription() {
        let registry = PresenceRegistry::new();
        let (tx, _rx) = outbox();
        let conn = registry.connect(tx);
        let user = PublicUser::anonymous(UserId::generate());
        registry.authenticate(conn, user.clone()).unwrap();

        let room = RoomId::generate();
        registry.subscribe(conn, Topic::collab(room)).unwrap();
        registry.subscribe(conn, Topic::bridge(room)).unwrap();
        assert_eq!(registry.topic_count(), 2);

        let departure = registry.disconnect(conn).unwrap();
        assert_eq!(departure.topics.len(), 2);
        assert_eq!(departure.user, Some(user));
        assert_eq!(registry.topic_count(), 0);
        assert_eq!(registry.connection_count(), 0);

        // A subscribe racing behind the disconnect cannot resurrect membership
        let result = registry.subscribe(conn, Topic::collab(room));
        assert!(matches!(result, Err(ControlError::ConnectionClosed(_))));
        assert!(registry.room_members(&Topic::collab(room)).is_empty());
    }

    #[test]
    fn authenticate_cannot_switch_users() {
        let registry = PresenceRegistry::new();
        let (tx, _rx) = outbox();
        let conn = registry.connect(tx);

        assert!(matches!(registry.identity(conn), Err(ControlError::Unauthenticated)));

        let user = PublicUser::anonymous(UserId::generate());
        registry.authenticate(conn, user.clone()).unwrap();
        registry.authenticate(conn, user).unwrap();

        let other = PublicUser::anonymous(UserId::generate());
        assert!(matches!(
            registry.authenticate(conn, other),
            Err(ControlError::Forbidden(_))
        ));
    }

    #[test]
    fn members_are_distinct_users() {
        let registry = PresenceRegistry::new();
        let topic = Topic::collab(RoomId::generate());
        let user = PublicUser::anonymous(UserId::generate());

        for _ in 0..2 {
            let (tx, _rx) = outbox();
            let conn = registry.connect(tx);
            registry.authenticate(conn, user.clone()).unwrap();
            registry.subscribe(conn, topic).unwrap();
        }
        assert_eq!(registry.room_members(&topic).len(), 1);
    }

    #[test]
    fn closed_outbox_is_skipped() {
        let registry = PresenceRegistry::new();
        let topic = Topic::collab(RoomId::generate());
        let (tx, rx) = outbox();
        let conn = registry.connect(tx);
        registry.subscribe(conn, topic).unwrap();
        drop(rx);

        let event = ServerEvent::MemberLeft {
            room_id: topic.room_id,
            user: PublicUser::anonymous(UserId::generate()),
            at: Utc::now(),
        };
        assert_eq!(registry.broadcast(&topic, event, None), 0);
    }

    #[test]
    fn drain_closes_outboxes() {
        let registry = PresenceRegistry::new();
        let (tx, mut rx) = outbox();
        registry.connect(tx);

        assert_eq!(registry.drain(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn join_notifies_others_and_lists_members() {
        let fx = Fixture::new();
        let presence = fx.presence();
        let topic = Topic::collab(fx.room_id);

        let (owner_conn, mut owner_rx) = fx.connect(&presence, &fx.owner);
        let (editor_conn, mut editor_rx) = fx.connect(&presence, &fx.editor);

        let membership = presence.join(owner_conn, topic).unwrap();
        assert_eq!(membership.access, RoomAccess::Owner);
        assert_eq!(membership.members.len(), 1);

        let membership = presence.join(editor_conn, topic).unwrap();
        assert_eq!(membership.members.len(), 2);

        let owner_events = drain_events(&mut owner_rx);
        assert_eq!(owner_events.len(), 1);
        assert!(matches!(
            owner_events[0].as_ref(),
            ServerEvent::MemberJoined { user, .. } if user.id == fx.editor
        ));
        // The joiner does not hear about itself
        assert!(drain_events(&mut editor_rx).is_empty());
    }

    #[test]
    fn join_denied_subscribes_nothing() {
        let fx = Fixture::new();
        let presence = fx.presence();
        let topic = Topic::collab(fx.room_id);

        let (owner_conn, mut owner_rx) = fx.connect(&presence, &fx.owner);
        presence.join(owner_conn, topic).unwrap();

        let (outsider_conn, _rx) = fx.connect(&presence, &fx.outsider);
        let result = presence.join(outsider_conn, topic);
        assert!(matches!(result, Err(ControlError::Forbidden(_))));
        assert!(!presence.registry().is_subscribed(outsider_conn, &topic));
        assert!(drain_events(&mut owner_rx).is_empty());
    }

    #[test]
    fn join_requires_authentication() {
        let fx = Fixture::new();
        let presence = fx.presence();
        let (tx, _rx) = outbox();
        let conn = presence.registry().connect(tx);

        let result = presence.join(conn, Topic::collab(fx.room_id));
        assert!(matches!(result, Err(ControlError::Unauthenticated)));
    }

    #[test]
    fn leave_and_disconnect_fan_out_member_left() {
        let fx = Fixture::new();
        let presence = fx.presence();
        let collab = Topic::collab(fx.room_id);
        let deploy = Topic::deploy(fx.room_id);

        let (watcher, mut watcher_rx) = fx.connect(&presence, &fx.owner);
        presence.join(watcher, collab).unwrap();

        let (editor_conn, _rx) = fx.connect(&presence, &fx.editor);
        presence.join(editor_conn, collab).unwrap();
        presence.join(editor_conn, deploy).unwrap();
        drain_events(&mut watcher_rx);

        presence.leave(editor_conn, deploy).unwrap();
        assert!(drain_events(&mut watcher_rx).is_empty());

        let departure = presence.disconnect(editor_conn).unwrap();
        assert_eq!(departure.topics, vec![collab]);

        let events = drain_events(&mut watcher_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].as_ref(), ServerEvent::MemberLeft { .. }));
    }

    #[test]
    fn authorize_requires_join_and_write_access() {
        let fx = Fixture::new();
        let presence = fx.presence();
        let topic = Topic::collab(fx.room_id);

        let (viewer_conn, _rx) = fx.connect(&presence, &fx.viewer);
        assert!(matches!(
            presence.authorize(viewer_conn, &topic, false),
            Err(ControlError::Forbidden(_))
        ));

        presence.join(viewer_conn, topic).unwrap();
        assert!(presence.authorize(viewer_conn, &topic, false).is_ok());
        assert!(matches!(
            presence.authorize(viewer_conn, &topic, true),
            Err(ControlError::Forbidden(_))
        ));
    }
}
