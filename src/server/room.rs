//! Rooms and their client registries.
//!
//! A [`Room`] owns the registry of its members behind a single mutex, so
//! joins, leaves, renames, deliveries and roster syncs for one room are
//! serialised while different rooms never contend.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, error};
use tungstenite::Message;

use crate::server::{
    connection::ConnectionHandle,
    message::{ClientId, RosterEntry, ServerMessage},
};

/// A registered room member.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub handle: ConnectionHandle,
}

impl Client {
    pub fn new(id: ClientId, name: impl Into<String>, handle: ConnectionHandle) -> Self {
        Self { id, name: name.into(), handle }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Client {0} is not a member of this room")]
    NotMember(ClientId),
}

#[derive(Debug)]
pub struct Room {
    name: String,
    password: String,
    clients: Mutex<HashMap<ClientId, Client>>,
}

impl Room {
    /// Creates an empty room. The password is fixed for the room's lifetime.
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn password_matches(&self, password: &str) -> bool {
        self.password == password
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.registry().contains_key(id)
    }

    /// Inserts a client and pushes the new roster to every member, the
    /// newcomer included.
    ///
    /// # Arguments
    /// * `client` - The admitted member. Its id must not already be present;
    ///   the directory guarantees global uniqueness before calling this.
    pub fn add_client(&self, client: Client) {
        let mut clients = self.registry();
        debug!(room = %self.name, client = %client.id, "Adding client");
        clients.insert(client.id.clone(), client);
        sync_locked(&clients);
    }

    /// Removes a client and pushes the roster to whoever remains.
    ///
    /// # Returns
    /// The removed member, or `None` if `id` was not in the room. No roster
    /// is sent in that case.
    pub fn remove_client(&self, id: &ClientId) -> Option<Client> {
        let mut clients = self.registry();
        let removed = clients.remove(id);
        if removed.is_some() {
            sync_locked(&clients);
        }
        removed
    }

    /// Changes a member's display name and resyncs the roster.
    ///
    /// Display names need not be unique. An empty name is stored as is and
    /// listed as `Unknown`.
    ///
    /// # Arguments
    /// * `id` - The member to rename.
    /// * `new_name` - The new display name.
    ///
    /// # Errors
    /// Returns `RoomError::NotMember` if `id` is not in the room.
    pub fn rename(&self, id: &ClientId, new_name: impl Into<String>) -> Result<(), RoomError> {
        let mut clients = self.registry();
        let client = clients
            .get_mut(id)
            .ok_or_else(|| RoomError::NotMember(id.clone()))?;
        client.name = new_name.into();
        sync_locked(&clients);
        Ok(())
    }

    /// Sends `text` to every open member except the sender.
    ///
    /// # Arguments
    /// * `sender` - Id placed in the `from` field; never receives the frame.
    /// * `text` - Opaque payload, relayed unchanged.
    ///
    /// # Returns
    /// The number of members the frame was queued for. Closed connections
    /// are skipped silently.
    pub fn broadcast(&self, sender: &ClientId, text: &str) -> usize {
        let frame = match encode(&ServerMessage::Share {
            from: sender.clone(),
            text: text.to_owned(),
        }) {
            Some(frame) => frame,
            None => return 0,
        };

        let clients = self.registry();
        clients
            .values()
            .filter(|client| &client.id != sender && client.handle.is_open())
            .filter(|client| client.handle.send_frame(frame.clone()).is_ok())
            .count()
    }

    /// Sends `text` to `target` only.
    ///
    /// An absent or closed target is a silent miss: nothing is reported to
    /// the sender and nothing is retried.
    ///
    /// # Arguments
    /// * `sender` - Id placed in the `from` field.
    /// * `target` - The only recipient.
    /// * `text` - Opaque payload, relayed unchanged.
    ///
    /// # Returns
    /// Whether a frame was queued for `target`.
    pub fn whisper(&self, sender: &ClientId, target: &ClientId, text: &str) -> bool {
        let clients = self.registry();
        let Some(client) = clients.get(target).filter(|c| c.handle.is_open()) else {
            debug!(room = %self.name, from = %sender, to = %target, "Whisper target unavailable");
            return false;
        };

        client
            .handle
            .send(&ServerMessage::Whisper {
                from: sender.clone(),
                text: text.to_owned(),
            })
            .is_ok()
    }

    /// Recomputes the roster and sends it to every member.
    pub fn sync_roster(&self) {
        sync_locked(&self.registry());
    }

    /// Snapshot of the current membership.
    pub fn roster(&self) -> Vec<RosterEntry> {
        roster_of(&self.registry())
    }

    /// Handles of every member, for shutdown.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.registry().values().map(|c| c.handle.clone()).collect()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ClientId, Client>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shown in the roster for members without a display name.
pub const UNNAMED: &str = "Unknown";

fn roster_of(clients: &HashMap<ClientId, Client>) -> Vec<RosterEntry> {
    clients
        .values()
        .map(|c| RosterEntry {
            id: c.id.clone(),
            name: if c.name.is_empty() { UNNAMED.to_owned() } else { c.name.clone() },
        })
        .collect()
}

fn sync_locked(clients: &HashMap<ClientId, Client>) {
    if clients.is_empty() {
        return;
    }
    let Some(frame) = encode(&ServerMessage::ClientList { clients: roster_of(clients) }) else {
        return;
    };
    for client in clients.values() {
        if let Err(e) = client.handle.send_frame(frame.clone()) {
            debug!(client = %client.id, "Roster not delivered: {}", e);
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Message> {
    Message::try_from(message)
        .map_err(|e| error!("Failed to encode payload: {}", e))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn member(id: &str, name: &str) -> (Client, UnboundedReceiver<Message>) {
        let (handle, rx) = ConnectionHandle::channel();
        (Client::new(ClientId::from(id), name, handle), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn sorted(mut entries: Vec<RosterEntry>) -> Vec<RosterEntry> {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    #[test]
    fn add_client_syncs_roster_to_everyone() {
        let room = Room::new("r1", "p");
        let (alice, mut alice_rx) = member("a", "alice");
        let (bob, mut bob_rx) = member("b", "bob");

        room.add_client(alice);
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::ClientList {
                clients: vec![RosterEntry { id: "a".into(), name: "alice".into() }]
            }]
        );

        room.add_client(bob);
        for rx in [&mut alice_rx, &mut bob_rx] {
            let received = drain(rx);
            assert_eq!(received.len(), 1);
            let ServerMessage::ClientList { clients } = &received[0] else {
                panic!("expected client_list, got {:?}", received[0]);
            };
            assert_eq!(clients.len(), 2);
        }
    }

    #[test]
    fn broadcast_skips_sender_and_closed_members() {
        let room = Room::new("r1", "p");
        let (alice, mut alice_rx) = member("a", "alice");
        let (bob, mut bob_rx) = member("b", "bob");
        let (carol, carol_rx) = member("c", "carol");
        room.add_client(alice);
        room.add_client(bob);
        room.add_client(carol);
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        drop(carol_rx);

        let delivered = room.broadcast(&"a".into(), "hi");

        assert_eq!(delivered, 1);
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::Share { from: "a".into(), text: "hi".into() }]
        );
    }

    #[test]
    fn whisper_reaches_only_the_target() {
        let room = Room::new("r1", "p");
        let (alice, mut alice_rx) = member("a", "alice");
        let (bob, mut bob_rx) = member("b", "bob");
        let (carol, mut carol_rx) = member("c", "carol");
        room.add_client(alice);
        room.add_client(bob);
        room.add_client(carol);
        for rx in [&mut alice_rx, &mut bob_rx, &mut carol_rx] {
            drain(rx);
        }

        assert!(room.whisper(&"a".into(), &"b".into(), "secret"));

        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::Whisper { from: "a".into(), text: "secret".into() }]
        );
        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[test]
    fn whisper_to_absent_target_is_silent() {
        let room = Room::new("r1", "p");
        let (alice, mut alice_rx) = member("a", "alice");
        room.add_client(alice);
        drain(&mut alice_rx);

        assert!(!room.whisper(&"a".into(), &"ghost".into(), "hello?"));
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[test]
    fn rename_changes_only_that_entry() {
        let room = Room::new("r1", "p");
        let (alice, _alice_rx) = member("a", "alice");
        let (bob, _bob_rx) = member("b", "bob");
        room.add_client(alice);
        room.add_client(bob);

        room.rename(&"a".into(), "alicia").unwrap();

        assert_eq!(
            sorted(room.roster()),
            vec![
                RosterEntry { id: "a".into(), name: "alicia".into() },
                RosterEntry { id: "b".into(), name: "bob".into() },
            ]
        );
    }

    #[test]
    fn rename_requires_membership() {
        let room = Room::new("r1", "p");
        assert_eq!(
            room.rename(&"nobody".into(), "x"),
            Err(RoomError::NotMember("nobody".into()))
        );
    }

    #[test]
    fn remove_client_syncs_remaining_members() {
        let room = Room::new("r1", "p");
        let (alice, mut alice_rx) = member("a", "alice");
        let (bob, _bob_rx) = member("b", "bob");
        room.add_client(alice);
        room.add_client(bob);
        drain(&mut alice_rx);

        assert!(room.remove_client(&"b".into()).is_some());
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::ClientList {
                clients: vec![RosterEntry { id: "a".into(), name: "alice".into() }]
            }]
        );
        assert!(room.remove_client(&"b".into()).is_none());
    }

    #[test]
    fn password_is_compared_exactly() {
        let room = Room::new("r1", "p");
        assert!(room.password_matches("p"));
        assert!(!room.password_matches("q"));
        assert!(!room.password_matches(""));
    }

    #[test]
    fn empty_name_is_listed_as_unknown() {
        let room = Room::new("r1", "p");
        let (alice, mut alice_rx) = member("a", "alice");
        room.add_client(alice);
        drain(&mut alice_rx);

        room.rename(&"a".into(), "").unwrap();

        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::ClientList {
                clients: vec![RosterEntry { id: "a".into(), name: UNNAMED.into() }]
            }]
        );
    }
}
