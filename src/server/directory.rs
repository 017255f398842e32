//! Process-wide room table.
//!
//! Rooms are created lazily by the first admission that names them and are
//! dropped the moment their registry empties. Admission holds the room's
//! directory entry while it inserts the client, and removal re-checks
//! emptiness under the same entry lock, so a join can never land in a room
//! that is being deleted.

use std::sync::Arc;
use dashmap::{
    mapref::{entry::Entry, one::RefMut},
    DashMap,
};
use tracing::{debug, info};
use tungstenite::http::StatusCode;

use crate::server::{
    connection::ConnectionHandle,
    message::ClientId,
    room::{Client, Room},
};

/// Reasons an admission is refused. The `Display` text is the HTTP body.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Not found")]
    PathNotFound,
    #[error("Missing roomId")]
    MissingRoom,
    #[error("Missing password")]
    MissingPassword,
    #[error("Missing name")]
    MissingName,
    #[error("Incorrect password")]
    IncorrectPassword,
    #[error("Client ID already exists")]
    DuplicateClientId,
    #[error("Room not found")]
    RoomNotFound,
    #[error("Already joined")]
    AlreadyJoined,
    #[error("Upgrade failed")]
    UpgradeFailed,
}

impl AdmissionError {
    /// HTTP status the upgrade layer answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::PathNotFound | AdmissionError::RoomNotFound => StatusCode::NOT_FOUND,
            AdmissionError::IncorrectPassword => StatusCode::UNAUTHORIZED,
            AdmissionError::MissingRoom
            | AdmissionError::MissingPassword
            | AdmissionError::MissingName
            | AdmissionError::DuplicateClientId
            | AdmissionError::AlreadyJoined => StatusCode::BAD_REQUEST,
            AdmissionError::UpgradeFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Validated join credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub room: String,
    pub password: String,
    pub name: String,
}

impl AdmissionRequest {
    /// Builds a request from optional query values. Empty values count as missing.
    pub fn from_parts(
        room: Option<String>,
        password: Option<String>,
        name: Option<String>,
    ) -> Result<Self, AdmissionError> {
        let present = |v: Option<String>| v.filter(|s| !s.is_empty());
        Ok(Self {
            room: present(room).ok_or(AdmissionError::MissingRoom)?,
            password: present(password).ok_or(AdmissionError::MissingPassword)?,
            name: present(name).ok_or(AdmissionError::MissingName)?,
        })
    }

    /// Parses `room`, `password` and `name` from a URL query string.
    pub fn from_query(query: Option<&str>) -> Result<Self, AdmissionError> {
        let (mut room, mut password, mut name) = (None, None, None);
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "room" => room = Some(value.into_owned()),
                "password" => password = Some(value.into_owned()),
                "name" => name = Some(value.into_owned()),
                _ => {}
            }
        }
        Self::from_parts(room, password, name)
    }
}

#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: DashMap<String, Arc<Room>>,
    /// Every admitted client id and the room it lives in.
    members: DashMap<ClientId, String>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a client: resolves or creates the room, checks the password and
    /// global id uniqueness, then registers the client and syncs the roster.
    ///
    /// On any failure nothing is mutated.
    ///
    /// # Arguments
    /// * `request` - Validated room name, password and display name.
    /// * `id` - Freshly generated client id.
    /// * `handle` - Outbound channel of the joining connection.
    ///
    /// # Returns
    /// The room the client now belongs to.
    ///
    /// # Errors
    /// * `AdmissionError::DuplicateClientId` if `id` is already admitted anywhere.
    /// * `AdmissionError::IncorrectPassword` if the room exists with another password.
    pub fn admit(
        &self,
        request: &AdmissionRequest,
        id: ClientId,
        handle: ConnectionHandle,
    ) -> Result<Arc<Room>, AdmissionError> {
        match self.members.entry(id.clone()) {
            Entry::Occupied(_) => return Err(AdmissionError::DuplicateClientId),
            Entry::Vacant(slot) => {
                slot.insert(request.room.clone());
            }
        }

        let room = match self.resolve_or_create(&request.room, &request.password) {
            Ok(room) => room,
            Err(e) => {
                self.members.remove(&id);
                return Err(e);
            }
        };

        info!(room = %request.room, client = %id, name = %request.name, "Client admitted");
        room.add_client(Client::new(id, request.name.clone(), handle));
        Ok(room.value().clone())
    }

    /// Returns the room named `name`, creating it with `password` if absent.
    ///
    /// The returned entry keeps the directory shard locked, so the caller's
    /// insertion is atomic with respect to [`remove_if_empty`](Self::remove_if_empty).
    pub fn resolve_or_create(
        &self,
        name: &str,
        password: &str,
    ) -> Result<RefMut<'_, String, Arc<Room>>, AdmissionError> {
        let entry = self.rooms.entry(name.to_owned()).or_insert_with(|| {
            info!(room = %name, "Creating room");
            Arc::new(Room::new(name, password))
        });

        if entry.password_matches(password) {
            Ok(entry)
        } else {
            Err(AdmissionError::IncorrectPassword)
        }
    }

    /// Removes a client from its room, then drops the room if it emptied.
    pub fn leave(&self, id: &ClientId) -> Option<Arc<Room>> {
        let (_, room_name) = self.members.remove(id)?;
        let room = self.room(&room_name).ok()?;
        room.remove_client(id);
        if self.remove_if_empty(&room_name) {
            info!(room = %room_name, "Room closed");
        }
        Some(room)
    }

    /// Deletes the room iff its registry is empty. Returns whether it was deleted.
    pub fn remove_if_empty(&self, name: &str) -> bool {
        self.rooms.remove_if(name, |_, room| room.is_empty()).is_some()
    }

    /// Looks a room up by name.
    pub fn room(&self, name: &str) -> Result<Arc<Room>, AdmissionError> {
        self.rooms
            .get(name)
            .map(|room| room.value().clone())
            .ok_or(AdmissionError::RoomNotFound)
    }

    pub fn contains_client(&self, id: &ClientId) -> bool {
        self.members.contains_key(id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn client_count(&self) -> usize {
        self.members.len()
    }

    /// Closes every member connection of every room.
    pub fn close_all(&self) {
        for room in self.rooms.iter() {
            debug!(room = %room.key(), "Closing room");
            room.handles().iter().for_each(ConnectionHandle::close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tungstenite::Message;

    fn request(room: &str, password: &str, name: &str) -> AdmissionRequest {
        AdmissionRequest::from_parts(Some(room.into()), Some(password.into()), Some(name.into()))
            .unwrap()
    }

    fn join(dir: &RoomDirectory, room: &str, password: &str, name: &str) -> Result<ClientId, AdmissionError> {
        let (handle, _rx) = ConnectionHandle::channel();
        let id = ClientId::generate();
        dir.admit(&request(room, password, name), id.clone(), handle)?;
        Ok(id)
    }

    #[test]
    fn first_join_creates_room() {
        let dir = RoomDirectory::new();
        let alice = join(&dir, "r1", "p", "alice").unwrap();

        let room = dir.room("r1").unwrap();
        assert_eq!(room.len(), 1);
        assert!(room.contains(&alice));
        assert_eq!(dir.room_count(), 1);
    }

    #[test]
    fn wrong_password_is_rejected_without_side_effects() {
        let dir = RoomDirectory::new();
        join(&dir, "r1", "p", "alice").unwrap();

        let (handle, mut rx) = ConnectionHandle::channel();
        let bob = ClientId::generate();
        let result = dir.admit(&request("r1", "q", "bob"), bob.clone(), handle);

        assert_eq!(result.unwrap_err(), AdmissionError::IncorrectPassword);
        assert_eq!(dir.room("r1").unwrap().len(), 1);
        assert!(!dir.contains_client(&bob));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn duplicate_id_is_rejected_across_rooms() {
        let dir = RoomDirectory::new();
        let (handle, _rx) = ConnectionHandle::channel();
        let id = ClientId::from("same");
        dir.admit(&request("r1", "p", "alice"), id.clone(), handle.clone()).unwrap();

        let result = dir.admit(&request("r2", "other", "mallory"), id, handle);

        assert_eq!(result.unwrap_err(), AdmissionError::DuplicateClientId);
        assert!(dir.room("r2").is_err());
    }

    #[test]
    fn room_exists_iff_non_empty() {
        let dir = RoomDirectory::new();
        let alice = join(&dir, "r1", "p", "alice").unwrap();
        let bob = join(&dir, "r1", "p", "bob").unwrap();

        dir.leave(&bob);
        assert_eq!(dir.room("r1").unwrap().len(), 1);

        dir.leave(&alice);
        assert_eq!(dir.room("r1").unwrap_err(), AdmissionError::RoomNotFound);
        assert_eq!(dir.room_count(), 0);
        assert_eq!(dir.client_count(), 0);
    }

    #[test]
    fn leave_unknown_client_is_noop() {
        let dir = RoomDirectory::new();
        assert!(dir.leave(&ClientId::from("ghost")).is_none());
    }

    #[test]
    fn recreated_room_takes_new_password() {
        let dir = RoomDirectory::new();
        let alice = join(&dir, "r1", "p", "alice").unwrap();
        dir.leave(&alice);

        join(&dir, "r1", "fresh", "bob").unwrap();
        assert_eq!(join(&dir, "r1", "p", "carol").unwrap_err(), AdmissionError::IncorrectPassword);
    }

    #[test]
    fn remove_if_empty_keeps_populated_rooms() {
        let dir = RoomDirectory::new();
        join(&dir, "r1", "p", "alice").unwrap();
        assert!(!dir.remove_if_empty("r1"));
        assert!(!dir.remove_if_empty("missing"));
    }

    #[test]
    fn concurrent_joins_create_one_room() {
        let dir = RoomDirectory::new();
        std::thread::scope(|scope| {
            for i in 0..16 {
                let dir = &dir;
                scope.spawn(move || join(dir, "shared", "p", &format!("client-{i}")).unwrap());
            }
        });

        assert_eq!(dir.room_count(), 1);
        assert_eq!(dir.room("shared").unwrap().len(), 16);
    }

    #[test]
    fn concurrent_join_and_leave_preserve_invariant() {
        let dir = RoomDirectory::new();
        std::thread::scope(|scope| {
            for i in 0..8 {
                let dir = &dir;
                scope.spawn(move || {
                    for _ in 0..50 {
                        let id = join(dir, "churn", "p", &format!("c{i}")).unwrap();
                        dir.leave(&id);
                    }
                });
            }
        });

        assert_eq!(dir.room_count(), 0);
        assert_eq!(dir.client_count(), 0);
    }

    #[test]
    fn admission_sends_roster() {
        let dir = RoomDirectory::new();
        let (handle, mut rx) = ConnectionHandle::channel();
        dir.admit(&request("r1", "p", "alice"), "a".into(), handle).unwrap();

        let Ok(Message::Text(text)) = rx.try_recv() else {
            panic!("expected a roster frame");
        };
        assert_eq!(text, r#"{"type":"client_list","clients":[{"id":"a","name":"alice"}]}"#);
    }

    #[test]
    fn query_parsing_reports_first_missing_field() {
        assert_eq!(
            AdmissionRequest::from_query(Some("room=r1&password=p&name=alice%20smith")),
            Ok(request("r1", "p", "alice smith"))
        );
        assert_eq!(AdmissionRequest::from_query(None), Err(AdmissionError::MissingRoom));
        assert_eq!(
            AdmissionRequest::from_query(Some("room=r1&name=a")),
            Err(AdmissionError::MissingPassword)
        );
        assert_eq!(
            AdmissionRequest::from_query(Some("room=r1&password=p&name=")),
            Err(AdmissionError::MissingName)
        );
    }

    #[test]
    fn admission_errors_map_to_http_status() {
        assert_eq!(AdmissionError::IncorrectPassword.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AdmissionError::MissingName.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AdmissionError::PathNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AdmissionError::PathNotFound.to_string(), "Not found");
    }
}
