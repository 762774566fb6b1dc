//! Room access resolution.
//!
//! Access is recomputed from the store on every call and never cached, so a
//! membership revoked in the store takes effect on the caller's next operation.

use devroom_core::{ProjectId, RoomId, UserId};
use devroom_store::{MemberRole, Project, Room, Store};
use serde::Serialize;

use crate::error::{ControlError, Result};

/// What a user may do in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomAccess {
    /// The room's owner.
    Owner,
    /// A listed member.
    Member(MemberRole),
    /// A non-member looking at a public room.
    Viewer,
}

impl RoomAccess {
    /// Owners and editors may mutate room state.
    #[must_use]
    pub const fn can_write(self) -> bool {
        matches!(self, Self::Owner | Self::Member(MemberRole::Editor))
    }
}

/// Resolve `user_id`'s access to `room`.
///
/// # Errors
///
/// Returns `ControlError::Forbidden` if the user is neither owner nor member
/// and the room is private.
pub fn room_access<S: Store + ?Sized>(store: &S, room: &Room, user_id: &UserId) -> Result<RoomAccess> {
    if room.owner_id == *user_id {
        return Ok(RoomAccess::Owner);
    }
    if let Some(member) = store.get_room_member(&room.room_id, user_id)? {
        return Ok(RoomAccess::Member(member.role));
    }
    if room.is_public {
        return Ok(RoomAccess::Viewer);
    }
    Err(ControlError::Forbidden(format!(
        "no access to room {}",
        room.room_id
    )))
}

/// Load a room and resolve the caller's access to it.
///
/// # Errors
///
/// Returns `ControlError::NotFound` if the room doesn't exist, or
/// `ControlError::Forbidden` if access is denied.
pub fn load_room<S: Store + ?Sized>(
    store: &S,
    room_id: &RoomId,
    user_id: &UserId,
) -> Result<(Room, RoomAccess)> {
    let room = store
        .get_room(room_id)?
        .ok_or_else(|| ControlError::NotFound(format!("room {room_id}")))?;
    let access = room_access(store, &room, user_id)?;
    Ok((room, access))
}

/// Require write access to a room.
///
/// # Errors
///
/// Returns `ControlError::Forbidden` for viewers.
pub fn require_write(access: RoomAccess, room_id: &RoomId) -> Result<()> {
    if access.can_write() {
        Ok(())
    } else {
        Err(ControlError::Forbidden(format!(
            "read-only access to room {room_id}"
        )))
    }
}

/// Load a project, ensuring it belongs to `room_id`.
///
/// # Errors
///
/// Returns `ControlError::NotFound` if the project doesn't exist or lives in
/// another room.
pub fn project_in_room<S: Store + ?Sized>(
    store: &S,
    project_id: &ProjectId,
    room_id: &RoomId,
) -> Result<Project> {
    match store.get_project(project_id)? {
        Some(project) if project.room_id == *room_id => Ok(project),
        _ => Err(ControlError::NotFound(format!("project {project_id}"))),
    }
}

/// Resolve the caller's access to a project through its room.
///
/// The project owner always has owner access.
///
/// # Errors
///
/// Returns `ControlError::NotFound` if the project or its room doesn't exist,
/// or `ControlError::Forbidden` if access is denied.
pub fn project_access<S: Store + ?Sized>(
    store: &S,
    project_id: &ProjectId,
    user_id: &UserId,
) -> Result<(Project, RoomAccess)> {
    let project = store
        .get_project(project_id)?
        .ok_or_else(|| ControlError::NotFound(format!("project {project_id}")))?;

    if project.owner_id == *user_id {
        return Ok((project, RoomAccess::Owner));
    }

    let (_, access) = load_room(store, &project.room_id, user_id)?;
    Ok((project, access))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    #[test]
    fn owner_member_viewer_and_outsider() {
        let fx = Fixture::new();
        let store = fx.store.as_ref();

        let (_, access) = load_room(store, &fx.room_id, &fx.owner).unwrap();
        assert_eq!(access, RoomAccess::Owner);

        let (_, access) = load_room(store, &fx.room_id, &fx.editor).unwrap();
        assert_eq!(access, RoomAccess::Member(MemberRole::Editor));
        assert!(access.can_write());

        let (_, access) = load_room(store, &fx.room_id, &fx.viewer).unwrap();
        assert_eq!(access, RoomAccess::Member(MemberRole::Viewer));
        assert!(!access.can_write());

        let result = load_room(store, &fx.room_id, &fx.outsider);
        assert!(matches!(result, Err(ControlError::Forbidden(_))));
    }

    #[test]
    fn public_room_grants_viewer() {
        let fx = Fixture::new();
        let room = fx.public_room();

        let (_, access) = load_room(fx.store.as_ref(), &room, &fx.outsider).unwrap();
        assert_eq!(access, RoomAccess::Viewer);
        assert!(require_write(access, &room).is_err());
    }

    #[test]
    fn unknown_room_is_not_found() {
        let fx = Fixture::new();
        let result = load_room(fx.store.as_ref(), &RoomId::generate(), &fx.owner);
        assert!(matches!(result, Err(ControlError::NotFound(_))));
    }

    #[test]
    fn project_must_match_room() {
        let fx = Fixture::new();
        let store = fx.store.as_ref();

        assert!(project_in_room(store, &fx.project_id, &fx.room_id).is_ok());
        assert!(matches!(
            project_in_room(store, &fx.project_id, &RoomId::generate()),
            Err(ControlError::NotFound(_))
        ));

        let (_, access) = project_access(store, &fx.project_id, &fx.editor).unwrap();
        assert!(access.can_write());
        assert!(project_access(store, &fx.project_id, &fx.outsider).is_err());
    }
}
