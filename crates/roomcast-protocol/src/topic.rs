//! Room names and topic naming.
//!
//! Chat messages for room `R` travel on topic `R`; typing events travel on
//! `R$typing`. Room names may not contain `$`, so the two never collide.

/// Maximum room name length in bytes.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Character reserved for topic suffixes.
pub const RESERVED_CHAR: char = '$';

/// Suffix appended to a room name to form its typing topic.
pub const TYPING_TOPIC_SUFFIX: &str = "$typing";

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.contains(RESERVED_CHAR) {
        return Err("Room names cannot contain '$'");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Topic carrying chat messages for a room.
#[must_use]
pub fn chat_topic(room: &str) -> String {
    room.to_string()
}

/// Topic carrying typing events for a room.
#[must_use]
pub fn typing_topic(room: &str) -> String {
    format!("{room}{TYPING_TOPIC_SUFFIX}")
}
