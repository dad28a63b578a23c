//! Short random identifiers for sessions and loop nodes

use uuid::Uuid;

/// Eight lowercase hex characters from a fresh v4 uuid
pub fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
