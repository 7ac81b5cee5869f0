use shared::protocol::ServerEvent;
use tracing::debug;

use crate::registry::ConnectionRegistry;

/// Pushes the full reachability roster to every live connection. Invoked
/// after each register/unregister; intentionally global rather than scoped to
/// conversations, since reachability is a process-wide fact.
pub fn broadcast_online_roster(registry: &ConnectionRegistry) {
    let user_ids = registry.online_users();
    debug!(online = user_ids.len(), "presence roster changed");
    registry.broadcast_all(&ServerEvent::OnlineUsers { user_ids });
}
