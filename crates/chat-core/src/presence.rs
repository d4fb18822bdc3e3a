use std::collections::{BTreeMap, HashSet};

use tracing::{debug, trace};

use crate::{
    normalization::presence_user_from_entry,
    types::{PresenceEntry, PresenceEvent, PresenceSnapshot, PresenceUser},
};

/// Project the roster into a typing flag per user id.
///
/// Entries are folded in roster order, so when one user holds several keys the
/// last entry wins.
pub fn typing_by_user_id(roster: &[PresenceUser]) -> BTreeMap<String, bool> {
    let mut typing = BTreeMap::new();
    for user in roster {
        typing.insert(user.user_id.clone(), user.typing);
    }
    typing
}

/// Presence roster for one conversation channel, keyed by presence key.
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    roster: Vec<PresenceUser>,
    typing_by_user_id: BTreeMap<String, bool>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Roster entries in channel order.
    pub fn roster(&self) -> &[PresenceUser] {
        &self.roster
    }

    /// Typing flag per user id.
    pub fn typing_by_user_id(&self) -> &BTreeMap<String, bool> {
        &self.typing_by_user_id
    }

    /// Apply one channel event. Returns `false` when the event changed nothing.
    pub fn apply(&mut self, event: &PresenceEvent) -> bool {
        match event {
            PresenceEvent::Sync { state } => {
                self.sync(state);
                true
            }
            PresenceEvent::Join { new_presences } => self.join(new_presences),
            PresenceEvent::Leave { left_presences } => {
                let keys: Vec<&str> = left_presences.iter().map(|e| e.key.as_str()).collect();
                self.leave(&keys)
            }
        }
    }

    /// Replace the roster with a full snapshot.
    pub fn sync(&mut self, state: &[PresenceEntry]) {
        let mut roster: Vec<PresenceUser> = Vec::with_capacity(state.len());
        for entry in state {
            let user = presence_user_from_entry(entry);
            // A snapshot repeating a key keeps the later entry at the first position.
            match roster.iter_mut().find(|existing| existing.key == user.key) {
                Some(existing) => *existing = user,
                None => roster.push(user),
            }
        }
        trace!(entries = roster.len(), "presence sync");
        self.roster = roster;
        self.recompute();
    }

    /// Merge additions; an existing key is overwritten in place.
    pub fn join(&mut self, new_presences: &[PresenceEntry]) -> bool {
        if new_presences.is_empty() {
            return false;
        }
        for entry in new_presences {
            let user = presence_user_from_entry(entry);
            match self.roster.iter_mut().find(|existing| existing.key == user.key) {
                Some(existing) => *existing = user,
                None => self.roster.push(user),
            }
        }
        trace!(
            joined = new_presences.len(),
            entries = self.roster.len(),
            "presence join"
        );
        self.recompute();
        true
    }

    /// Remove entries by key. An empty key set is a no-op.
    pub fn leave(&mut self, keys: &[&str]) -> bool {
        if keys.is_empty() {
            return false;
        }
        let keys: HashSet<&str> = keys.iter().copied().collect();
        let before = self.roster.len();
        self.roster.retain(|user| !keys.contains(user.key.as_str()));
        trace!(
            removed = before - self.roster.len(),
            entries = self.roster.len(),
            "presence leave"
        );
        self.recompute();
        true
    }

    /// Optimistically record the local user's typing intent.
    ///
    /// Updates the roster entry tracked under `key` if it exists and patches the
    /// projection for `user_id` either way. The next channel event recomputes the
    /// projection from the roster.
    pub fn set_local_typing(&mut self, user_id: &str, key: &str, typing: bool) {
        if let Some(entry) = self.roster.iter_mut().find(|user| user.key == key) {
            entry.typing = typing;
            self.recompute();
        }
        self.typing_by_user_id.insert(user_id.to_owned(), typing);
        debug!(%user_id, typing, "local typing state applied");
    }

    /// Drop all entries, for example on session teardown.
    pub fn clear(&mut self) {
        self.roster.clear();
        self.typing_by_user_id.clear();
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            roster: self.roster.clone(),
            typing_by_user_id: self.typing_by_user_id.clone(),
        }
    }

    fn recompute(&mut self) {
        self.typing_by_user_id = typing_by_user_id(&self.roster);
    }
}

impl PresenceSnapshot {
    /// Display names of typing users other than `exclude_user_id`, in roster order.
    pub fn typing_display_names(&self, exclude_user_id: &str) -> Vec<String> {
        self.roster
            .iter()
            .filter(|user| user.user_id != exclude_user_id)
            .filter(|user| {
                self.typing_by_user_id
                    .get(&user.user_id)
                    .copied()
                    .unwrap_or(false)
            })
            .map(|user| {
                if user.display_name.is_empty() {
                    "Unknown".to_owned()
                } else {
                    user.display_name.clone()
                }
            })
            .collect()
    }

    /// One-line activity summary for a conversation header.
    pub fn activity_line(&self, exclude_user_id: &str) -> String {
        let typing = self.typing_display_names(exclude_user_id);
        match typing.as_slice() {
            [] => format!("{} online", self.roster.len()),
            [one] => format!("{one} is typing..."),
            [first, second] => format!("{first} and {second} are typing..."),
            [first, rest @ ..] => format!("{first} and {} others are typing...", rest.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(key: &str, user_id: &str, typing: bool) -> PresenceEntry {
        PresenceEntry::new(
            key,
            vec![json!({"user_id": user_id, "displayName": user_id, "typing": typing})],
        )
    }

    fn keys(roster: &PresenceRoster) -> Vec<&str> {
        roster.roster().iter().map(|u| u.key.as_str()).collect()
    }

    #[test]
    fn roster_tracks_sync_plus_joins_minus_leaves() {
        let mut roster = PresenceRoster::new();
        roster.join(&[entry("stale", "zed", false)]);
        roster.sync(&[entry("k1", "alice", false), entry("k2", "bob", false)]);
        roster.join(&[entry("k3", "carol", false), entry("k1", "alice", true)]);
        roster.leave(&["k2"]);

        assert_eq!(keys(&roster), vec!["k1", "k3"]);
        assert!(roster.roster()[0].typing);
    }

    #[test]
    fn rejoin_overwrites_in_place() {
        let mut roster = PresenceRoster::new();
        roster.sync(&[entry("k1", "alice", false), entry("k2", "bob", false)]);
        roster.join(&[entry("k1", "alice", true)]);

        assert_eq!(keys(&roster), vec!["k1", "k2"]);
        assert_eq!(roster.typing_by_user_id().get("alice"), Some(&true));
    }

    #[test]
    fn empty_leave_is_a_no_op() {
        let mut roster = PresenceRoster::new();
        roster.sync(&[entry("k1", "alice", true)]);
        assert!(!roster.apply(&PresenceEvent::Leave {
            left_presences: Vec::new()
        }));
        assert_eq!(keys(&roster), vec!["k1"]);
    }

    #[test]
    fn typing_projection_uses_last_entry_per_user() {
        let mut roster = PresenceRoster::new();
        roster.sync(&[entry("phone", "alice", true), entry("laptop", "alice", false)]);
        assert_eq!(roster.typing_by_user_id().get("alice"), Some(&false));

        roster.join(&[entry("tablet", "alice", true)]);
        assert_eq!(roster.typing_by_user_id().get("alice"), Some(&true));

        roster.leave(&["tablet"]);
        assert_eq!(roster.typing_by_user_id().get("alice"), Some(&false));
    }

    #[test]
    fn leaving_last_key_drops_user_from_projection() {
        let mut roster = PresenceRoster::new();
        roster.sync(&[entry("k1", "alice", true)]);
        roster.leave(&["k1"]);
        assert!(roster.typing_by_user_id().is_empty());
    }

    #[test]
    fn malformed_join_keeps_serving() {
        let mut roster = PresenceRoster::new();
        roster.sync(&[entry("k1", "alice", false)]);
        roster.join(&[PresenceEntry::new("k2", vec![json!(null)])]);

        assert_eq!(keys(&roster), vec!["k1", "k2"]);
        assert_eq!(roster.roster()[1].user_id, "unknown");
    }

    #[test]
    fn local_typing_patches_projection_until_next_event() {
        let mut roster = PresenceRoster::new();
        roster.sync(&[entry("other", "bob", false)]);
        roster.set_local_typing("alice", "alice-key", true);
        assert_eq!(roster.typing_by_user_id().get("alice"), Some(&true));

        roster.join(&[entry("k9", "carol", false)]);
        assert_eq!(roster.typing_by_user_id().get("alice"), None);
    }

    #[test]
    fn local_typing_updates_own_roster_entry() {
        let mut roster = PresenceRoster::new();
        roster.sync(&[entry("alice-key", "alice", false)]);
        roster.set_local_typing("alice", "alice-key", true);

        assert!(roster.roster()[0].typing);
        roster.join(&[entry("k9", "carol", false)]);
        assert_eq!(roster.typing_by_user_id().get("alice"), Some(&true));
    }

    #[test]
    fn activity_line_summarizes_typing_users() {
        let mut roster = PresenceRoster::new();
        roster.sync(&[entry("k0", "me", true), entry("k1", "alice", false)]);
        assert_eq!(roster.snapshot().activity_line("me"), "2 online");

        roster.join(&[entry("k1", "alice", true)]);
        assert_eq!(roster.snapshot().activity_line("me"), "alice is typing...");

        roster.join(&[entry("k2", "bob", true)]);
        assert_eq!(
            roster.snapshot().activity_line("me"),
            "alice and bob are typing..."
        );

        roster.join(&[entry("k3", "carol", true)]);
        assert_eq!(
            roster.snapshot().activity_line("me"),
            "alice and 2 others are typing..."
        );
    }
}
