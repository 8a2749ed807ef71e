//! Per-channel presence registry.
//!
//! An id-keyed map of [`DiscoveredUser`] records. Sightings are merged in
//! with three rules:
//!
//! - `last_seen` never moves backwards; an older sighting cannot rewind it.
//! - Attributes are refreshed only by sightings at least as new as the record.
//! - Once `is_friend` is `true`, only [`PresenceRegistry::refresh_friends`]
//!   can clear it. Plain sightings never do.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::clock::cutoff;
use crate::types::{Channel, DiscoveredUser, Sighting};

/// Discovered users for one channel.
#[derive(Debug, Clone)]
pub struct PresenceRegistry {
    channel: Channel,
    entries: HashMap<String, DiscoveredUser>,
}

impl PresenceRegistry {
    /// Creates an empty registry for `channel`.
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            entries: HashMap::new(),
        }
    }

    /// The channel this registry belongs to.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Creates or merges the record for the sighting's subject and returns it.
    pub fn upsert(&mut self, sighting: Sighting) -> DiscoveredUser {
        debug_assert_eq!(sighting.channel, self.channel);

        let Some(existing) = self.entries.get_mut(&sighting.subject_id) else {
            let user = DiscoveredUser::from_sighting(sighting);
            self.entries.insert(user.id.clone(), user.clone());
            return user;
        };

        if sighting.observed_at >= existing.last_seen {
            existing.last_seen = sighting.observed_at;
            existing.username = sighting.profile.username;
            existing.display_name = sighting.profile.display_name;
            existing.avatar_url = sighting.profile.avatar_url;
            existing.account_type = sighting.profile.account_type;
            if sighting.distance_meters.is_some() {
                existing.distance_meters = sighting.distance_meters;
            }
        }

        existing.is_friend = match (existing.is_friend, sighting.is_friend) {
            (Some(true), _) => Some(true),
            (current, None) => current,
            (_, incoming) => incoming,
        };

        existing.clone()
    }

    /// Applies the authoritative friend set to every record.
    ///
    /// Returns the records whose flag changed.
    pub fn refresh_friends(&mut self, friend_ids: &HashSet<String>) -> Vec<DiscoveredUser> {
        self.entries
            .values_mut()
            .filter_map(|user| {
                let is_friend = Some(friend_ids.contains(&user.id));
                (user.is_friend != is_friend).then(|| {
                    user.is_friend = is_friend;
                    user.clone()
                })
            })
            .collect()
    }

    /// Removes every record last seen before `now - ttl`. Returns how many went.
    pub fn evict_stale(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let oldest = cutoff(now, ttl);
        let before = self.entries.len();
        self.entries.retain(|_, user| user.last_seen >= oldest);
        before - self.entries.len()
    }

    /// Current records, in no particular order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DiscoveredUser> {
        self.entries.values().cloned().collect()
    }

    /// Looks up one record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DiscoveredUser> {
        self.entries.get(id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
