//! Track tokens excluded from dispatch until a wake-up time.

use crate::{RequestId, Token};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::SystemTime,
};

/// A token of a request.
pub type Item = (RequestId, Token);

/// Tokens cooling down after a failure, ordered by wake-up time.
///
/// Any item is included at most once: putting an item that is already cooling down replaces its
/// wake-up time.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    entries: BTreeMap<SystemTime, BTreeSet<Item>>,
    wakeups: HashMap<Item, SystemTime>,
    requests: HashMap<RequestId, BTreeSet<Token>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude `item` from dispatch until `wakeup`, replacing any previous wake-up time.
    pub fn put(&mut self, item: Item, wakeup: SystemTime) {
        // Check if the item already exists
        if let Some(old) = self.wakeups.insert(item, wakeup) {
            self.remove_entry(&item, old);
        }

        // Insert the item into the new wake-up's set
        self.entries.entry(wakeup).or_default().insert(item);
        self.requests.entry(item.0).or_default().insert(item.1);
    }

    /// Returns the wake-up time of `item`, if it is cooling down.
    pub fn get(&self, item: &Item) -> Option<SystemTime> {
        self.wakeups.get(item).copied()
    }

    /// Returns true if `item` is cooling down.
    pub fn contains(&self, item: &Item) -> bool {
        self.wakeups.contains_key(item)
    }

    /// Remove the cooldown of `item`.
    ///
    /// Returns `true` if the item was cooling down.
    pub fn remove(&mut self, item: &Item) -> bool {
        let Some(wakeup) = self.wakeups.remove(item) else {
            return false;
        };
        self.remove_entry(item, wakeup);
        if let Some(tokens) = self.requests.get_mut(&item.0) {
            tokens.remove(&item.1);
            if tokens.is_empty() {
                self.requests.remove(&item.0);
            }
        }
        true
    }

    /// Remove the cooldowns of all tokens of `request`.
    ///
    /// Returns the number of removed cooldowns.
    pub fn remove_request(&mut self, request: RequestId) -> usize {
        let Some(tokens) = self.requests.remove(&request) else {
            return 0;
        };
        for token in tokens.iter() {
            let item = (request, *token);
            if let Some(wakeup) = self.wakeups.remove(&item) {
                self.remove_entry(&item, wakeup);
            }
        }
        tokens.len()
    }

    /// Remove and return all items whose wake-up time is at or before `now`.
    pub fn expire(&mut self, now: SystemTime) -> Vec<Item> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if *entry.key() > now {
                break;
            }
            expired.extend(entry.remove());
        }
        for item in expired.iter() {
            self.wakeups.remove(item);
            if let Some(tokens) = self.requests.get_mut(&item.0) {
                tokens.remove(&item.1);
                if tokens.is_empty() {
                    self.requests.remove(&item.0);
                }
            }
        }
        expired
    }

    /// Returns the earliest wake-up time.
    pub fn next_wakeup(&self) -> Option<SystemTime> {
        self.entries.keys().next().copied()
    }

    /// Returns the number of items cooling down.
    pub fn len(&self) -> usize {
        self.wakeups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wakeups.is_empty()
    }

    fn remove_entry(&mut self, item: &Item, wakeup: SystemTime) {
        if let Some(items) = self.entries.get_mut(&wakeup) {
            items.remove(item);
            if items.is_empty() {
                self.entries.remove(&wakeup);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_put_replaces() {
        let mut tracker = CooldownTracker::new();
        let item = (RequestId(1), Token(0));

        tracker.put(item, at(10));
        tracker.put(item, at(5));

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get(&item), Some(at(5)));
        assert_eq!(tracker.next_wakeup(), Some(at(5)));

        // The old wake-up no longer releases the item
        assert!(tracker.expire(at(4)).is_empty());
        assert_eq!(tracker.expire(at(5)), vec![item]);
        assert!(tracker.is_empty());
        assert!(tracker.expire(at(10)).is_empty());
    }

    #[test]
    fn test_expire_in_order() {
        let mut tracker = CooldownTracker::new();
        let first = (RequestId(1), Token(0));
        let second = (RequestId(2), Token(3));
        let third = (RequestId(1), Token(1));

        tracker.put(third, at(30));
        tracker.put(first, at(10));
        tracker.put(second, at(20));

        assert_eq!(tracker.expire(at(25)), vec![first, second]);
        assert!(!tracker.contains(&first));
        assert!(tracker.contains(&third));
        assert_eq!(tracker.next_wakeup(), Some(at(30)));
    }

    #[test]
    fn test_remove() {
        let mut tracker = CooldownTracker::new();
        let item = (RequestId(1), Token(0));

        assert!(!tracker.remove(&item));
        tracker.put(item, at(10));
        assert!(tracker.remove(&item));
        assert!(tracker.is_empty());
        assert_eq!(tracker.next_wakeup(), None);
        assert_eq!(tracker.remove_request(RequestId(1)), 0);
    }

    #[test]
    fn test_remove_request() {
        let mut tracker = CooldownTracker::new();
        tracker.put((RequestId(1), Token(0)), at(10));
        tracker.put((RequestId(1), Token(1)), at(10));
        tracker.put((RequestId(2), Token(0)), at(20));

        assert_eq!(tracker.remove_request(RequestId(1)), 2);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.next_wakeup(), Some(at(20)));
        assert_eq!(tracker.remove_request(RequestId(1)), 0);
    }
}
