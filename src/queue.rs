use std::collections::{HashMap, VecDeque};

use rand::Rng;

use crate::{
    common::{LunalinkError, Result},
    protocol::Track,
};

/// Ordered backlog of tracks awaiting playback for one player.
///
/// Positions exposed to callers are offset by a configurable `start_index`
/// so a host can address entries 1-based (or any other base) without doing
/// its own arithmetic. Membership is tracked by encoded blob in a side map,
/// keeping `has` O(1) while head/tail operations stay O(1) on the deque.
#[derive(Debug, Default)]
pub struct Queue {
    items: VecDeque<Track>,
    /// encoded blob -> number of occurrences currently queued.
    membership: HashMap<String, usize>,
    start_index: usize,
}

impl Queue {
    pub fn new(start_index: usize) -> Self {
        Self {
            items: VecDeque::new(),
            membership: HashMap::new(),
            start_index,
        }
    }

    pub fn start_index(&self) -> usize {
        self.start_index
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends a track to the tail.
    pub fn add(&mut self, track: Track) {
        self.track_added(&track);
        self.items.push_back(track);
    }

    /// Prepends a track; it becomes the next to play.
    pub fn unshift(&mut self, track: Track) {
        self.track_added(&track);
        self.items.push_front(track);
    }

    /// Removes and returns the head track.
    pub fn shift(&mut self) -> Option<Track> {
        let track = self.items.pop_front()?;
        self.track_removed(&track);
        Some(track)
    }

    /// Removes and returns the tail track.
    pub fn pop(&mut self) -> Option<Track> {
        let track = self.items.pop_back()?;
        self.track_removed(&track);
        Some(track)
    }

    /// Whether a track with the same encoded blob is queued.
    pub fn has(&self, track: &Track) -> bool {
        self.membership.contains_key(&track.encoded)
    }

    /// Borrow the track at an externally addressed position.
    pub fn get(&self, position: usize) -> Result<&Track> {
        let index = self.internal_index(position)?;
        Ok(&self.items[index])
    }

    /// Remove the track at an externally addressed position.
    pub fn remove(&mut self, position: usize) -> Result<Track> {
        let index = self.internal_index(position)?;
        let track = self.items.remove(index).expect("index was bounds-checked");
        self.track_removed(&track);
        Ok(track)
    }

    /// Splices the track at `position` to the front, for skip-to.
    pub fn move_to_front(&mut self, position: usize) -> Result<()> {
        let track = self.remove(position)?;
        self.unshift(track);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.membership.clear();
    }

    /// In-place Fisher-Yates permutation of the queued tracks.
    ///
    /// Fails without mutating anything when fewer than two tracks are
    /// queued. Positions stay valid across a shuffle; only the values at
    /// each position change.
    pub fn shuffle(&mut self) -> Result<()> {
        if self.items.len() < 2 {
            return Err(LunalinkError::NotEnoughTracks {
                needed: 2,
                actual: self.items.len(),
            });
        }
        let slice = self.items.make_contiguous();
        let mut rng = rand::thread_rng();
        for i in (1..slice.len()).rev() {
            let j = rng.gen_range(0..=i);
            slice.swap(i, j);
        }
        Ok(())
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    fn internal_index(&self, position: usize) -> Result<usize> {
        let start = self.start_index;
        let end = start + self.items.len();
        if position < start || position >= end {
            return Err(LunalinkError::OutOfBounds {
                position,
                start,
                end,
            });
        }
        Ok(position - start)
    }

    fn track_added(&mut self, track: &Track) {
        *self.membership.entry(track.encoded.clone()).or_insert(0) += 1;
    }

    fn track_removed(&mut self, track: &Track) {
        if let Some(count) = self.membership.get_mut(&track.encoded) {
            *count -= 1;
            if *count == 0 {
                self.membership.remove(&track.encoded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TrackInfo;
    use std::collections::HashSet;

    fn track(tag: &str) -> Track {
        Track {
            encoded: format!("blob:{}", tag),
            info: TrackInfo {
                identifier: tag.to_string(),
                title: tag.to_string(),
                source_name: "youtube".to_string(),
                is_seekable: true,
                length: 1000,
                ..Default::default()
            },
            plugin_info: serde_json::json!({}),
            user_data: serde_json::json!({}),
        }
    }

    #[test]
    fn fifo_roundtrip() {
        let mut queue = Queue::new(0);
        let (t1, t2) = (track("t1"), track("t2"));
        queue.add(t1.clone());
        queue.add(t2.clone());

        assert_eq!(queue.shift().unwrap().encoded, t1.encoded);
        assert_eq!(queue.shift().unwrap().encoded, t2.encoded);
        assert!(queue.is_empty());
        assert!(!queue.has(&t1), "membership cleared after shift");
    }

    #[test]
    fn positional_addressing_with_start_index_one() {
        let mut queue = Queue::new(1);
        queue.add(track("t1"));
        queue.add(track("t2"));

        assert_eq!(queue.get(1).unwrap().info.identifier, "t1");
        assert_eq!(queue.get(2).unwrap().info.identifier, "t2");
        assert!(matches!(
            queue.get(0),
            Err(LunalinkError::OutOfBounds { position: 0, .. })
        ));
        assert!(matches!(
            queue.get(3),
            Err(LunalinkError::OutOfBounds { position: 3, .. })
        ));
    }

    #[test]
    fn remove_respects_start_index() {
        let mut queue = Queue::new(1);
        queue.add(track("t1"));
        queue.add(track("t2"));
        queue.add(track("t3"));

        let removed = queue.remove(2).unwrap();
        assert_eq!(removed.info.identifier, "t2");
        assert_eq!(queue.len(), 2);
        assert!(!queue.has(&removed));
        assert!(queue.remove(3).is_err());
    }

    #[test]
    fn duplicate_tracks_keep_membership_until_last_copy_leaves() {
        let mut queue = Queue::new(0);
        let t = track("dup");
        queue.add(t.clone());
        queue.add(t.clone());

        queue.shift();
        assert!(queue.has(&t), "one copy still queued");
        queue.shift();
        assert!(!queue.has(&t));
    }

    #[test]
    fn unshift_and_move_to_front() {
        let mut queue = Queue::new(0);
        queue.add(track("t1"));
        queue.add(track("t2"));
        queue.add(track("t3"));

        queue.move_to_front(2).unwrap();
        assert_eq!(queue.get(0).unwrap().info.identifier, "t3");
        assert_eq!(queue.len(), 3);

        queue.unshift(track("t0"));
        assert_eq!(queue.shift().unwrap().info.identifier, "t0");
    }

    #[test]
    fn shuffle_requires_two_tracks() {
        let mut queue = Queue::new(0);
        assert!(matches!(
            queue.shuffle(),
            Err(LunalinkError::NotEnoughTracks { actual: 0, .. })
        ));

        queue.add(track("only"));
        assert!(queue.shuffle().is_err());
        assert_eq!(queue.len(), 1, "failed shuffle must not mutate");
        assert_eq!(queue.get(0).unwrap().info.identifier, "only");
    }

    #[test]
    fn shuffle_permutes_without_changing_the_multiset() {
        let mut queue = Queue::new(0);
        for i in 0..16 {
            queue.add(track(&format!("t{}", i)));
        }
        let before: HashSet<String> = queue.tracks().map(|t| t.encoded.clone()).collect();

        queue.shuffle().unwrap();

        let after: HashSet<String> = queue.tracks().map(|t| t.encoded.clone()).collect();
        assert_eq!(before, after);
        assert_eq!(queue.len(), 16);
        for i in 0..16 {
            assert!(queue.has(&track(&format!("t{}", i))));
        }
    }
}
