use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tabdeck_proto::protocol::{PlaybackMode, PlaylistSummary};
use tabdeck_proto::track::Track;

/// Oldest shuffle history entries are dropped past this length.
const SHUFFLE_HISTORY_LIMIT: usize = 512;

/// Ordered, mutable queue of tracks with a cursor and a playback mode.
///
/// Invariant: `current` is `None` or a valid index; an empty playlist always
/// has `current == None`.
#[derive(Debug, Clone)]
pub struct Playlist {
    id: u32,
    name: String,
    tracks: Vec<Track>,
    current: Option<usize>,
    mode: PlaybackMode,
    column_layout: Option<String>,
    shuffle: ShuffleHistory,
    rng: StdRng,
}

/// Order in which shuffle mode visited tracks, plus a cursor so `previous`
/// can walk back and `next` can replay forward.
#[derive(Debug, Clone, Default)]
struct ShuffleHistory {
    order: Vec<usize>,
    cursor: usize,
    visited: HashSet<usize>,
}

impl ShuffleHistory {
    fn reset(&mut self, current: Option<usize>) {
        self.order.clear();
        self.visited.clear();
        self.cursor = 0;
        if let Some(c) = current {
            self.order.push(c);
            self.visited.insert(c);
        }
    }

    /// Record a freshly chosen index, discarding any forward history.
    fn record(&mut self, index: usize) {
        if !self.order.is_empty() {
            self.order.truncate(self.cursor + 1);
        }
        self.order.push(index);
        self.visited.insert(index);
        if self.order.len() > SHUFFLE_HISTORY_LIMIT {
            self.order.remove(0);
        }
        self.cursor = self.order.len() - 1;
    }
}

impl Playlist {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self::with_rng(id, name, StdRng::from_entropy())
    }

    /// Deterministic shuffle order, for tests.
    pub fn with_seed(id: u32, name: impl Into<String>, seed: u64) -> Self {
        Self::with_rng(id, name, StdRng::seed_from_u64(seed))
    }

    fn with_rng(id: u32, name: impl Into<String>, rng: StdRng) -> Self {
        Self {
            id,
            name: name.into(),
            tracks: Vec::new(),
            current: None,
            mode: PlaybackMode::default(),
            column_layout: None,
            shuffle: ShuffleHistory::default(),
            rng,
        }
    }

    // ── queries ───────────────────────────────────────────────────────────────

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current.and_then(|i| self.tracks.get(i))
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn column_layout(&self) -> Option<&str> {
        self.column_layout.as_deref()
    }

    pub fn summary(&self) -> PlaylistSummary {
        PlaylistSummary {
            id: self.id,
            name: self.name.clone(),
            mode: self.mode,
            current: self.current,
            tracks: self.tracks.iter().map(|t| t.locator().to_string()).collect(),
        }
    }

    // ── settings ──────────────────────────────────────────────────────────────

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_mode(&mut self, mode: PlaybackMode) {
        if self.mode != mode {
            self.mode = mode;
            self.shuffle.reset(self.current);
        }
    }

    pub fn set_column_layout(&mut self, layout: Option<String>) {
        self.column_layout = layout;
    }

    /// Move the cursor.  Out-of-range indices are ignored.
    pub fn set_current(&mut self, index: usize) -> bool {
        if index >= self.tracks.len() {
            return false;
        }
        self.current = Some(index);
        if self.mode == PlaybackMode::Shuffle {
            self.shuffle.record(index);
        }
        true
    }

    // ── editing ───────────────────────────────────────────────────────────────

    /// Insert `tracks` before `index`; any `index >= len` appends.
    /// The cursor keeps pointing at the same track.  Returns the position of
    /// the first inserted track.
    pub fn insert(&mut self, index: usize, tracks: Vec<Track>) -> usize {
        let at = index.min(self.tracks.len());
        let count = tracks.len();
        if count == 0 {
            return at;
        }
        self.tracks.splice(at..at, tracks);
        if let Some(c) = self.current {
            if c >= at {
                self.current = Some(c + count);
            }
        }
        self.shuffle.reset(self.current);
        at
    }

    pub fn append(&mut self, tracks: Vec<Track>) -> usize {
        self.insert(usize::MAX, tracks)
    }

    /// Remove the tracks at `indices` (unordered, duplicates and out-of-range
    /// entries ignored).  Removing the current track clears the cursor.
    /// Returns how many tracks were removed.
    pub fn remove(&mut self, indices: &[usize]) -> usize {
        let selected = self.normalize(indices);
        if selected.is_empty() {
            return 0;
        }
        for &i in selected.iter().rev() {
            self.tracks.remove(i);
        }
        self.current = match self.current {
            Some(c) if selected.binary_search(&c).is_ok() => None,
            Some(c) => Some(c - selected.partition_point(|&i| i < c)),
            None => None,
        };
        if self.tracks.is_empty() {
            self.current = None;
        }
        self.shuffle.reset(self.current);
        selected.len()
    }

    /// Move each selected track one row up.  Tracks already packed against the
    /// top stay where they are.  Returns the new positions of the selection.
    pub fn move_up(&mut self, indices: &[usize]) -> Vec<usize> {
        let selected = self.normalize(indices);
        let mut moved = Vec::with_capacity(selected.len());
        let mut floor = 0;
        for i in selected {
            if i == floor {
                floor += 1;
                moved.push(i);
                continue;
            }
            self.swap(i - 1, i);
            moved.push(i - 1);
        }
        self.shuffle.reset(self.current);
        moved
    }

    /// Mirror of `move_up`.
    pub fn move_down(&mut self, indices: &[usize]) -> Vec<usize> {
        let selected = self.normalize(indices);
        let mut moved = Vec::with_capacity(selected.len());
        let mut ceiling = self.tracks.len();
        for i in selected.into_iter().rev() {
            if i + 1 == ceiling {
                ceiling -= 1;
                moved.push(i);
                continue;
            }
            self.swap(i, i + 1);
            moved.push(i + 1);
        }
        moved.reverse();
        self.shuffle.reset(self.current);
        moved
    }

    /// Empty the queue.  The playback mode is kept.
    pub fn clear(&mut self) {
        self.tracks.clear();
        self.current = None;
        self.shuffle.reset(None);
    }

    // ── navigation ────────────────────────────────────────────────────────────

    /// Advance the cursor according to the playback mode.
    ///
    /// Returns the new cursor, or `None` when the step is a no-op (empty
    /// playlist, or the last track in sequential mode).
    pub fn next(&mut self) -> Option<usize> {
        let len = self.tracks.len();
        if len == 0 {
            return None;
        }
        let next = match (self.mode, self.current) {
            (PlaybackMode::Shuffle, _) => Some(self.shuffle_next()),
            (_, None) => Some(0),
            (PlaybackMode::Sequential, Some(i)) => (i + 1 < len).then_some(i + 1),
            (PlaybackMode::RepeatAll, Some(i)) => Some((i + 1) % len),
            (PlaybackMode::RepeatOne, Some(i)) => Some(i),
        };
        if next.is_some() {
            self.current = next;
        }
        next
    }

    /// Step the cursor back.  `None` when the step is a no-op (first track in
    /// sequential mode, start of the shuffle history).
    pub fn previous(&mut self) -> Option<usize> {
        let len = self.tracks.len();
        if len == 0 {
            return None;
        }
        let prev = match (self.mode, self.current) {
            (PlaybackMode::Shuffle, _) => self.shuffle_previous(),
            (PlaybackMode::RepeatAll, None) => Some(len - 1),
            (_, None) => None,
            (PlaybackMode::Sequential, Some(i)) => i.checked_sub(1),
            (PlaybackMode::RepeatAll, Some(i)) => Some((i + len - 1) % len),
            (PlaybackMode::RepeatOne, Some(i)) => Some(i),
        };
        if prev.is_some() {
            self.current = prev;
        }
        prev
    }

    fn shuffle_next(&mut self) -> usize {
        let history = &mut self.shuffle;
        if history.cursor + 1 < history.order.len() {
            history.cursor += 1;
            return history.order[history.cursor];
        }
        if history.order.is_empty() {
            if let Some(c) = self.current {
                history.record(c);
            }
        }

        let len = self.tracks.len();
        let current = self.current;
        let mut candidates: Vec<usize> = (0..len)
            .filter(|i| Some(*i) != current && !history.visited.contains(i))
            .collect();
        if candidates.is_empty() {
            // Every track has been visited: start a new round.
            history.visited.clear();
            if let Some(c) = current {
                history.visited.insert(c);
            }
            candidates = (0..len).filter(|i| Some(*i) != current).collect();
        }
        let pick = if candidates.is_empty() {
            current.unwrap_or(0)
        } else {
            candidates[self.rng.gen_range(0..candidates.len())]
        };
        self.shuffle.record(pick);
        pick
    }

    fn shuffle_previous(&mut self) -> Option<usize> {
        let history = &mut self.shuffle;
        if history.order.is_empty() || history.cursor == 0 {
            return None;
        }
        history.cursor -= 1;
        Some(history.order[history.cursor])
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn normalize(&self, indices: &[usize]) -> Vec<usize> {
        let mut selected: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| i < self.tracks.len())
            .collect();
        selected.sort_unstable();
        selected.dedup();
        selected
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.tracks.swap(a, b);
        self.current = self.current.map(|c| {
            if c == a {
                b
            } else if c == b {
                a
            } else {
                c
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(n: usize) -> Playlist {
        let mut p = Playlist::with_seed(1, "test", 7);
        p.append((0..n).map(|i| Track::local(format!("/m/{i}.flac"))).collect());
        p
    }

    fn names(p: &Playlist) -> Vec<String> {
        p.tracks()
            .iter()
            .map(|t| t.locator().trim_start_matches("/m/").trim_end_matches(".flac").to_string())
            .collect()
    }

    #[test]
    fn test_insert_into_empty_keeps_no_cursor() {
        let p = playlist(3);
        assert_eq!(p.len(), 3);
        assert_eq!(p.current_index(), None);
    }

    #[test]
    fn test_insert_before_cursor_shifts_it() {
        let mut p = playlist(3);
        p.set_current(1);
        let at = p.insert(0, vec![Track::local("/x.flac"), Track::local("/y.flac")]);
        assert_eq!(at, 0);
        assert_eq!(p.current_index(), Some(3));
        assert_eq!(p.current_track().unwrap().locator(), "/m/1.flac");

        p.insert(99, vec![Track::local("/z.flac")]);
        assert_eq!(p.get(5).unwrap().locator(), "/z.flac");
        assert_eq!(p.current_index(), Some(3));
    }

    #[test]
    fn test_remove_current_clears_cursor() {
        let mut p = playlist(4);
        p.set_current(2);
        assert_eq!(p.remove(&[2, 2, 9]), 1);
        assert_eq!(p.current_index(), None);
        assert_eq!(names(&p), vec!["0", "1", "3"]);
    }

    #[test]
    fn test_remove_before_cursor_shifts_it() {
        let mut p = playlist(5);
        p.set_current(4);
        p.remove(&[0, 2]);
        assert_eq!(p.current_index(), Some(2));
        assert_eq!(p.current_track().unwrap().locator(), "/m/4.flac");
    }

    #[test]
    fn test_remove_all_resets_cursor() {
        let mut p = playlist(2);
        p.set_current(0);
        p.remove(&[1, 0]);
        assert!(p.is_empty());
        assert_eq!(p.current_index(), None);
    }

    #[test]
    fn test_cursor_stays_in_bounds_under_random_edits() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut p = playlist(0);
        for _ in 0..2000 {
            let len = p.len();
            match rng.gen_range(0..4) {
                0 => {
                    let n = rng.gen_range(0..4);
                    let at = rng.gen_range(0..=len + 1);
                    p.insert(at, (0..n).map(|i| Track::local(format!("/r/{i}"))).collect());
                }
                1 if len > 0 => {
                    let picks: Vec<usize> = (0..rng.gen_range(1..=len))
                        .map(|_| rng.gen_range(0..len + 2))
                        .collect();
                    p.remove(&picks);
                }
                2 if len > 0 => {
                    p.set_current(rng.gen_range(0..len));
                }
                _ => {
                    p.next();
                }
            }
            match p.current_index() {
                None => {}
                Some(c) => assert!(c < p.len(), "cursor {c} out of bounds for {}", p.len()),
            }
            if p.is_empty() {
                assert_eq!(p.current_index(), None);
            }
        }
    }

    #[test]
    fn test_move_up_blocks_at_top() {
        let mut p = playlist(5);
        p.set_current(3);
        let moved = p.move_up(&[0, 1, 3]);
        assert_eq!(moved, vec![0, 1, 2]);
        assert_eq!(names(&p), vec!["0", "1", "3", "2", "4"]);
        assert_eq!(p.current_index(), Some(2));
    }

    #[test]
    fn test_move_down_blocks_at_bottom() {
        let mut p = playlist(5);
        p.set_current(4);
        let moved = p.move_down(&[1, 3, 4]);
        assert_eq!(moved, vec![2, 3, 4]);
        assert_eq!(names(&p), vec!["0", "2", "1", "3", "4"]);
        assert_eq!(p.current_index(), Some(4));
    }

    #[test]
    fn test_move_contiguous_block() {
        let mut p = playlist(4);
        let moved = p.move_up(&[2, 3]);
        assert_eq!(moved, vec![1, 2]);
        assert_eq!(names(&p), vec!["0", "2", "3", "1"]);
    }

    #[test]
    fn test_sequential_next_stops_at_end() {
        let n = 5;
        let mut p = playlist(n);
        p.set_current(0);
        for expected in 1..n {
            assert_eq!(p.next(), Some(expected));
        }
        assert_eq!(p.current_index(), Some(n - 1));
        assert_eq!(p.next(), None);
        assert_eq!(p.current_index(), Some(n - 1));
    }

    #[test]
    fn test_sequential_previous_stops_at_start() {
        let mut p = playlist(3);
        p.set_current(0);
        assert_eq!(p.previous(), None);
        assert_eq!(p.current_index(), Some(0));
    }

    #[test]
    fn test_repeat_all_wraps() {
        let n = 4;
        let mut p = playlist(n);
        p.set_mode(PlaybackMode::RepeatAll);
        p.set_current(0);
        for _ in 0..n {
            p.next();
        }
        assert_eq!(p.current_index(), Some(0));
        assert_eq!(p.previous(), Some(n - 1));
    }

    #[test]
    fn test_repeat_one_keeps_cursor() {
        let mut p = playlist(3);
        p.set_mode(PlaybackMode::RepeatOne);
        p.set_current(1);
        assert_eq!(p.next(), Some(1));
        assert_eq!(p.previous(), Some(1));
    }

    #[test]
    fn test_next_without_cursor_starts_at_zero() {
        let mut p = playlist(3);
        assert_eq!(p.next(), Some(0));
        let mut empty = playlist(0);
        assert_eq!(empty.next(), None);
        assert_eq!(empty.previous(), None);
    }

    #[test]
    fn test_shuffle_visits_every_track_once_per_round() {
        let n = 6;
        let mut p = playlist(n);
        p.set_mode(PlaybackMode::Shuffle);
        p.set_current(0);
        let mut seen: HashSet<usize> = HashSet::from([0]);
        for _ in 1..n {
            let i = p.next().unwrap();
            assert!(seen.insert(i), "index {i} repeated within a round");
        }
        assert_eq!(seen.len(), n);
        // Next round starts over without stalling.
        let i = p.next().unwrap();
        assert!(i < n);
    }

    #[test]
    fn test_shuffle_previous_replays_history() {
        let mut p = playlist(8);
        p.set_mode(PlaybackMode::Shuffle);
        p.set_current(3);
        let a = p.next().unwrap();
        let b = p.next().unwrap();
        assert_eq!(p.previous(), Some(a));
        assert_eq!(p.previous(), Some(3));
        assert_eq!(p.previous(), None);
        assert_eq!(p.next(), Some(a));
        assert_eq!(p.next(), Some(b));
    }

    #[test]
    fn test_shuffle_single_track() {
        let mut p = playlist(1);
        p.set_mode(PlaybackMode::Shuffle);
        assert_eq!(p.next(), Some(0));
        assert_eq!(p.next(), Some(0));
    }

    #[test]
    fn test_clear_keeps_mode() {
        let mut p = playlist(3);
        p.set_mode(PlaybackMode::RepeatAll);
        p.set_current(2);
        p.clear();
        assert!(p.is_empty());
        assert_eq!(p.current_index(), None);
        assert_eq!(p.mode(), PlaybackMode::RepeatAll);
    }
}
