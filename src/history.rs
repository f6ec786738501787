//! Command history for the line editor
//!
//! Stores committed input lines (newest last) and the recall cursor used by
//! Up/Down navigation.

/// Default maximum number of history entries
pub const HISTORY_LIMIT: usize = 1000;

/// Recall direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryDirection {
    Older,
    Newer,
}

/// Command history storage
#[derive(Debug, Clone)]
pub struct CommandHistory {
    /// All entries (newest last)
    entries: Vec<String>,
    /// Recall position; `entries.len()` means "not recalling"
    cursor: usize,
    /// Maximum entries
    max_entries: usize,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }

    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            max_entries: max_entries.max(1),
        }
    }

    /// Add a command to history and stop recalling.
    ///
    /// Blank lines and repeats of the newest entry are skipped.
    pub fn add(&mut self, command: &str) {
        if !command.trim().is_empty() && self.entries.last().map(String::as_str) != Some(command) {
            self.entries.push(command.to_string());
            if self.entries.len() > self.max_entries {
                let excess = self.entries.len() - self.max_entries;
                self.entries.drain(..excess);
            }
        }
        self.reset_cursor();
    }

    /// Step to the previous entry; clamps at the oldest one
    pub fn recall_older(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        self.cursor = self.cursor.saturating_sub(1);
        self.entries.get(self.cursor).map(String::as_str)
    }

    /// Step to the next entry. Moving past the newest entry returns the
    /// empty string and parks the cursor on the sentinel.
    pub fn recall_newer(&mut self) -> Option<&str> {
        if self.entries.is_empty() || self.cursor >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        Some(self.entries.get(self.cursor).map_or("", String::as_str))
    }

    pub fn recall(&mut self, direction: HistoryDirection) -> Option<&str> {
        match direction {
            HistoryDirection::Older => self.recall_older(),
            HistoryDirection::Newer => self.recall_newer(),
        }
    }

    /// Leave recall mode
    pub fn reset_cursor(&mut self) {
        self.cursor = self.entries.len();
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_recalling(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// Search history by substring, newest first, without duplicates
    pub fn search(&self, query: &str) -> Vec<&str> {
        let query_lower = query.to_lowercase();
        let mut seen = std::collections::HashSet::new();
        self.entries
            .iter()
            .rev()
            .filter(|e| e.to_lowercase().contains(&query_lower))
            .map(String::as_str)
            .filter(|e| seen.insert(*e))
            .collect()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_of(commands: &[&str]) -> CommandHistory {
        let mut history = CommandHistory::new();
        for c in commands {
            history.add(c);
        }
        history
    }

    #[test]
    fn test_recall_older_clamps_at_oldest() {
        let mut history = history_of(&["a", "b", "c"]);
        assert_eq!(history.recall_older(), Some("c"));
        assert_eq!(history.recall_older(), Some("b"));
        assert_eq!(history.recall_older(), Some("a"));
        assert_eq!(history.recall_older(), Some("a"));
        assert_eq!(history.cursor(), 0);
    }

    #[test]
    fn test_recall_newer_past_end_is_empty() {
        let mut history = history_of(&["a", "b"]);
        history.recall_older();
        history.recall_older();
        assert_eq!(history.recall_newer(), Some("b"));
        assert_eq!(history.recall_newer(), Some(""));
        assert!(!history.is_recalling());
        assert_eq!(history.recall_newer(), None);
        assert_eq!(history.cursor(), history.len());
    }

    #[test]
    fn test_skips_blank_and_consecutive_duplicates() {
        let history = history_of(&["ls", "ls", "  ", "", "pwd", "ls"]);
        assert_eq!(history.entries(), &["ls", "pwd", "ls"]);
    }

    #[test]
    fn test_limit_evicts_oldest() {
        let mut history = CommandHistory::with_limit(2);
        history.add("one");
        history.add("two");
        history.add("three");
        assert_eq!(history.entries(), &["two", "three"]);
        assert_eq!(history.cursor(), 2);
    }

    #[test]
    fn test_search_newest_first() {
        let history = history_of(&["git status", "ls", "git log", "git status"]);
        assert_eq!(history.search("GIT"), vec!["git status", "git log"]);
    }

    #[test]
    fn test_empty_history_recall() {
        let mut history = CommandHistory::new();
        assert_eq!(history.recall(HistoryDirection::Older), None);
        assert_eq!(history.recall(HistoryDirection::Newer), None);
        assert_eq!(history.cursor(), 0);
    }
}
