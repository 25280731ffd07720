//! Bidirectional label table mapping classifier indices to student ids.
//!
//! Indices are assigned monotonically and never handed out again after a
//! removal; removing a student is expected to be followed by a full
//! retrain, which starts from a fresh table.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    by_index: BTreeMap<u32, String>,
    by_student: HashMap<String, u32>,
    next_index: u32,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index for a student, assigning a fresh one if unseen.
    pub fn assign(&mut self, student_id: &str) -> u32 {
        if let Some(&index) = self.by_student.get(student_id) {
            return index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.by_index.insert(index, student_id.to_string());
        self.by_student.insert(student_id.to_string(), index);
        index
    }

    pub fn index_of(&self, student_id: &str) -> Option<u32> {
        self.by_student.get(student_id).copied()
    }

    pub fn student_for(&self, index: u32) -> Option<&str> {
        self.by_index.get(&index).map(String::as_str)
    }

    /// Drop a student's mapping. The freed index is never reused.
    pub fn remove(&mut self, student_id: &str) -> Option<u32> {
        let index = self.by_student.remove(student_id)?;
        self.by_index.remove(&index);
        Some(index)
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_index.clear();
        self.by_student.clear();
        self.next_index = 0;
    }

    pub fn students(&self) -> impl Iterator<Item = &str> {
        self.by_index.values().map(String::as_str)
    }

    /// Write `index,studentId` lines.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut out = String::new();
        for (index, student) in &self.by_index {
            out.push_str(&format!("{index},{student}\n"));
        }
        fs::write(path, out)
    }

    /// Parse `index,studentId` lines. Malformed lines are skipped.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut table = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((index, student)) = line.split_once(',') else {
                tracing::warn!(line, "skipping malformed label line");
                continue;
            };
            let Ok(index) = index.trim().parse::<u32>() else {
                tracing::warn!(line, "skipping label line with bad index");
                continue;
            };
            let student = student.trim().to_string();
            table.by_student.insert(student.clone(), index);
            table.by_index.insert(index, student);
            table.next_index = table.next_index.max(index + 1);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_is_monotonic_and_stable() {
        let mut t = LabelTable::new();
        assert_eq!(t.assign("alice"), 0);
        assert_eq!(t.assign("bob"), 1);
        assert_eq!(t.assign("alice"), 0);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_removed_index_not_reused() {
        let mut t = LabelTable::new();
        t.assign("alice");
        t.assign("bob");
        assert_eq!(t.remove("bob"), Some(1));
        assert_eq!(t.assign("carol"), 2);
        assert_eq!(t.student_for(1), None);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");

        let mut t = LabelTable::new();
        t.assign("s-101");
        t.assign("s-102");
        t.remove("s-101");
        t.save(&path).unwrap();

        let loaded = LabelTable::load(&path).unwrap();
        assert_eq!(loaded.index_of("s-102"), Some(1));
        assert_eq!(loaded.index_of("s-101"), None);
        // The reverse index is live straight after load: re-assigning a
        // persisted student returns its existing index.
        let mut loaded = loaded;
        assert_eq!(loaded.assign("s-102"), 1);
        // next_index continues past the highest persisted index.
        assert_eq!(loaded.assign("s-103"), 2);
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        fs::write(&path, "0,alice\nnot-a-line\nx,bob\n1,carol\n").unwrap();

        let t = LabelTable::load(&path).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.student_for(1), Some("carol"));
    }
}
