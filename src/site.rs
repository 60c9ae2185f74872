//! Source-file and routine name tables.
//!
//! Site-tracking events carry 16-bit indices instead of names. Indices are
//! handed out in first-seen order starting at 1; the empty name is 0. At
//! the end of a run the tables are written as `name index` lines so a
//! backend can map indices back to names.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;

#[derive(Debug, Default)]
pub struct SiteIndex {
    by_name: HashMap<String, u16>,
    order: Vec<String>,
}

impl SiteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `name`, assigning the next free one on first sight. `None`
    /// once all 16-bit indices are taken.
    pub fn intern(&mut self, name: &str) -> Option<u16> {
        if name.is_empty() {
            return Some(0);
        }
        if let Some(idx) = self.by_name.get(name) {
            return Some(*idx);
        }
        let idx = u16::try_from(self.order.len() + 1).ok()?;
        self.by_name.insert(name.to_string(), idx);
        self.order.push(name.to_string());
        Some(idx)
    }

    pub fn get(&self, name: &str) -> Option<u16> {
        if name.is_empty() {
            return Some(0);
        }
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        for (i, name) in self.order.iter().enumerate() {
            writeln!(w, "{} {}", name, i + 1)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SiteTables {
    pub files: SiteIndex,
    pub routines: SiteIndex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut idx = SiteIndex::new();
        assert_eq!(idx.intern(""), Some(0));
        assert_eq!(idx.intern("main.c"), Some(1));
        assert_eq!(idx.intern("lock.c"), Some(2));
        assert_eq!(idx.intern("main.c"), Some(1));
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.get("lock.c"), Some(2));
        assert_eq!(idx.get("nope.c"), None);
    }

    #[test]
    fn test_write_lines() {
        let mut idx = SiteIndex::new();
        idx.intern("worker");
        idx.intern("main");
        let mut out = Vec::new();
        idx.write_to(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "worker 1\nmain 2\n");
    }
}
