//! Line-oriented editing of the guest configuration blob (`key: value`).
//!
//! Only the main section is touched: everything from the first `[section]`
//! line on (snapshots, pending changes) is carried through verbatim.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    lines: Vec<String>,
}

impl GuestConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Config(format!("config is not UTF-8: {e}")))?;
        Ok(Self { lines: text.lines().map(str::to_owned).collect() })
    }

    fn main_section(&self) -> usize {
        self.lines
            .iter()
            .position(|l| l.trim_start().starts_with('['))
            .unwrap_or(self.lines.len())
    }

    fn find(&self, key: &str) -> Option<usize> {
        self.lines[..self.main_section()].iter().position(|line| {
            line.split_once(':').is_some_and(|(k, _)| k.trim() == key)
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.find(key)
            .and_then(|i| self.lines[i].split_once(':'))
            .map(|(_, v)| v.trim())
    }

    /// Replace the value of `key`, or append it to the main section.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() || key.contains([':', '\n']) || value.contains('\n') {
            return Err(Error::Config(format!("invalid entry {key:?}: {value:?}")));
        }
        let line = format!("{key}: {value}");
        match self.find(key) {
            Some(i) => self.lines[i] = line,
            None => {
                let mut at = self.main_section();
                // Keep the blank separator line before the next section.
                while at > 0 && self.lines[at - 1].trim().is_empty() {
                    at -= 1;
                }
                self.lines.insert(at, line);
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out.into_bytes()
    }
}
