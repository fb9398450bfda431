//! RTC port allocation within the configured range.

use std::collections::BTreeSet;

#[derive(Debug)]
pub struct PortPool {
    min: u16,
    max: u16,
    next: u16,
    in_use: BTreeSet<u16>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            next: min,
            in_use: BTreeSet::new(),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Round-robin so a just-released port is not reused immediately.
    pub fn allocate(&mut self) -> Option<u16> {
        let span = u32::from(self.max - self.min) + 1;
        for _ in 0..span {
            let candidate = self.next;
            self.next = if self.next == self.max { self.min } else { self.next + 1 };
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}
