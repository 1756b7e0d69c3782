use std::collections::BTreeSet;

/// Sequential port counter handing out one port per scheduled job.
///
/// Landing on a reserved port advances one step further, so a single
/// reserved value turns the usual `+1` into a `+2`.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    next: u16,
    reserved: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(start: u16) -> Self {
        Self::with_reserved(start, std::iter::empty())
    }

    pub fn with_reserved(start: u16, reserved: impl IntoIterator<Item = u16>) -> Self {
        let mut allocator = Self {
            next: start,
            reserved: reserved.into_iter().collect(),
        };
        allocator.skip_reserved();
        allocator
    }

    /// The port the next call to [`allocate`](Self::allocate) returns.
    pub fn peek(&self) -> u16 {
        self.next
    }

    pub fn allocate(&mut self) -> u16 {
        let port = self.next;
        self.next = self.next.wrapping_add(1);
        self.skip_reserved();
        port
    }

    fn skip_reserved(&mut self) {
        while self.reserved.contains(&self.next) {
            self.next = self.next.wrapping_add(1);
        }
    }
}

impl Iterator for PortAllocator {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        Some(self.allocate())
    }
}

/// `count` consecutive ports from `start`, stepping over `reserved`.
pub fn allocate(start: u16, count: usize, reserved: &[u16]) -> Vec<u16> {
    PortAllocator::with_reserved(start, reserved.iter().copied())
        .take(count)
        .collect()
}
