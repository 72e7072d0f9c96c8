//! Port allocation for instances
//!
//! Linear probing over a fixed `[start, end]` range, resuming from the last
//! port handed out. Which ports are taken is decided by the caller (the
//! registry's port map); the allocator itself only remembers its cursor.

use crate::error::{Result, SupervisorError};
use tracing::debug;

/// Hands out ports from a fixed inclusive range
#[derive(Debug, Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    cursor: Option<u16>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            cursor: None,
        }
    }

    /// Allocate the first port at or after the cursor for which `in_use`
    /// returns false, wrapping once to the start of the range.
    pub fn allocate<F>(&mut self, in_use: F) -> Result<u16>
    where
        F: Fn(u16) -> bool,
    {
        let exhausted = SupervisorError::ResourceExhausted {
            start: self.start,
            end: self.end,
        };
        if self.start > self.end {
            return Err(exhausted);
        }

        let (start, end) = (u32::from(self.start), u32::from(self.end));
        let mut port = match self.cursor.map(u32::from) {
            Some(c) if c >= start && c <= end => c,
            _ => start,
        };
        let mut wrapped = false;

        while in_use(port as u16) {
            port += 1;
            if port > end {
                if wrapped {
                    return Err(exhausted);
                }
                wrapped = true;
                port = start;
            }
        }

        let port = port as u16;
        self.cursor = Some(port);
        debug!(port, "Allocated port");
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn allocate_into(allocator: &mut PortAllocator, used: &mut HashSet<u16>) -> Result<u16> {
        let port = allocator.allocate(|p| used.contains(&p))?;
        used.insert(port);
        Ok(port)
    }

    #[test]
    fn test_first_allocation_starts_at_range_start() {
        let mut allocator = PortAllocator::new(9000, 9009);
        assert_eq!(allocator.allocate(|_| false).unwrap(), 9000);
        assert_eq!(allocator.cursor, Some(9000));
    }

    #[test]
    fn test_sequential_allocations() {
        let mut allocator = PortAllocator::new(9000, 9009);
        let mut used = HashSet::new();

        assert_eq!(allocate_into(&mut allocator, &mut used).unwrap(), 9000);
        assert_eq!(allocate_into(&mut allocator, &mut used).unwrap(), 9001);
        assert_eq!(allocate_into(&mut allocator, &mut used).unwrap(), 9002);
    }

    #[test]
    fn test_exhaustion_after_range_size_allocations() {
        let mut allocator = PortAllocator::new(9000, 9004);
        let mut used = HashSet::new();

        for _ in 0..5 {
            allocate_into(&mut allocator, &mut used).unwrap();
        }
        assert_eq!(used.len(), 5);

        let err = allocate_into(&mut allocator, &mut used).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::ResourceExhausted { start: 9000, end: 9004 }
        ));
    }

    #[test]
    fn test_wraps_to_freed_port_before_cursor() {
        let mut allocator = PortAllocator::new(9000, 9002);
        let mut used = HashSet::new();

        for _ in 0..3 {
            allocate_into(&mut allocator, &mut used).unwrap();
        }
        used.remove(&9000);

        assert_eq!(allocate_into(&mut allocator, &mut used).unwrap(), 9000);
    }

    #[test]
    fn test_never_returns_in_use_port() {
        let mut allocator = PortAllocator::new(9000, 9019);
        let mut used: HashSet<u16> = [9000, 9003, 9004, 9010].into_iter().collect();

        for _ in 0..16 {
            let before = used.clone();
            let port = allocate_into(&mut allocator, &mut used).unwrap();
            assert!(!before.contains(&port));
        }
        assert!(allocate_into(&mut allocator, &mut used).is_err());
    }

    #[test]
    fn test_resumes_from_cursor() {
        let mut allocator = PortAllocator::new(9000, 9009);
        let mut used = HashSet::new();

        allocate_into(&mut allocator, &mut used).unwrap();
        allocate_into(&mut allocator, &mut used).unwrap();
        used.remove(&9000);

        // 9000 is free again, but the scan continues from the cursor
        assert_eq!(allocate_into(&mut allocator, &mut used).unwrap(), 9002);
    }

    #[test]
    fn test_single_port_range() {
        let mut allocator = PortAllocator::new(9000, 9000);
        let mut used = HashSet::new();

        assert_eq!(allocate_into(&mut allocator, &mut used).unwrap(), 9000);
        assert!(allocate_into(&mut allocator, &mut used).is_err());
        used.clear();
        assert_eq!(allocate_into(&mut allocator, &mut used).unwrap(), 9000);
    }

    #[test]
    fn test_top_of_port_space_does_not_overflow() {
        let mut allocator = PortAllocator::new(65534, 65535);
        let mut used = HashSet::new();

        assert_eq!(allocate_into(&mut allocator, &mut used).unwrap(), 65534);
        assert_eq!(allocate_into(&mut allocator, &mut used).unwrap(), 65535);
        assert!(allocate_into(&mut allocator, &mut used).is_err());
    }

    #[test]
    fn test_inverted_range_is_exhausted() {
        let mut allocator = PortAllocator::new(9010, 9000);
        assert!(allocator.allocate(|_| false).is_err());
    }
}
