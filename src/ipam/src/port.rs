use std::{fmt::Display, str::FromStr};

use super::{
    allocator::{Allocator, BitAllocator},
    error::Error,
};

pub const DEFAULT_NODE_PORT_RANGE: &str = "30000-32767";

const MAX_PORT: i32 = 65535;

/// An inclusive range of ports, `base` up to `base + size - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub base: i32,
    pub size: i32,
}

impl PortRange {
    pub fn new(base: i32, size: i32) -> Result<PortRange, Error> {
        let invalid = || Error::InvalidPortRange(format!("{base}+{}", size.saturating_sub(1)));
        if base < 1 || size < 1 {
            return Err(invalid());
        }
        match base.checked_add(size - 1) {
            Some(last) if last <= MAX_PORT => Ok(PortRange { base, size }),
            _ => Err(invalid()),
        }
    }

    pub fn contains(&self, port: i32) -> bool {
        port >= self.base && port < self.base + self.size
    }

    pub fn last(&self) -> i32 {
        self.base + self.size - 1
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            base: 30000,
            size: 2768,
        }
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.base, self.last())
    }
}

// Accepts "30000-32767", "30000+2767" or a single port.
impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidPortRange(s.to_string());
        let parse = |v: &str| v.trim().parse::<i32>().map_err(|_| invalid());
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid());
        }
        let (low, high) = if let Some((low, high)) = s.split_once('-') {
            (parse(low)?, parse(high)?)
        } else if let Some((low, offset)) = s.split_once('+') {
            let low = parse(low)?;
            let offset = parse(offset)?;
            if offset < 0 {
                return Err(invalid());
            }
            (low, low.checked_add(offset).ok_or_else(invalid)?)
        } else {
            let port = parse(s)?;
            (port, port)
        };
        if high < low {
            return Err(invalid());
        }
        let size = high
            .checked_sub(low)
            .and_then(|d| d.checked_add(1))
            .ok_or_else(invalid)?;
        PortRange::new(low, size).map_err(|_| invalid())
    }
}

#[derive(Debug)]
pub struct PortAllocator {
    port_range: PortRange,
    allocator: BitAllocator,
}

impl PortAllocator {
    pub fn new(port_range: PortRange) -> PortAllocator {
        PortAllocator {
            port_range,
            allocator: BitAllocator::new(port_range.size as usize),
        }
    }

    pub fn port_range(&self) -> PortRange {
        self.port_range
    }

    fn port_to_index(&self, port: i32) -> Result<usize, Error> {
        if !self.port_range.contains(port) {
            return Err(Error::OutOfRange {
                value: port.to_string(),
                range: self.port_range.to_string(),
            });
        }
        Ok((port - self.port_range.base) as usize)
    }

    fn index_to_port(&self, index: usize) -> i32 {
        self.port_range.base + index as i32
    }
}

impl Allocator for PortAllocator {
    type Value = i32;

    fn allocate(&self, port: i32) -> Result<(), Error> {
        let index = self.port_to_index(port)?;
        if !self.allocator.allocate(index)? {
            return Err(Error::AlreadyAllocated(port.to_string()));
        }
        Ok(())
    }

    fn allocate_next(&self) -> Result<i32, Error> {
        let index = self.allocator.allocate_next()?;
        Ok(self.index_to_port(index))
    }

    fn release(&self, port: i32) -> Result<(), Error> {
        let index = self.port_to_index(port)?;
        if !self.allocator.release(index)? {
            tracing::debug!(port, range=%self.port_range, "released port was not allocated");
        }
        Ok(())
    }

    fn has(&self, port: i32) -> bool {
        match self.port_to_index(port) {
            Ok(index) => self.allocator.is_allocated(index),
            Err(_) => false,
        }
    }

    fn verify(&self, port: i32) -> Result<(), Error> {
        let index = self.port_to_index(port)?;
        if self.allocator.is_allocated(index) {
            return Err(Error::AlreadyAllocated(port.to_string()));
        }
        Ok(())
    }

    fn peek_next(&self, exclude: &[i32]) -> Result<i32, Error> {
        let exclude = exclude
            .iter()
            .filter_map(|p| self.port_to_index(*p).ok())
            .collect::<Vec<usize>>();
        let index = self.allocator.peek_next(&exclude)?;
        Ok(self.index_to_port(index))
    }

    fn used(&self) -> usize {
        self.allocator.used()
    }

    fn free(&self) -> usize {
        self.port_range.size as usize - self.allocator.used()
    }

    fn range(&self) -> String {
        self.port_range.to_string()
    }
}
