use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use super::{
    allocator::{Allocator, BitAllocator},
    error::Error,
};

// The allocator keeps a bitmap of the whole range, so IPv6 ranges are capped.
const MAX_IPV6_RANGE_SIZE: u128 = 1 << 16;

/// Allocates addresses out of a single CIDR.
///
/// The network address is never handed out, and neither is the broadcast
/// address of an IPv4 range.
#[derive(Debug)]
pub struct IpAllocator {
    cidr: IpNet,
    base: u128,
    max: usize,
    allocator: BitAllocator,
}

impl IpAllocator {
    pub fn new(cidr: IpNet) -> Result<IpAllocator, Error> {
        let cidr = cidr.trunc();
        let host_bits = u32::from(cidr.max_prefix_len() - cidr.prefix_len());
        let size = 2_u128.checked_pow(host_bits).unwrap_or(u128::MAX);
        let max = match cidr {
            // network and broadcast
            IpNet::V4(_) => size.saturating_sub(2),
            // network
            IpNet::V6(_) => size.min(MAX_IPV6_RANGE_SIZE).saturating_sub(1),
        };
        if max == 0 {
            return Err(Error::CIDRTooSmall(cidr.to_string()));
        }
        let max = max as usize;
        Ok(IpAllocator {
            cidr,
            base: addr_to_bits(&cidr.network()) + 1,
            max,
            allocator: BitAllocator::new(max),
        })
    }

    pub fn cidr(&self) -> &IpNet {
        &self.cidr
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.cidr, IpNet::V6(_))
    }

    pub fn size(&self) -> usize {
        self.max
    }

    fn addr_to_index(&self, addr: &IpAddr) -> Result<usize, Error> {
        match (&self.cidr, addr) {
            (IpNet::V4(_), IpAddr::V6(_)) | (IpNet::V6(_), IpAddr::V4(_)) => {
                return Err(Error::ProtocolMismatch(addr.to_string()))
            }
            _ => {}
        }
        let out_of_range = || Error::OutOfRange {
            value: addr.to_string(),
            range: self.cidr.to_string(),
        };
        if !self.cidr.contains(addr) {
            return Err(out_of_range());
        }
        let bits = addr_to_bits(addr);
        if bits < self.base {
            return Err(out_of_range());
        }
        let offset = bits - self.base;
        if offset >= self.max as u128 {
            return Err(out_of_range());
        }
        Ok(offset as usize)
    }

    fn index_to_addr(&self, index: usize) -> IpAddr {
        let bits = self.base + index as u128;
        match self.cidr {
            IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
        }
    }
}

impl Allocator for IpAllocator {
    type Value = IpAddr;

    fn allocate(&self, addr: IpAddr) -> Result<(), Error> {
        let index = self.addr_to_index(&addr)?;
        if !self.allocator.allocate(index)? {
            return Err(Error::AlreadyAllocated(addr.to_string()));
        }
        Ok(())
    }

    fn allocate_next(&self) -> Result<IpAddr, Error> {
        let index = self.allocator.allocate_next()?;
        Ok(self.index_to_addr(index))
    }

    fn release(&self, addr: IpAddr) -> Result<(), Error> {
        let index = self.addr_to_index(&addr)?;
        if !self.allocator.release(index)? {
            tracing::debug!(addr=%addr, range=%self.cidr, "released address was not allocated");
        }
        Ok(())
    }

    fn has(&self, addr: IpAddr) -> bool {
        match self.addr_to_index(&addr) {
            Ok(index) => self.allocator.is_allocated(index),
            Err(_) => false,
        }
    }

    fn verify(&self, addr: IpAddr) -> Result<(), Error> {
        let index = self.addr_to_index(&addr)?;
        if self.allocator.is_allocated(index) {
            return Err(Error::AlreadyAllocated(addr.to_string()));
        }
        Ok(())
    }

    fn peek_next(&self, exclude: &[IpAddr]) -> Result<IpAddr, Error> {
        let exclude = exclude
            .iter()
            .filter_map(|a| self.addr_to_index(a).ok())
            .collect::<Vec<usize>>();
        let index = self.allocator.peek_next(&exclude)?;
        Ok(self.index_to_addr(index))
    }

    fn used(&self) -> usize {
        self.allocator.used()
    }

    fn free(&self) -> usize {
        self.max - self.allocator.used()
    }

    fn range(&self) -> String {
        self.cidr.to_string()
    }
}

fn addr_to_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}
