//! The PRP (Physical Region Page) engine: translates between a logical byte
//! range and NVMe's PRP1/PRP2 addressing scheme, gathering scattered host
//! pages into a contiguous [`Payload`] or scattering a contiguous payload
//! back out across them.
//!
//! A [`Prp`] built [`from_addresses`](Prp::from_addresses) only references
//! memory owned elsewhere (the host's) and frees nothing. One built
//! [`from_payload`](Prp::from_payload) allocates its own backing pages,
//! which are kept alive in `owned_pages` and freed normally when the `Prp`
//! drops - there is no separate "owning" type, just whether the `Prp` holds
//! pages of its own.

use crate::payload::Payload;

pub struct Prp {
    prp1: u64,
    prp2: u64,
    num_bytes: usize,
    mps: usize,
    owned_pages: Vec<Payload>,
}

impl Prp {
    /// A reference-only view over host-owned memory at `prp1`/`prp2`.
    pub fn from_addresses(prp1: u64, prp2: u64, num_bytes: usize, mps: usize) -> Self {
        Self {
            prp1,
            prp2,
            num_bytes,
            mps,
            owned_pages: Vec::new(),
        }
    }

    /// Allocates controller-owned pages (and, if needed, a chained PRP
    /// list) holding a copy of `payload`'s bytes.
    pub fn from_payload(payload: &Payload, mps: usize) -> Self {
        let num_bytes = payload.size();
        if num_bytes == 0 {
            return Self {
                prp1: 0,
                prp2: 0,
                num_bytes: 0,
                mps,
                owned_pages: Vec::new(),
            };
        }

        let mut owned_pages = Vec::new();
        let first_len = num_bytes.min(mps);
        let mut page1 = Payload::new(first_len);
        page1.buffer_mut().copy_from_slice(&payload.buffer()[..first_len]);
        let prp1 = page1.address();
        owned_pages.push(page1);

        let bytes_after_first = num_bytes - first_len;
        let mut prp2 = 0u64;

        if bytes_after_first > 0 {
            if !Self::uses_prp_list(num_bytes, mps) {
                let mut page2 = Payload::new(bytes_after_first);
                page2
                    .buffer_mut()
                    .copy_from_slice(&payload.buffer()[first_len..first_len + bytes_after_first]);
                prp2 = page2.address();
                owned_pages.push(page2);
            } else {
                let items_per_list = mps / 8;
                let total_items = Self::total_list_items(num_bytes, mps);
                let num_chains = (total_items + items_per_list - 1) / items_per_list;

                let mut list_pages: Vec<Payload> = (0..num_chains).map(|_| Payload::new(mps)).collect();
                let mut data_offset = first_len;

                for chain_idx in 0..num_chains {
                    let is_last_chain = chain_idx + 1 == num_chains;
                    let usable_slots = if is_last_chain { items_per_list } else { items_per_list - 1 };

                    for slot in 0..usable_slots {
                        if data_offset >= num_bytes {
                            break;
                        }
                        let len = (num_bytes - data_offset).min(mps);
                        let mut data_page = Payload::new(len);
                        data_page
                            .buffer_mut()
                            .copy_from_slice(&payload.buffer()[data_offset..data_offset + len]);
                        let addr = data_page.address();
                        let slot_offset = slot * 8;
                        list_pages[chain_idx].buffer_mut()[slot_offset..slot_offset + 8]
                            .copy_from_slice(&addr.to_le_bytes());
                        owned_pages.push(data_page);
                        data_offset += len;
                    }

                    if !is_last_chain {
                        let next_addr = list_pages[chain_idx + 1].address();
                        let link_offset = (items_per_list - 1) * 8;
                        list_pages[chain_idx].buffer_mut()[link_offset..link_offset + 8]
                            .copy_from_slice(&next_addr.to_le_bytes());
                    }
                }

                prp2 = list_pages[0].address();
                owned_pages.extend(list_pages);
            }
        }

        Self {
            prp1,
            prp2,
            num_bytes,
            mps,
            owned_pages,
        }
    }

    fn uses_prp_list(num_bytes: usize, mps: usize) -> bool {
        num_bytes > mps * 2
    }

    fn total_list_items(num_bytes: usize, mps: usize) -> usize {
        let first = num_bytes.min(mps);
        let remaining = num_bytes - first;
        (remaining + mps - 1) / mps
    }

    /// Walks PRP1 (and PRP2, directly or as a chained list) into an ordered
    /// list of `(address, length)` page descriptors - the same walk is used
    /// by both `gather` and `scatter` so they can never disagree about
    /// layout.
    fn page_descriptors(&self) -> Vec<(u64, usize)> {
        let mut descriptors = Vec::new();
        if self.num_bytes == 0 {
            return descriptors;
        }

        let first_len = self.num_bytes.min(self.mps);
        descriptors.push((self.prp1, first_len));
        let mut bytes_remaining = self.num_bytes - first_len;
        if bytes_remaining == 0 {
            return descriptors;
        }

        if !Self::uses_prp_list(self.num_bytes, self.mps) {
            descriptors.push((self.prp2, bytes_remaining));
            return descriptors;
        }

        let items_per_list = self.mps / 8;
        let total_items = Self::total_list_items(self.num_bytes, self.mps);
        let num_chains = (total_items + items_per_list - 1) / items_per_list;

        let mut list_addr = self.prp2;
        for chain_idx in 0..num_chains {
            let is_last_chain = chain_idx + 1 == num_chains;
            let usable_slots = if is_last_chain { items_per_list } else { items_per_list - 1 };
            // Safety: list_addr points at an `mps`-byte PRP list page,
            // either one we allocated ourselves or one the host built
            // according to the same NVMe layout this type implements.
            let list_bytes = unsafe { std::slice::from_raw_parts(list_addr as *const u8, self.mps) };

            for slot in 0..usable_slots {
                if bytes_remaining == 0 {
                    break;
                }
                let entry = u64::from_le_bytes(list_bytes[slot * 8..slot * 8 + 8].try_into().unwrap());
                let len = bytes_remaining.min(self.mps);
                descriptors.push((entry, len));
                bytes_remaining -= len;
            }

            if !is_last_chain {
                let link_offset = (items_per_list - 1) * 8;
                list_addr = u64::from_le_bytes(list_bytes[link_offset..link_offset + 8].try_into().unwrap());
            }
        }

        descriptors
    }

    /// Produces a contiguous copy of the described bytes.
    pub fn gather(&self) -> Payload {
        let mut result = Payload::new(self.num_bytes);
        let mut offset = 0usize;
        for (addr, len) in self.page_descriptors() {
            if len == 0 {
                continue;
            }
            // Safety: addresses come from page_descriptors, which only
            // yields ranges this Prp's construction already validated.
            let src = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
            result.buffer_mut()[offset..offset + len].copy_from_slice(src);
            offset += len;
        }
        result
    }

    /// Writes `payload`'s bytes into the existing described addresses.
    /// Returns `false` without writing anything if `payload` is larger than
    /// `num_bytes`.
    pub fn scatter(&self, payload: &Payload) -> bool {
        if payload.size() > self.num_bytes {
            return false;
        }
        let mut remaining = payload.size();
        let mut offset = 0usize;
        for (addr, len) in self.page_descriptors() {
            if remaining == 0 {
                break;
            }
            let take = len.min(remaining);
            if take == 0 {
                continue;
            }
            // Safety: same addresses gather() reads from.
            let dst = unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, take) };
            dst.copy_from_slice(&payload.buffer()[offset..offset + take]);
            offset += take;
            remaining -= take;
        }
        true
    }

    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    /// The raw PRP1 pointer, as it would appear in a command's DW6/DW7.
    pub fn prp1_address(&self) -> u64 {
        self.prp1
    }

    /// The raw PRP2 pointer, as it would appear in a command's DW8/DW9.
    pub fn prp2_address(&self) -> u64 {
        self.prp2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Payload {
        let mut p = Payload::new(len);
        for (i, b) in p.buffer_mut().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        p
    }

    #[test]
    fn empty_payload_is_a_no_op() {
        let p = Payload::new(0);
        let prp = Prp::from_payload(&p, 4096);
        assert_eq!(prp.gather().size(), 0);
    }

    #[test]
    fn single_page_round_trip() {
        let p = pattern(100);
        let prp = Prp::from_payload(&p, 4096);
        assert_eq!(prp.gather(), p);
    }

    #[test]
    fn two_page_direct_round_trip() {
        let p = pattern(5000); // between 4096 and 2*4096
        let prp = Prp::from_payload(&p, 4096);
        assert_eq!(prp.gather(), p);
    }

    #[test]
    fn twenty_thousand_bytes_uses_a_four_entry_prp_list_without_chaining() {
        let p = pattern(20_000);
        let mps = 4096;
        let prp = Prp::from_payload(&p, mps);
        assert_eq!(Prp::total_list_items(20_000, mps), 4);
        assert_eq!(prp.gather(), p);
    }

    #[test]
    fn chained_prp_list_round_trips() {
        // items_per_list = 8 for mps=64, so anything beyond 7 data items in
        // one list forces a chain.
        let mps = 64;
        let len = mps + mps * 10; // first page + 10 list-described pages
        let p = pattern(len);
        let prp = Prp::from_payload(&p, mps);
        assert!(Prp::total_list_items(len, mps) > mps / 8);
        assert_eq!(prp.gather(), p);
    }

    #[test]
    fn scatter_rejects_oversized_payload() {
        let backing = Payload::new(16);
        let prp = Prp::from_addresses(backing.address(), 0, 16, 4096);
        let too_big = Payload::new(32);
        assert!(!prp.scatter(&too_big));
    }

    #[test]
    fn reference_prp_writes_into_host_owned_memory() {
        let mut host_mem = Payload::new(16);
        let prp = Prp::from_addresses(host_mem.address(), 0, 16, 4096);
        let data = pattern(16);
        assert!(prp.scatter(&data));
        assert_eq!(host_mem.buffer(), data.buffer());
        // keep host_mem alive past the unsafe writes above
        host_mem.resize(16);
    }
}
