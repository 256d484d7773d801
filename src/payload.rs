//! An owned, resizable byte buffer with a stable address.
//!
//! A `Payload` stands in for a chunk of host or controller memory. Its
//! [`address`](Payload::address) is a real pointer value, valid for as long
//! as the backing allocation isn't replaced by [`resize`](Payload::resize) -
//! this lets the PRP engine and queue machinery treat host-visible memory
//! and controller-local buffers identically, the same way the underlying
//! hardware model treats every address as "just memory" shared between the
//! host and the device.

use std::fmt;

pub struct Payload {
    buffer: Box<[u8]>,
}

impl Payload {
    /// Allocates `size` zero-filled bytes.
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Allocates `size` bytes and copies them from the given address.
    ///
    /// # Safety
    /// `address` must point to at least `size` readable bytes.
    pub unsafe fn new_from(address: u64, size: usize) -> Self {
        let mut payload = Self::new(size);
        if size > 0 {
            let src = std::slice::from_raw_parts(address as *const u8, size);
            payload.buffer.copy_from_slice(src);
        }
        payload
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// A stable integer address usable as a memory pointer by both sides,
    /// valid until the next [`resize`](Payload::resize). Empty payloads have
    /// no backing allocation and report address 0.
    pub fn address(&self) -> u64 {
        if self.buffer.is_empty() {
            0
        } else {
            self.buffer.as_ptr() as u64
        }
    }

    /// Resizes the buffer, preserving `min(old_size, new_size)` bytes from
    /// the front. A no-op if `new_size == self.size()`.
    pub fn resize(&mut self, new_size: usize) {
        if new_size == self.size() {
            return;
        }
        let mut new_buffer = vec![0u8; new_size].into_boxed_slice();
        let keep = new_size.min(self.size());
        new_buffer[..keep].copy_from_slice(&self.buffer[..keep]);
        self.buffer = new_buffer;
    }

    /// Appends another payload's bytes to the end of this one.
    pub fn append(&mut self, other: &Payload) {
        let old_size = self.size();
        self.resize(old_size + other.size());
        self.buffer[old_size..].copy_from_slice(other.buffer());
    }
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.size() == other.size() && self.buffer == other.buffer
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("size", &self.size()).finish()
    }
}
