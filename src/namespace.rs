//! The namespace/media layer: a volatile per-namespace backing store with a
//! selectable LBA format, backing the Format NVM/Read/Write/Flush command
//! handlers.
//!
//! A [`Namespace`] owns exactly one [`Payload`] of media. There is no
//! separate "Identify Namespace struct" stored alongside it - that 4096-byte
//! blob is cheap to rebuild on demand from `current_lbaf` and the media size
//! (see [`crate::identify::namespace_struct`]), so there is nothing to keep
//! in sync.

use rand::RngCore;

use crate::command::{sc_generic, sc_specific, sct};
use crate::identify::{self, SUPPORTED_LBADS};
use crate::payload::Payload;

pub const NSID_MIN: u32 = 1;

/// Format NVM's Secure Erase Settings (SES) selector, decoded from DW10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureEraseSetting {
    NoSecureErase,
    UserDataErase,
    CryptographicErase,
}

impl SecureEraseSetting {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            crate::command::ses::NO_SECURE_ERASE => Some(Self::NoSecureErase),
            crate::command::ses::USER_DATA_ERASE => Some(Self::UserDataErase),
            crate::command::ses::CRYPTOGRAPHIC_ERASE => Some(Self::CryptographicErase),
            _ => None,
        }
    }
}

/// The outcome of a command-scoped namespace operation: either the command
/// succeeded, or it failed with a status the caller posts verbatim into a
/// completion. Namespace operations never return a `Result` error type -
/// every failure here is a recovered protocol/media condition per spec §7.
pub enum NsOutcome<T> {
    Ok(T),
    Status { sct: u8, sc: u8, dnr: bool },
}

impl<T> NsOutcome<T> {
    fn err(sct: u8, sc: u8) -> Self {
        Self::Status { sct, sc, dnr: true }
    }
}

/// One namespace: a selected LBA format and its volatile media.
pub struct Namespace {
    pub nsid: u32,
    current_lbaf: u8,
    media: Payload,
}

impl Namespace {
    /// Creates a namespace with `size_bytes` of zero-filled media formatted
    /// to `initial_lbaf` (an index into [`SUPPORTED_LBADS`]).
    ///
    /// `size_bytes` is rounded down to a whole number of sectors, matching
    /// the invariant `media_size mod sector_size == 0`.
    pub fn new(nsid: u32, size_bytes: u64, initial_lbaf: u8) -> Self {
        let sector_size = identify::lba_format_sector_size(initial_lbaf)
            .expect("initial_lbaf must be a supported LBA format") as u64;
        let whole_sectors = size_bytes / sector_size;
        Self {
            nsid,
            current_lbaf: initial_lbaf,
            media: Payload::new((whole_sectors * sector_size) as usize),
        }
    }

    pub fn current_lbaf(&self) -> u8 {
        self.current_lbaf
    }

    pub fn sector_size(&self) -> u64 {
        identify::lba_format_sector_size(self.current_lbaf).unwrap() as u64
    }

    pub fn size_in_sectors(&self) -> u64 {
        self.media.size() as u64 / self.sector_size()
    }

    pub fn identify_struct(&self) -> [u8; identify::IDENTIFY_STRUCT_SIZE] {
        identify::namespace_struct(self.media.size() as u64, self.current_lbaf)
    }

    fn lba_range_valid(&self, slba: u64, nlb_zero_based: u16) -> bool {
        let num_blocks = nlb_zero_based as u64 + 1;
        match slba.checked_add(num_blocks) {
            Some(end) => end <= self.size_in_sectors(),
            None => false,
        }
    }

    fn byte_range(&self, slba: u64, nlb_zero_based: u16) -> (usize, usize) {
        let sector_size = self.sector_size();
        let start = (slba * sector_size) as usize;
        let len = (nlb_zero_based as u64 + 1) as usize * sector_size as usize;
        (start, len)
    }

    /// Read handler: gathers `sector_size * (nlb+1)` bytes starting at
    /// `slba` from media. Callers scatter the returned payload via PRP.
    pub fn read(&self, slba: u64, nlb_zero_based: u16) -> NsOutcome<Payload> {
        if !self.lba_range_valid(slba, nlb_zero_based) {
            return NsOutcome::err(sct::GENERIC_COMMAND, sc_generic::LBA_OUT_OF_RANGE);
        }
        let (start, len) = self.byte_range(slba, nlb_zero_based);
        let mut out = Payload::new(len);
        out.buffer_mut().copy_from_slice(&self.media.buffer()[start..start + len]);
        NsOutcome::Ok(out)
    }

    /// Write handler: copies `data` into media starting at `slba`. `data`
    /// must already be exactly `sector_size * (nlb+1)` bytes (the dispatcher
    /// gathers it via PRP before calling this).
    pub fn write(&mut self, slba: u64, nlb_zero_based: u16, data: &Payload) -> NsOutcome<()> {
        if !self.lba_range_valid(slba, nlb_zero_based) {
            return NsOutcome::err(sct::GENERIC_COMMAND, sc_generic::LBA_OUT_OF_RANGE);
        }
        let (start, len) = self.byte_range(slba, nlb_zero_based);
        if data.size() != len {
            return NsOutcome::err(sct::GENERIC_COMMAND, sc_generic::INVALID_FIELD_IN_COMMAND);
        }
        self.media.buffer_mut()[start..start + len].copy_from_slice(data.buffer());
        NsOutcome::Ok(())
    }

    /// Format NVM handler. Validates LBAF/MSET/PI/PIL, switches the active
    /// LBA format, and performs the SES-selected erase.
    pub fn format(&mut self, lbaf: u8, mset: bool, pi: u8, pil: bool, ses_bits: u8) -> NsOutcome<()> {
        if lbaf as usize >= SUPPORTED_LBADS.len() || mset || pi != 0 || pil {
            return NsOutcome::err(sct::COMMAND_SPECIFIC, sc_specific::INVALID_FORMAT);
        }
        let Some(ses) = SecureEraseSetting::from_bits(ses_bits) else {
            return NsOutcome::err(sct::COMMAND_SPECIFIC, sc_specific::INVALID_FORMAT);
        };

        let total_bytes = self.media.size() as u64;
        let sector_size = identify::lba_format_sector_size(lbaf).unwrap() as u64;
        let whole_sectors = total_bytes / sector_size;
        let new_size = (whole_sectors * sector_size) as usize;

        match ses {
            SecureEraseSetting::NoSecureErase => {
                // LBAF switch may change the apparent sector count; SES=0
                // still zero-fills, matching the original's default branch.
                self.media = Payload::new(new_size);
            }
            SecureEraseSetting::UserDataErase => {
                self.media.resize(new_size);
                rand::thread_rng().fill_bytes(self.media.buffer_mut());
            }
            SecureEraseSetting::CryptographicErase => {
                // No cryptographic strength is modeled (spec §1 non-goal):
                // the media is simply discarded and re-allocated zeroed.
                self.media = Payload::new(new_size);
            }
        }

        self.current_lbaf = lbaf;
        NsOutcome::Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rounds_media_down_to_whole_sectors() {
        let ns = Namespace::new(1, 4096 * 3 + 10, 1); // LBAF[1] = 4096
        assert_eq!(ns.size_in_sectors(), 3);
    }

    #[test]
    fn write_then_read_round_trips_exact_bytes() {
        let mut ns = Namespace::new(1, 4096 * 4, 1);
        let mut pattern = Payload::new(4096 * 2);
        for (i, b) in pattern.buffer_mut().iter_mut().enumerate() {
            *b = (i % 200) as u8;
        }
        assert!(matches!(ns.write(2, 1, &pattern), NsOutcome::Ok(())));
        match ns.read(2, 1) {
            NsOutcome::Ok(data) => assert_eq!(data, pattern),
            NsOutcome::Status { .. } => panic!("expected Ok"),
        }
    }

    #[test]
    fn read_past_capacity_is_lba_out_of_range() {
        let ns = Namespace::new(1, 4096 * 2, 1);
        match ns.read(1, 5) {
            NsOutcome::Status { sct: s, sc, dnr } => {
                assert_eq!(s, sct::GENERIC_COMMAND);
                assert_eq!(sc, sc_generic::LBA_OUT_OF_RANGE);
                assert!(dnr);
            }
            NsOutcome::Ok(_) => panic!("expected out-of-range status"),
        }
    }

    #[test]
    fn slba_overflow_is_rejected_not_a_panic() {
        let ns = Namespace::new(1, 4096 * 2, 1);
        match ns.read(u64::MAX, 0) {
            NsOutcome::Status { sc, .. } => assert_eq!(sc, sc_generic::LBA_OUT_OF_RANGE),
            NsOutcome::Ok(_) => panic!("expected out-of-range status"),
        }
    }

    #[test]
    fn format_switches_lbaf_and_zero_fills() {
        let mut ns = Namespace::new(1, 8192 * 4, 2); // start at LBAF[2]=8192
        let mut pattern = Payload::new(8192);
        pattern.buffer_mut().fill(0xAA);
        ns.write(0, 0, &pattern).ok_or_panic();

        assert!(matches!(ns.format(0, false, 0, false, 0), NsOutcome::Ok(())));
        assert_eq!(ns.current_lbaf(), 0);
        assert_eq!(ns.sector_size(), 512);
        match ns.read(0, 0) {
            NsOutcome::Ok(data) => assert!(data.buffer().iter().all(|&b| b == 0)),
            NsOutcome::Status { .. } => panic!("expected Ok"),
        }
    }

    #[test]
    fn format_rejects_out_of_range_lbaf() {
        let mut ns = Namespace::new(1, 4096 * 4, 1);
        match ns.format(9, false, 0, false, 0) {
            NsOutcome::Status { sct: s, sc, .. } => {
                assert_eq!(s, sct::COMMAND_SPECIFIC);
                assert_eq!(sc, sc_specific::INVALID_FORMAT);
            }
            NsOutcome::Ok(_) => panic!("expected invalid format status"),
        }
    }

    #[test]
    fn format_rejects_nonzero_pi() {
        let mut ns = Namespace::new(1, 4096 * 4, 1);
        match ns.format(1, false, 1, false, 0) {
            NsOutcome::Status { sc, .. } => assert_eq!(sc, sc_specific::INVALID_FORMAT),
            NsOutcome::Ok(_) => panic!("expected invalid format status"),
        }
    }

    #[test]
    fn cryptographic_erase_reallocates_zeroed_media() {
        let mut ns = Namespace::new(1, 4096 * 4, 1);
        let mut pattern = Payload::new(4096);
        pattern.buffer_mut().fill(0xFF);
        ns.write(0, 0, &pattern).ok_or_panic();

        assert!(matches!(ns.format(1, false, 0, false, 2), NsOutcome::Ok(())));
        match ns.read(0, 0) {
            NsOutcome::Ok(data) => assert!(data.buffer().iter().all(|&b| b == 0)),
            NsOutcome::Status { .. } => panic!("expected Ok"),
        }
    }

    trait OkOrPanic {
        fn ok_or_panic(self);
    }

    impl OkOrPanic for NsOutcome<()> {
        fn ok_or_panic(self) {
            match self {
                NsOutcome::Ok(()) => {}
                NsOutcome::Status { sct, sc, dnr } => {
                    panic!("expected Ok, got status sct={sct} sc={sc} dnr={dnr}")
                }
            }
        }
    }
}
