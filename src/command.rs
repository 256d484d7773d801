//! The 64-byte NVMe command and 16-byte completion queue entry wire formats,
//! plus the admin/I/O opcode and status code constants the dispatcher
//! switches on.

use crate::regs::bits;

pub const COMMAND_SIZE: usize = 64;
pub const COMPLETION_SIZE: usize = 16;

/// Admin command opcodes (NVMe 1.2.1 Figure "Opcodes for Admin Commands").
pub mod opcode {
    pub mod admin {
        pub const DELETE_IO_SUBMISSION_QUEUE: u8 = 0x00;
        pub const CREATE_IO_SUBMISSION_QUEUE: u8 = 0x01;
        pub const GET_LOG_PAGE: u8 = 0x02;
        pub const DELETE_IO_COMPLETION_QUEUE: u8 = 0x04;
        pub const CREATE_IO_COMPLETION_QUEUE: u8 = 0x05;
        pub const IDENTIFY: u8 = 0x06;
        pub const ABORT: u8 = 0x08;
        pub const SET_FEATURES: u8 = 0x09;
        pub const GET_FEATURES: u8 = 0x0A;
        pub const KEEP_ALIVE: u8 = 0x18;
        pub const FORMAT_NVM: u8 = 0x80;
    }

    pub mod nvm {
        pub const FLUSH: u8 = 0x00;
        pub const WRITE: u8 = 0x01;
        pub const READ: u8 = 0x02;
    }
}

/// Identify CNS (Controller or Namespace Structure) selector values.
pub mod cns {
    pub const NAMESPACE_ACTIVE: u8 = 0x00;
    pub const CONTROLLER: u8 = 0x01;
    pub const NAMESPACES_ACTIVE: u8 = 0x02;
    pub const NAMESPACE_DESCRIPTOR: u8 = 0x03;
}

/// Format NVM SES (Secure Erase Settings) selector values.
pub mod ses {
    pub const NO_SECURE_ERASE: u8 = 0b000;
    pub const USER_DATA_ERASE: u8 = 0b001;
    pub const CRYPTOGRAPHIC_ERASE: u8 = 0b010;
}

/// Status Code Type (SCT) values.
pub mod sct {
    pub const GENERIC_COMMAND: u8 = 0x00;
    pub const COMMAND_SPECIFIC: u8 = 0x01;
    pub const MEDIA_AND_DATA_INTEGRITY: u8 = 0x02;
}

/// Status Code (SC) values within the Generic Command Status type.
pub mod sc_generic {
    pub const SUCCESSFUL_COMPLETION: u8 = 0x00;
    pub const INVALID_COMMAND_OPCODE: u8 = 0x01;
    pub const INVALID_FIELD_IN_COMMAND: u8 = 0x02;
    pub const COMMAND_ID_CONFLICT: u8 = 0x03;
    pub const LBA_OUT_OF_RANGE: u8 = 0x80;
    pub const CAPACITY_EXCEEDED: u8 = 0x81;
    pub const NAMESPACE_NOT_READY: u8 = 0x82;
}

/// Status Code (SC) values within the Command Specific Status type.
pub mod sc_specific {
    pub const COMPLETION_QUEUE_INVALID: u8 = 0x00;
    pub const INVALID_QUEUE_IDENTIFIER: u8 = 0x01;
    pub const INVALID_QUEUE_SIZE: u8 = 0x02;
    pub const INVALID_FORMAT: u8 = 0x0A;
    pub const INVALID_QUEUE_DELETION: u8 = 0x0C;
}

/// A fetched 64-byte NVMe command, parsed into its common and per-opcode
/// dword fields. Fetched by value, the same way the dispatcher copies a
/// submission queue slot out before acting on it.
#[derive(Debug, Clone, Copy)]
pub struct NvmeCommand {
    raw: [u8; COMMAND_SIZE],
}

impl NvmeCommand {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; COMMAND_SIZE];
        raw.copy_from_slice(&bytes[..COMMAND_SIZE]);
        Self { raw }
    }

    fn dword(&self, index: usize) -> u32 {
        u32::from_le_bytes(self.raw[index * 4..index * 4 + 4].try_into().unwrap())
    }

    pub fn opcode(&self) -> u8 {
        bits::get(self.dword(0) as u64, 0, 8) as u8
    }

    pub fn cid(&self) -> u16 {
        bits::get(self.dword(0) as u64, 16, 16) as u16
    }

    pub fn nsid(&self) -> u32 {
        self.dword(1)
    }

    pub fn prp1(&self) -> u64 {
        (self.dword(6) as u64) | ((self.dword(7) as u64) << 32)
    }

    pub fn prp2(&self) -> u64 {
        (self.dword(8) as u64) | ((self.dword(9) as u64) << 32)
    }

    pub fn dw10(&self) -> u32 {
        self.dword(10)
    }

    pub fn dw11(&self) -> u32 {
        self.dword(11)
    }

    pub fn dw12(&self) -> u32 {
        self.dword(12)
    }

    // ---- Create I/O Completion/Submission Queue (DW10 is shared) ----

    pub fn create_queue_qid(&self) -> u16 {
        bits::get(self.dw10() as u64, 0, 16) as u16
    }

    pub fn create_queue_qsize(&self) -> u16 {
        bits::get(self.dw10() as u64, 16, 16) as u16
    }

    pub fn create_cq_ien(&self) -> bool {
        bits::get(self.dw11() as u64, 1, 1) != 0
    }

    pub fn create_cq_iv(&self) -> u16 {
        bits::get(self.dw11() as u64, 16, 16) as u16
    }

    pub fn create_sq_cqid(&self) -> u16 {
        bits::get(self.dw11() as u64, 16, 16) as u16
    }

    // ---- Delete I/O Queue ----

    pub fn delete_queue_qid(&self) -> u16 {
        bits::get(self.dw10() as u64, 0, 16) as u16
    }

    // ---- Identify ----

    pub fn identify_cns(&self) -> u8 {
        bits::get(self.dw10() as u64, 0, 8) as u8
    }

    // ---- Format NVM ----

    pub fn format_lbaf(&self) -> u8 {
        bits::get(self.dw10() as u64, 0, 4) as u8
    }

    pub fn format_mset(&self) -> bool {
        bits::get(self.dw10() as u64, 4, 1) != 0
    }

    pub fn format_pi(&self) -> u8 {
        bits::get(self.dw10() as u64, 5, 2) as u8
    }

    pub fn format_pil(&self) -> bool {
        bits::get(self.dw10() as u64, 7, 1) != 0
    }

    pub fn format_ses(&self) -> u8 {
        bits::get(self.dw10() as u64, 8, 3) as u8
    }

    // ---- I/O Read/Write/Flush (DW10/DW11 alias to a 64-bit SLBA) ----

    pub fn slba(&self) -> u64 {
        (self.dw10() as u64) | ((self.dw11() as u64) << 32)
    }

    /// Zero-based number of logical blocks; callers apply `+1` per NVMe's
    /// one-based-from-zero-based convention.
    pub fn nlb(&self) -> u16 {
        bits::get(self.dw12() as u64, 0, 16) as u16
    }

    // ---- Host-side construction, used by `facade` to build the wire
    // format directly rather than through a submission queue fetch ----

    /// A zeroed command with the given opcode/CID filled into DW0.
    pub fn new(opcode: u8, cid: u16) -> Self {
        let mut cmd = Self { raw: [0u8; COMMAND_SIZE] };
        cmd.set_dword(0, (opcode as u32) | ((cid as u32) << 16));
        cmd
    }

    fn set_dword(&mut self, index: usize, value: u32) {
        self.raw[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_nsid(&mut self, nsid: u32) -> &mut Self {
        self.set_dword(1, nsid);
        self
    }

    pub fn set_prp1(&mut self, prp1: u64) -> &mut Self {
        self.set_dword(6, prp1 as u32);
        self.set_dword(7, (prp1 >> 32) as u32);
        self
    }

    pub fn set_prp2(&mut self, prp2: u64) -> &mut Self {
        self.set_dword(8, prp2 as u32);
        self.set_dword(9, (prp2 >> 32) as u32);
        self
    }

    pub fn set_dw10(&mut self, value: u32) -> &mut Self {
        self.set_dword(10, value);
        self
    }

    pub fn set_dw11(&mut self, value: u32) -> &mut Self {
        self.set_dword(11, value);
        self
    }

    pub fn set_dw12(&mut self, value: u32) -> &mut Self {
        self.set_dword(12, value);
        self
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_SIZE] {
        self.raw
    }
}

/// A completion queue entry awaiting posting. `dw0` carries command-specific
/// data (unused by every command this controller supports, so always 0
/// here); SQHD/SQID/CID/phase/status are filled in by the poster.
#[derive(Debug, Clone, Copy, Default)]
pub struct Completion {
    pub dw0: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub phase: bool,
    pub sc: u8,
    pub sct: u8,
    pub more: bool,
    pub dnr: bool,
}

impl Completion {
    /// A plain success completion for the given command, with SQHD/SQID/CID
    /// left for the poster to fill in.
    pub fn success() -> Self {
        Self::default()
    }

    pub fn error(sct: u8, sc: u8, dnr: bool) -> Self {
        Self {
            sct,
            sc,
            dnr,
            ..Default::default()
        }
    }

    /// Parses a completion queue entry read out of host memory - the
    /// inverse of [`Completion::to_bytes`], used by the host façade to
    /// interpret what the controller posted.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let dw0 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let dw2 = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let dw3 = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as u64;
        Self {
            dw0,
            sqhd: bits::get(dw2 as u64, 0, 16) as u16,
            sqid: bits::get(dw2 as u64, 16, 16) as u16,
            cid: bits::get(dw3, 0, 16) as u16,
            phase: bits::get(dw3, 16, 1) != 0,
            sc: bits::get(dw3, 17, 8) as u8,
            sct: bits::get(dw3, 25, 3) as u8,
            more: bits::get(dw3, 30, 1) != 0,
            dnr: bits::get(dw3, 31, 1) != 0,
        }
    }

    pub fn to_bytes(self) -> [u8; COMPLETION_SIZE] {
        let mut buf = [0u8; COMPLETION_SIZE];
        buf[0..4].copy_from_slice(&self.dw0.to_le_bytes());
        // DW1 reserved, left zero.
        let dw2 = (self.sqhd as u32) | ((self.sqid as u32) << 16);
        buf[8..12].copy_from_slice(&dw2.to_le_bytes());

        let mut dw3 = 0u64;
        dw3 = bits::set(dw3, 0, 16, self.cid as u64);
        dw3 = bits::set(dw3, 16, 1, self.phase as u64);
        dw3 = bits::set(dw3, 17, 8, self.sc as u64);
        dw3 = bits::set(dw3, 25, 3, self.sct as u64);
        dw3 = bits::set(dw3, 30, 1, self.more as u64);
        dw3 = bits::set(dw3, 31, 1, self.dnr as u64);
        buf[12..16].copy_from_slice(&(dw3 as u32).to_le_bytes());
        buf
    }

    pub fn is_success(&self) -> bool {
        self.sc == 0 && self.sct == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_with_dw0(opcode: u8, cid: u16) -> [u8; COMMAND_SIZE] {
        let mut raw = [0u8; COMMAND_SIZE];
        let dw0 = (opcode as u32) | ((cid as u32) << 16);
        raw[0..4].copy_from_slice(&dw0.to_le_bytes());
        raw
    }

    #[test]
    fn parses_opcode_and_cid() {
        let raw = command_with_dw0(opcode::admin::KEEP_ALIVE, 0x1234);
        let cmd = NvmeCommand::from_bytes(&raw);
        assert_eq!(cmd.opcode(), opcode::admin::KEEP_ALIVE);
        assert_eq!(cmd.cid(), 0x1234);
    }

    #[test]
    fn parses_prp_pointers() {
        let mut raw = command_with_dw0(opcode::nvm::WRITE, 1);
        raw[24..32].copy_from_slice(&0x1000u64.to_le_bytes());
        raw[32..40].copy_from_slice(&0x2000u64.to_le_bytes());
        let cmd = NvmeCommand::from_bytes(&raw);
        assert_eq!(cmd.prp1(), 0x1000);
        assert_eq!(cmd.prp2(), 0x2000);
    }

    #[test]
    fn parses_slba_and_nlb() {
        let mut raw = command_with_dw0(opcode::nvm::READ, 1);
        raw[40..48].copy_from_slice(&12345u64.to_le_bytes());
        raw[48..52].copy_from_slice(&1u32.to_le_bytes()); // NLB=1 -> 2 blocks
        let cmd = NvmeCommand::from_bytes(&raw);
        assert_eq!(cmd.slba(), 12345);
        assert_eq!(cmd.nlb(), 1);
    }

    #[test]
    fn completion_round_trips_through_bytes() {
        let c = Completion {
            sqhd: 1,
            sqid: 0,
            cid: 0x1234,
            phase: true,
            sc: 0,
            sct: 0,
            more: false,
            dnr: false,
            dw0: 0,
        };
        let bytes = c.to_bytes();
        let dw2 = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(dw2 & 0xFFFF, 1); // SQHD
        let dw3 = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(dw3 & 0xFFFF, 0x1234); // CID
        assert_eq!((dw3 >> 16) & 1, 1); // P
    }

    #[test]
    fn error_completion_sets_dnr() {
        let c = Completion::error(sct::GENERIC_COMMAND, sc_generic::COMMAND_ID_CONFLICT, true);
        assert!(!c.is_success());
        assert!(c.dnr);
        assert_eq!(c.sc, sc_generic::COMMAND_ID_CONFLICT);
    }

    #[test]
    fn completion_from_bytes_is_the_inverse_of_to_bytes() {
        let c = Completion {
            dw0: 0,
            sqhd: 3,
            sqid: 1,
            cid: 0xBEEF,
            phase: true,
            sc: sc_generic::LBA_OUT_OF_RANGE,
            sct: sct::GENERIC_COMMAND,
            more: false,
            dnr: true,
        };
        let parsed = Completion::from_bytes(&c.to_bytes());
        assert_eq!(parsed.sqhd, c.sqhd);
        assert_eq!(parsed.sqid, c.sqid);
        assert_eq!(parsed.cid, c.cid);
        assert_eq!(parsed.phase, c.phase);
        assert_eq!(parsed.sc, c.sc);
        assert_eq!(parsed.dnr, c.dnr);
    }

    #[test]
    fn builder_sets_prp_and_dwords() {
        let mut cmd = NvmeCommand::new(opcode::nvm::WRITE, 7);
        cmd.set_nsid(1).set_prp1(0x1000).set_prp2(0x2000).set_dw10(10).set_dw12(1);
        let parsed = NvmeCommand::from_bytes(&cmd.to_bytes());
        assert_eq!(parsed.opcode(), opcode::nvm::WRITE);
        assert_eq!(parsed.cid(), 7);
        assert_eq!(parsed.nsid(), 1);
        assert_eq!(parsed.prp1(), 0x1000);
        assert_eq!(parsed.prp2(), 0x2000);
        assert_eq!(parsed.slba(), 10);
        assert_eq!(parsed.nlb(), 1);
    }
}
