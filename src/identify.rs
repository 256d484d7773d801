//! Identify Controller / Identify Namespace blobs and the namespace
//! descriptor / active-namespace lists returned by the Identify admin
//! command. Every structure here is a static 4096-byte snapshot built from
//! [`ControllerConfig`] (and, for namespaces, the namespace's own current
//! state) - there is no persistent "identify struct" object to mutate, just
//! a pure builder function per CNS value, matching how little state these
//! actually carry once constructed.

use bitflags::bitflags;
use uuid::Uuid;

use crate::config::ControllerConfig;

bitflags! {
    /// Optional Admin Command Support (OACS) bits this controller advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionalAdminCommands: u16 {
        const SECURITY_SEND_RECEIVE = 1 << 0;
        const FORMAT_NVM            = 1 << 1;
        const FIRMWARE_COMMIT       = 1 << 2;
        const NAMESPACE_MANAGEMENT  = 1 << 3;
    }
}

pub const IDENTIFY_STRUCT_SIZE: usize = 4096;

const VID: usize = 0x00;
const SSID: usize = 0x02;
const SN: usize = 0x04;
const SN_LEN: usize = 20;
const MN: usize = SN + SN_LEN; // 0x18
const MN_LEN: usize = 40;
const FR: usize = MN + MN_LEN; // 0x40
const FR_LEN: usize = 8;
const CNTLID: usize = 0x4E;
const VER: usize = 0x50;
const OACS: usize = 0x100;
const ACL: usize = 0x102;
const AERL: usize = 0x103;
const SQES: usize = 0x200;
const CQES: usize = 0x201;
const NN: usize = 0x204;
const ONCS: usize = 0x208;
const VWC: usize = 0x20D;
const SUBNQN: usize = 0x300;
const SUBNQN_LEN: usize = 256;

fn write_padded_str(buf: &mut [u8], offset: usize, len: usize, value: &str) {
    write_filled_str(buf, offset, len, value, b' ');
}

fn write_filled_str(buf: &mut [u8], offset: usize, len: usize, value: &str, fill: u8) {
    let bytes = value.as_bytes();
    let copy_len = bytes.len().min(len);
    buf[offset..offset + copy_len].copy_from_slice(&bytes[..copy_len]);
    for slot in buf[offset + copy_len..offset + len].iter_mut() {
        *slot = fill;
    }
}

/// Builds the Subsystem NQN used by Identify Controller: the standard
/// `nqn.2014-08.org.nvmexpress:uuid:<uuid>` template with a freshly
/// generated random UUID filling the variable positions, matching the
/// original implementation's "replace placeholder characters with random
/// hex" scheme.
fn subsystem_nqn() -> String {
    format!("nqn.2014-08.org.nvmexpress:uuid:{}", Uuid::new_v4())
}

/// Builds the 4096-byte Identify Controller structure (CNS=0x01).
pub fn controller_struct(config: &ControllerConfig, cntlid: u16) -> [u8; IDENTIFY_STRUCT_SIZE] {
    let mut buf = [0u8; IDENTIFY_STRUCT_SIZE];

    buf[VID..VID + 2].copy_from_slice(&0xFFFFu16.to_le_bytes());
    buf[SSID..SSID + 2].copy_from_slice(&0x0001u16.to_le_bytes());
    write_padded_str(&mut buf, SN, SN_LEN, &config.serial_number);
    write_padded_str(&mut buf, MN, MN_LEN, &config.model_number);
    write_padded_str(&mut buf, FR, FR_LEN, &config.firmware_revision);
    buf[CNTLID..CNTLID + 2].copy_from_slice(&cntlid.to_le_bytes());

    // VER: MJR(16)/MNR(8)/TER(8) - NVMe 1.2.1.
    let ver: u32 = (1u32 << 16) | (2u32 << 8) | 1u32;
    buf[VER..VER + 4].copy_from_slice(&ver.to_le_bytes());

    buf[OACS..OACS + 2].copy_from_slice(&OptionalAdminCommands::FORMAT_NVM.bits().to_le_bytes());
    buf[ACL] = 3;
    buf[AERL] = 0;

    // SQES/CQES: required (low nibble) and maximum (high nibble) entry size
    // exponents. This controller only ever uses 64-byte commands and
    // 16-byte completions, so required == maximum for both.
    buf[SQES] = (6 << 4) | 6;
    buf[CQES] = (4 << 4) | 4;

    buf[NN..NN + 4].copy_from_slice(&config.max_namespaces.to_le_bytes());
    buf[ONCS..ONCS + 2].copy_from_slice(&0u16.to_le_bytes());
    buf[VWC] = 0;

    write_filled_str(&mut buf, SUBNQN, SUBNQN_LEN, &subsystem_nqn(), 0);

    buf
}

const NSZE: usize = 0x00;
const NCAP: usize = 0x08;
const NUSE: usize = 0x10;
const NSFEAT: usize = 0x18;
const NLBAF: usize = 0x19;
const FLBAS: usize = 0x1A;
const NMIC: usize = 0x1E;
const NVMCAP: usize = 0x30;
const LBAF: usize = 0x80;
const LBAF_ENTRY_SIZE: usize = 4;

/// Supported LBA Data Size exponents: 512, 4096, 8192 bytes (2^9, 2^12, 2^13).
pub const SUPPORTED_LBADS: [u8; 3] = [9, 12, 13];

pub fn lba_format_sector_size(index: u8) -> Option<u32> {
    SUPPORTED_LBADS.get(index as usize).map(|&lbads| 1u32 << lbads)
}

/// Builds the 4096-byte Identify Namespace structure (CNS=0x00).
pub fn namespace_struct(media_size: u64, current_lbaf: u8) -> [u8; IDENTIFY_STRUCT_SIZE] {
    let mut buf = [0u8; IDENTIFY_STRUCT_SIZE];

    let sector_size = lba_format_sector_size(current_lbaf).expect("current_lbaf must be valid") as u64;
    let size_in_sectors = media_size / sector_size;

    buf[NSZE..NSZE + 8].copy_from_slice(&size_in_sectors.to_le_bytes());
    buf[NCAP..NCAP + 8].copy_from_slice(&size_in_sectors.to_le_bytes());
    buf[NUSE..NUSE + 8].copy_from_slice(&size_in_sectors.to_le_bytes());
    buf[NSFEAT] = 0;
    buf[NLBAF] = (SUPPORTED_LBADS.len() - 1) as u8; // 0-based
    buf[FLBAS] = current_lbaf & 0x0F;
    buf[NMIC] = 1; // may be attached to more than one controller

    buf[NVMCAP..NVMCAP + 8].copy_from_slice(&media_size.to_le_bytes());

    for (i, &lbads) in SUPPORTED_LBADS.iter().enumerate() {
        let entry_off = LBAF + i * LBAF_ENTRY_SIZE;
        // MS(16)=0, LBADS(8), RP(2)/rsvd(6)=0
        buf[entry_off + 2] = lbads;
    }

    buf
}

/// Builds the 4096-byte Active Namespace ID list (CNS=0x02): a zero-terminated
/// list of active 32-bit NSIDs in ascending order.
pub fn active_namespace_list(nsids: &[u32]) -> [u8; IDENTIFY_STRUCT_SIZE] {
    let mut buf = [0u8; IDENTIFY_STRUCT_SIZE];
    for (i, &nsid) in nsids.iter().enumerate() {
        let off = i * 4;
        if off + 4 > IDENTIFY_STRUCT_SIZE {
            break;
        }
        buf[off..off + 4].copy_from_slice(&nsid.to_le_bytes());
    }
    buf
}

/// Builds the 4096-byte Namespace Identification Descriptor list (CNS=0x03).
/// This controller doesn't track EUI64/NGUID/UUID namespace identifiers, so
/// the list is empty (all-zero), which NVMe hosts interpret as "no
/// descriptors reported" - a valid, if minimal, response.
pub fn namespace_descriptor_list() -> [u8; IDENTIFY_STRUCT_SIZE] {
    [0u8; IDENTIFY_STRUCT_SIZE]
}
