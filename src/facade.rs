//! The optional flat host-driver call surface (spec §6), modeled on the
//! original implementation's `Driver`/`DLL` C ABI: a `DRIVER_COMMAND`-style
//! record the host fills in, submitted through whichever queue it names,
//! with the controller's completion copied back out.
//!
//! This is explicitly an "external collaborator" per spec §1 - the core
//! (register engine, dispatcher, PRP/queue machinery) never calls into this
//! module. [`HostFacade`] plays the *host* side of the protocol: it owns
//! queue memory, writes commands into submission queue slots, rings
//! doorbells, and polls completion queues by phase bit, exactly as a real
//! NVMe driver must, since the controller never calls back into the host.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::command::{opcode, Completion, NvmeCommand, COMMAND_SIZE, COMPLETION_SIZE};
use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::payload::Payload;
use crate::prp::Prp;
use crate::queue::ADMIN_QUEUE_ID;
use crate::regs;

/// Mirrors the original DLL/Driver's `Status` enum: whether the façade
/// itself could submit the command, not whether the *command* succeeded
/// (that's reported in [`DriverCommand::completion`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    SentSuccessfully,
    NoMatchingSubmissionQueue,
    Timeout,
    BufferNotLargeEnough,
    InvalidDataDirection,
    InvalidDataLength,
}

impl DriverStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SentSuccessfully => "Sent Successfully",
            Self::NoMatchingSubmissionQueue => "Didn't have a queue with the specified id to send the command to",
            Self::Timeout => "The command timed out",
            Self::BufferNotLargeEnough => "The passed in payload was not large enough",
            Self::InvalidDataDirection => "The data direction given was invalid",
            Self::InvalidDataLength => "The data length was invalid",
        }
    }
}

/// Direction of the optional data transfer attached to a driver command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    Read,
    Write,
    BiDirectional,
}

/// A single driver-submitted command, mirroring the original's
/// `DRIVER_COMMAND`: the caller fills in everything but `driver_status` and
/// `completion`, which [`HostFacade::send_command`] fills in before
/// returning.
pub struct DriverCommand {
    pub driver_status: DriverStatus,
    pub timeout: Duration,
    pub queue_id: u16,
    pub command: [u8; COMMAND_SIZE],
    pub completion: Completion,
    pub data_direction: DataDirection,
    pub transfer_size: u32,
    /// Filled by the caller on Write/BiDirectional, by the façade on
    /// Read/BiDirectional.
    pub transfer_data: Vec<u8>,
}

impl DriverCommand {
    pub fn new(queue_id: u16, command: NvmeCommand) -> Self {
        Self {
            driver_status: DriverStatus::SentSuccessfully,
            timeout: Duration::from_secs(5),
            queue_id,
            command: command.to_bytes(),
            completion: Completion::default(),
            data_direction: DataDirection::None,
            transfer_size: 0,
            transfer_data: Vec::new(),
        }
    }

    pub fn with_transfer(mut self, direction: DataDirection, size: u32) -> Self {
        self.data_direction = direction;
        self.transfer_size = size;
        self
    }
}

/// One host-allocated queue pair the façade knows how to talk to: its own
/// submission-queue tail and completion-queue head/phase, tracked the way a
/// real host driver would (the controller never reads these back - the host
/// is expected to track its own view of the completion queue by polling the
/// phase bit).
struct HostQueue {
    sq: Payload,
    cq: Payload,
    sq_size: u16,
    cq_size: u16,
    sq_tail: u16,
    cq_head: u16,
    cq_expected_phase: bool,
}

/// Default admin queue depth this façade brings the controller up with
/// (0-based AQA.ASQS/ACQS = 15, i.e. 16 entries), matching the original's
/// `ADMIN_QUEUE_SIZE`.
const ADMIN_QUEUE_ENTRIES: u16 = 16;

/// The host side of the doorbell protocol. Constructing one brings the
/// underlying [`Controller`] up through admin queue bring-up, mirroring the
/// original `Driver::Driver()` constructor.
pub struct HostFacade {
    controller: Controller,
    queues: Mutex<HashMap<u16, HostQueue>>,
    next_cid: Mutex<u16>,
}

impl HostFacade {
    pub fn new(config: ControllerConfig) -> Self {
        let ready_timeout = Duration::from_millis(config.timeout_500ms_units as u64 * 500);
        let controller = Controller::new(config);
        let facade = Self {
            controller,
            queues: Mutex::new(HashMap::new()),
            next_cid: Mutex::new(0),
        };
        facade.bring_up_admin_queue(ready_timeout);
        facade
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    fn bring_up_admin_queue(&self, ready_timeout: Duration) {
        let sq = Payload::new(ADMIN_QUEUE_ENTRIES as usize * COMMAND_SIZE);
        let cq = Payload::new(ADMIN_QUEUE_ENTRIES as usize * COMPLETION_SIZE);

        let cregs = self.controller.controller_regs();
        let space = self.controller.register_space();
        let zero_based = (ADMIN_QUEUE_ENTRIES - 1) as u32;
        space.write32(regs::NVME_REGS_OFFSET + 0x24, zero_based | (zero_based << 16)); // AQA
        space.write64(regs::NVME_REGS_OFFSET + 0x28, sq.address()); // ASQ
        space.write64(regs::NVME_REGS_OFFSET + 0x30, cq.address()); // ACQ
        cregs.set_cc_en(true);

        self.wait_for_rdy(true, ready_timeout);

        self.queues.lock().insert(
            ADMIN_QUEUE_ID,
            HostQueue {
                sq,
                cq,
                sq_size: ADMIN_QUEUE_ENTRIES,
                cq_size: ADMIN_QUEUE_ENTRIES,
                sq_tail: 0,
                cq_head: 0,
                cq_expected_phase: true,
            },
        );
    }

    /// Ticks the register watcher (or, in single-threaded builds, the whole
    /// controller) until CSTS.RDY reaches `want_ready` or `timeout` elapses.
    fn wait_for_rdy(&self, want_ready: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.controller.controller_regs().csts_rdy() == want_ready {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.controller.wait_for_register_tick();
        }
    }

    /// Performs a controller reset by driving CC.EN 1->0->1, mirroring the
    /// DLL's `ControllerReset` export. Per spec §4.10, AQA/ASQ/ACQ survive
    /// the cycle, so the admin queue's host-side bookkeeping doesn't need
    /// to be rebuilt - only I/O queues are dropped.
    pub fn controller_reset(&self) -> bool {
        let timeout = Duration::from_millis(self.controller.controller_regs().cap_to() as u64 * 500);
        self.controller.controller_regs().set_cc_en(false);
        if !self.wait_for_rdy(false, timeout) {
            return false;
        }
        self.queues.lock().retain(|&id, _| id == ADMIN_QUEUE_ID);
        self.controller.controller_regs().set_cc_en(true);
        self.wait_for_rdy(true, timeout)
    }

    fn alloc_cid(&self) -> u16 {
        let mut next = self.next_cid.lock();
        let cid = *next;
        *next = next.wrapping_add(1);
        cid
    }

    /// Allocates host-owned submission/completion queue memory for a new
    /// I/O queue pair and issues the admin Create I/O CQ/SQ commands to
    /// register it with the controller (in that order, since Create I/O SQ
    /// requires the CQ to already exist). On success, `send_command` can
    /// thereafter target `qid`.
    pub fn create_io_queue(&self, qid: u16, entries: u16) -> DriverStatus {
        let cq = Payload::new(entries as usize * COMPLETION_SIZE);
        let mut cqid_cmd = NvmeCommand::new(opcode::admin::CREATE_IO_COMPLETION_QUEUE, self.alloc_cid());
        cqid_cmd.set_prp1(cq.address()).set_dw10((qid as u32) | (((entries - 1) as u32) << 16));
        let mut create_cq = DriverCommand::new(ADMIN_QUEUE_ID, cqid_cmd);
        let status = self.send_command(&mut create_cq);
        if status != DriverStatus::SentSuccessfully || !create_cq.completion.is_success() {
            return status;
        }

        let sq = Payload::new(entries as usize * COMMAND_SIZE);
        let mut sqid_cmd = NvmeCommand::new(opcode::admin::CREATE_IO_SUBMISSION_QUEUE, self.alloc_cid());
        sqid_cmd
            .set_prp1(sq.address())
            .set_dw10((qid as u32) | (((entries - 1) as u32) << 16))
            .set_dw11((qid as u32) << 16);
        let mut create_sq = DriverCommand::new(ADMIN_QUEUE_ID, sqid_cmd);
        let status = self.send_command(&mut create_sq);
        if status != DriverStatus::SentSuccessfully || !create_sq.completion.is_success() {
            return status;
        }

        self.queues.lock().insert(
            qid,
            HostQueue {
                sq,
                cq,
                sq_size: entries,
                cq_size: entries,
                sq_tail: 0,
                cq_head: 0,
                cq_expected_phase: true,
            },
        );
        DriverStatus::SentSuccessfully
    }

    /// Submits `cmd.command` on `cmd.queue_id`, wiring up PRP1/PRP2 for any
    /// attached transfer data, rings the doorbell, polls the linked
    /// completion queue by phase bit until `cmd.timeout` elapses, and fills
    /// in `cmd.completion`. Validation order mirrors the original
    /// `Driver::sendCommand`.
    pub fn send_command(&self, cmd: &mut DriverCommand) -> DriverStatus {
        if cmd.transfer_size == 0 && cmd.data_direction != DataDirection::None {
            cmd.driver_status = DriverStatus::InvalidDataLength;
            return cmd.driver_status;
        }
        if matches!(cmd.data_direction, DataDirection::Write | DataDirection::BiDirectional)
            && (cmd.transfer_data.len() as u32) < cmd.transfer_size
        {
            cmd.driver_status = DriverStatus::BufferNotLargeEnough;
            return cmd.driver_status;
        }

        let mut host_buffer = (cmd.transfer_size > 0).then(|| Payload::new(cmd.transfer_size as usize));
        if let Some(buf) = host_buffer.as_mut() {
            if matches!(cmd.data_direction, DataDirection::Write | DataDirection::BiDirectional) {
                buf.buffer_mut().copy_from_slice(&cmd.transfer_data[..cmd.transfer_size as usize]);
            }
        }
        let prp = host_buffer.as_ref().map(|buf| Prp::from_payload(buf, default_mps()));
        if let Some(prp) = &prp {
            let mut parsed = NvmeCommand::from_bytes(&cmd.command);
            // PRP1 was already set by the caller to whatever the opcode
            // needs it to mean (e.g. a queue base address for Create I/O
            // CQ/SQ); only commands that attach transfer data get their
            // PRP fields overwritten here.
            parsed.set_prp1(prp.prp1_address()).set_prp2(prp.prp2_address());
            cmd.command = parsed.to_bytes();
        }

        let (cq_head, expected_phase, cq_size) = {
            let mut queues = self.queues.lock();
            let Some(hq) = queues.get_mut(&cmd.queue_id) else {
                cmd.driver_status = DriverStatus::NoMatchingSubmissionQueue;
                return cmd.driver_status;
            };

            let slot = hq.sq_tail as usize;
            hq.sq.buffer_mut()[slot * COMMAND_SIZE..(slot + 1) * COMMAND_SIZE].copy_from_slice(&cmd.command);
            hq.sq_tail = (hq.sq_tail + 1) % hq.sq_size;
            self.controller.controller_regs().write_sq_tail_doorbell(cmd.queue_id, hq.sq_tail);

            (hq.cq_head, hq.cq_expected_phase, hq.cq_size)
        };

        let deadline = Instant::now() + cmd.timeout;
        loop {
            self.controller.wait_for_dispatch_tick();

            let mut queues = self.queues.lock();
            let hq = queues.get_mut(&cmd.queue_id).expect("queue removed while a command was in flight");
            let offset = cq_head as usize * COMPLETION_SIZE;
            let raw = hq.cq.buffer()[offset..offset + COMPLETION_SIZE].to_vec();
            let parsed = Completion::from_bytes(&raw);

            if parsed.phase == expected_phase {
                hq.cq_head = (cq_head + 1) % cq_size;
                if hq.cq_head == 0 {
                    hq.cq_expected_phase = !hq.cq_expected_phase;
                }
                drop(queues);

                cmd.completion = parsed;
                if let (Some(prp), Some(mut buf)) = (prp, host_buffer) {
                    if matches!(cmd.data_direction, DataDirection::Read | DataDirection::BiDirectional) {
                        buf = prp.gather();
                        cmd.transfer_data = buf.buffer().to_vec();
                    }
                }
                cmd.driver_status = DriverStatus::SentSuccessfully;
                return cmd.driver_status;
            }
            drop(queues);

            if Instant::now() >= deadline {
                cmd.driver_status = DriverStatus::Timeout;
                return cmd.driver_status;
            }
        }
    }
}

/// Page size used for every PRP built by this façade. A real host driver
/// reads CC.MPS to learn this instead of assuming 4096, but this façade
/// only ever talks to a controller it just brought up with the default MPS
/// (spec §4.9's identify/CAP defaults), so the constant matches
/// `controller::default_page_size`.
fn default_mps() -> usize {
    4096
}

#[cfg(all(feature = "capi", not(test)))]
pub mod capi {
    //! A thin `extern "C"` shim over [`HostFacade`], shaped like the
    //! original's `DLL.h`/`DLL.cpp` exports. Gated behind the `capi`
    //! feature since spec §6 only requires the call surface's *shape* be
    //! present, not that this crate ship its own cdylib target.

    use std::ffi::CString;
    use std::os::raw::c_char;
    use std::slice;
    use std::sync::OnceLock;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::{ControllerConfig, DataDirection, DriverCommand, DriverStatus, HostFacade};
    use crate::command::{NvmeCommand, COMMAND_SIZE, COMPLETION_SIZE};

    static FACADE: OnceLock<Mutex<Option<HostFacade>>> = OnceLock::new();

    fn facade_slot() -> &'static Mutex<Option<HostFacade>> {
        FACADE.get_or_init(|| Mutex::new(None))
    }

    /// Status codes returned to the caller, mirroring `DLL.cpp`'s
    /// `StatusCodes` enum.
    #[repr(C)]
    pub enum CApiStatus {
        NoErrors = 0,
        AlreadyInitialized = 1,
        AlreadyUninitialized = 2,
    }

    /// Must be the first exported function called. Initializes the façade
    /// with default configuration.
    #[no_mangle]
    pub extern "C" fn cnvme_initialize() -> i64 {
        let mut slot = facade_slot().lock();
        if slot.is_some() {
            return CApiStatus::AlreadyInitialized as i64;
        }
        *slot = Some(HostFacade::new(ControllerConfig::default()));
        CApiStatus::NoErrors as i64
    }

    /// A C-compatible `DRIVER_COMMAND` record (spec §6): the caller fills in
    /// `timeout_ms`/`queue_id`/`command`/`data_direction`/`transfer_size`
    /// (and, for a write, `transfer_data`); [`cnvme_send_command`] fills in
    /// `driver_status`/`completion`/`command` (PRP1/PRP2 get wired up) and,
    /// for a read, `transfer_data`.
    ///
    /// `data_direction` is `0 = none`, `1 = read`, `2 = write`, `3 =
    /// bidirectional`, matching [`DataDirection`]'s declaration order.
    /// `transfer_data` must point to at least `transfer_size` bytes,
    /// allocated and owned by the caller, whenever `data_direction` isn't
    /// `none`.
    #[repr(C)]
    pub struct CDriverCommand {
        pub driver_status: i64,
        pub timeout_ms: u64,
        pub queue_id: u16,
        pub command: [u8; COMMAND_SIZE],
        pub completion: [u8; COMPLETION_SIZE],
        pub data_direction: i32,
        pub transfer_size: u32,
        pub transfer_data: *mut u8,
    }

    fn driver_status_code(status: DriverStatus) -> i64 {
        match status {
            DriverStatus::SentSuccessfully => 0,
            DriverStatus::NoMatchingSubmissionQueue => 1,
            DriverStatus::Timeout => 2,
            DriverStatus::BufferNotLargeEnough => 3,
            DriverStatus::InvalidDataDirection => 4,
            DriverStatus::InvalidDataLength => 5,
        }
    }

    fn data_direction_from_code(code: i32) -> Option<DataDirection> {
        match code {
            0 => Some(DataDirection::None),
            1 => Some(DataDirection::Read),
            2 => Some(DataDirection::Write),
            3 => Some(DataDirection::BiDirectional),
            _ => None,
        }
    }

    /// Submits `(*cmd).command` on `(*cmd).queue_id`, mirroring the
    /// original's `Driver::sendCommand` export. Writes the posted
    /// completion, the (possibly PRP-rewritten) command, and - for a read or
    /// bidirectional transfer - the returned data back into `*cmd`, and
    /// returns the same status code it stores in `driver_status`.
    ///
    /// # Safety
    /// `cmd` must be non-null and point to a valid, writable
    /// [`CDriverCommand`]. If `data_direction` is not `none`,
    /// `transfer_data` must point to at least `transfer_size` bytes, valid
    /// for reads (on a write/bidirectional transfer) and writes (on a
    /// read/bidirectional transfer) for the duration of this call.
    #[no_mangle]
    pub unsafe extern "C" fn cnvme_send_command(cmd: *mut CDriverCommand) -> i64 {
        if cmd.is_null() {
            return -1;
        }
        let c = &mut *cmd;

        let slot = facade_slot().lock();
        let Some(facade) = slot.as_ref() else {
            c.driver_status = CApiStatus::AlreadyUninitialized as i64;
            return c.driver_status;
        };

        let Some(direction) = data_direction_from_code(c.data_direction) else {
            c.driver_status = driver_status_code(DriverStatus::InvalidDataDirection);
            return c.driver_status;
        };

        let mut driver_cmd = DriverCommand::new(c.queue_id, NvmeCommand::from_bytes(&c.command)).with_transfer(direction, c.transfer_size);
        driver_cmd.timeout = Duration::from_millis(c.timeout_ms);

        if matches!(direction, DataDirection::Write | DataDirection::BiDirectional) && c.transfer_size > 0 {
            driver_cmd.transfer_data = slice::from_raw_parts(c.transfer_data, c.transfer_size as usize).to_vec();
        }

        let status = facade.send_command(&mut driver_cmd);

        c.command = driver_cmd.command;
        c.completion = driver_cmd.completion.to_bytes();
        if matches!(direction, DataDirection::Read | DataDirection::BiDirectional) && c.transfer_size > 0 && !c.transfer_data.is_null() {
            let dst = slice::from_raw_parts_mut(c.transfer_data, c.transfer_size as usize);
            let take = dst.len().min(driver_cmd.transfer_data.len());
            dst[..take].copy_from_slice(&driver_cmd.transfer_data[..take]);
        }

        c.driver_status = driver_status_code(status);
        c.driver_status
    }

    /// Performs a controller reset. Returns a negative value if not
    /// initialized.
    #[no_mangle]
    pub extern "C" fn cnvme_controller_reset() -> i64 {
        let slot = facade_slot().lock();
        match slot.as_ref() {
            Some(facade) => {
                if facade.controller_reset() {
                    CApiStatus::NoErrors as i64
                } else {
                    -1
                }
            }
            None => CApiStatus::AlreadyUninitialized as i64,
        }
    }

    /// Returns a heap-allocated, NUL-terminated string; the caller owns it
    /// and must free it with [`cnvme_free_string`].
    #[no_mangle]
    pub extern "C" fn cnvme_get_status_string(status_code: i64) -> *mut c_char {
        let text = match status_code {
            x if x == CApiStatus::NoErrors as i64 => "Completed Successfully",
            x if x == CApiStatus::AlreadyInitialized as i64 => "The façade was already initialized",
            x if x == CApiStatus::AlreadyUninitialized as i64 => "The façade was already uninitialized",
            _ => "Unknown Status",
        };
        CString::new(text).unwrap().into_raw()
    }

    /// Should be the last method called. Uninitializes the façade.
    #[no_mangle]
    pub extern "C" fn cnvme_uninitialize() -> i64 {
        let mut slot = facade_slot().lock();
        if slot.take().is_none() {
            return CApiStatus::AlreadyUninitialized as i64;
        }
        CApiStatus::NoErrors as i64
    }

    /// Frees a string returned by [`cnvme_get_status_string`].
    ///
    /// # Safety
    /// `ptr` must have been returned by `cnvme_get_status_string` and not
    /// already freed.
    #[no_mangle]
    pub unsafe extern "C" fn cnvme_free_string(ptr: *mut c_char) {
        if !ptr.is_null() {
            drop(CString::from_raw(ptr));
        }
    }
}
