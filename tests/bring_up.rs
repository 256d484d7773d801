//! End-to-end scenarios driven entirely through the public API, with the
//! controller, queues, and PRP engine exercised the same way a real host
//! would. Built with the `single-threaded` feature so every scenario is
//! deterministic: `tick()` replaces the background watcher threads.

#![cfg(feature = "single-threaded")]

use cnvme_sim::command::{cns, opcode, Completion, NvmeCommand, COMMAND_SIZE, COMPLETION_SIZE};
use cnvme_sim::facade::{DataDirection, DriverCommand, DriverStatus, HostFacade};
use cnvme_sim::prp::Prp;
use cnvme_sim::queue::ADMIN_QUEUE_ID;
use cnvme_sim::regs::{self, bits};
use cnvme_sim::{Controller, ControllerConfig, Payload};

fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.namespace_size_bytes = 4096 * 64;
    config.register_watcher_interval_ms = 1;
    config.doorbell_watcher_interval_ms = 1;
    config
}

/// Writes AQA/ASQ/ACQ and sets CC.EN=1 directly against the register
/// surface, exactly as scenario 1 of the bring-up properties describes.
fn bring_up_admin_queue(ctrl: &Controller, asq: &Payload, acq: &Payload) {
    let cregs = ctrl.controller_regs();
    let space = ctrl.register_space();
    space.write32(regs::NVME_REGS_OFFSET + 0x24, 1u32 | (1u32 << 16)); // ASQS=ACQS=1 (2 entries)
    space.write64(regs::NVME_REGS_OFFSET + 0x28, asq.address());
    space.write64(regs::NVME_REGS_OFFSET + 0x30, acq.address());
    cregs.set_cc_en(true);
    ctrl.tick();
}

#[test]
fn bring_up_reaches_ready_within_one_tick() {
    let ctrl = Controller::new(test_config());
    let asq = Payload::new(2 * COMMAND_SIZE);
    let acq = Payload::new(2 * COMPLETION_SIZE);
    bring_up_admin_queue(&ctrl, &asq, &acq);
    assert!(ctrl.controller_regs().csts_rdy());
}

#[test]
fn keep_alive_posts_expected_completion() {
    let ctrl = Controller::new(test_config());
    let mut asq = Payload::new(2 * COMMAND_SIZE);
    let acq = Payload::new(2 * COMPLETION_SIZE);
    bring_up_admin_queue(&ctrl, &asq, &acq);

    let cmd = NvmeCommand::new(opcode::admin::KEEP_ALIVE, 0x1234);
    asq.buffer_mut()[0..COMMAND_SIZE].copy_from_slice(&cmd.to_bytes());
    ctrl.controller_regs().write_sq_tail_doorbell(ADMIN_QUEUE_ID, 1);
    ctrl.tick();

    let completion = Completion::from_bytes(&acq.buffer()[0..COMPLETION_SIZE]);
    assert_eq!(completion.cid, 0x1234);
    assert_eq!(completion.sqid, ADMIN_QUEUE_ID);
    assert_eq!(completion.sqhd, 1);
    assert_eq!(completion.sc, 0);
    assert_eq!(completion.sct, 0);
    assert!(completion.phase);
}

#[test]
fn duplicate_cid_in_flight_is_rejected() {
    let ctrl = Controller::new(test_config());
    let mut asq = Payload::new(2 * COMMAND_SIZE);
    let acq = Payload::new(2 * COMPLETION_SIZE);
    bring_up_admin_queue(&ctrl, &asq, &acq);

    let first = NvmeCommand::new(opcode::admin::KEEP_ALIVE, 0x1234);
    asq.buffer_mut()[0..COMMAND_SIZE].copy_from_slice(&first.to_bytes());
    ctrl.controller_regs().write_sq_tail_doorbell(ADMIN_QUEUE_ID, 1);

    let second = NvmeCommand::new(opcode::admin::KEEP_ALIVE, 0x1234);
    asq.buffer_mut()[COMMAND_SIZE..2 * COMMAND_SIZE].copy_from_slice(&second.to_bytes());
    ctrl.controller_regs().write_sq_tail_doorbell(ADMIN_QUEUE_ID, 2);
    // Only one dispatch tick: both commands are already visible to the
    // dispatcher by the time it polls the doorbell once, so the second CID
    // collides with the first, which is still in flight this same tick.
    ctrl.tick();

    let completion = Completion::from_bytes(&acq.buffer()[COMPLETION_SIZE..2 * COMPLETION_SIZE]);
    assert_eq!(completion.cid, 0x1234);
    assert_eq!(completion.sc, 0x03);
    assert_eq!(completion.sct, 0);
    assert!(completion.dnr);
    assert!(completion.phase);
}

#[test]
fn controller_reset_preserves_admin_queue_and_drops_io_queues() {
    let facade = HostFacade::new(test_config());
    assert_eq!(facade.create_io_queue(1, 4), DriverStatus::SentSuccessfully);

    let ctrl = facade.controller();
    let cregs = ctrl.controller_regs();
    let asq_before = cregs.asq_address();
    let acq_before = cregs.acq_address();
    let aqa_before = (cregs.aqa_asqs(), cregs.aqa_acqs());

    // Scenario 4 also exercises CC.AMS, a field with no dedicated setter
    // since the host never needs to change it outside this kind of test.
    let space = ctrl.register_space();
    let cc_offset = regs::NVME_REGS_OFFSET + 0x14;
    let cc = space.read32(cc_offset);
    let cc = bits::set(cc as u64, 11, 3, 0b101) as u32;
    space.write32(cc_offset, cc);
    assert_eq!(cregs.cc_ams(), 0b101);

    assert!(facade.controller_reset());

    assert_eq!(cregs.asq_address(), asq_before);
    assert_eq!(cregs.acq_address(), acq_before);
    assert_eq!((cregs.aqa_asqs(), cregs.aqa_acqs()), aqa_before);
    assert_eq!(cregs.cc_ams(), 0);
    assert!(cregs.csts_rdy());

    let probe = NvmeCommand::new(opcode::admin::KEEP_ALIVE, 1);
    let mut probe_cmd = DriverCommand::new(1, probe);
    assert_eq!(facade.send_command(&mut probe_cmd), DriverStatus::NoMatchingSubmissionQueue);
}

#[test]
fn twenty_thousand_byte_payload_round_trips_through_prp() {
    let mps = 4096;
    let mut pattern = Payload::new(20_000);
    for (i, b) in pattern.buffer_mut().iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let prp = Prp::from_payload(&pattern, mps);
    assert_eq!(prp.gather(), pattern);
}

#[test]
fn read_after_write_returns_exact_bytes() {
    let facade = HostFacade::new(test_config());

    let mut format_cmd = NvmeCommand::new(opcode::admin::FORMAT_NVM, 10);
    format_cmd.set_nsid(1).set_dw10(1); // LBAF=1 (4096-byte sectors), MSET/PI/PIL/SES=0
    let mut format_driver_cmd = DriverCommand::new(ADMIN_QUEUE_ID, format_cmd);
    assert_eq!(facade.send_command(&mut format_driver_cmd), DriverStatus::SentSuccessfully);
    assert!(format_driver_cmd.completion.is_success());

    assert_eq!(facade.create_io_queue(1, 8), DriverStatus::SentSuccessfully);

    let mut pattern = vec![0u8; 2 * 4096];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = (i % 200) as u8;
    }

    let mut write_cmd = NvmeCommand::new(opcode::nvm::WRITE, 11);
    write_cmd.set_nsid(1).set_dw10(10).set_dw11(0).set_dw12(1); // SLBA=10, NLB=1 (2 sectors)
    let mut write_driver_cmd =
        DriverCommand::new(1, write_cmd).with_transfer(DataDirection::Write, pattern.len() as u32);
    write_driver_cmd.transfer_data = pattern.clone();
    assert_eq!(facade.send_command(&mut write_driver_cmd), DriverStatus::SentSuccessfully);
    assert!(write_driver_cmd.completion.is_success());

    let mut read_cmd = NvmeCommand::new(opcode::nvm::READ, 12);
    read_cmd.set_nsid(1).set_dw10(10).set_dw11(0).set_dw12(1);
    let mut read_driver_cmd =
        DriverCommand::new(1, read_cmd).with_transfer(DataDirection::Read, pattern.len() as u32);
    assert_eq!(facade.send_command(&mut read_driver_cmd), DriverStatus::SentSuccessfully);
    assert!(read_driver_cmd.completion.is_success());
    assert_eq!(read_driver_cmd.transfer_data, pattern);
}

#[test]
fn identify_cns_constant_matches_controller_selector() {
    // Sanity check that the façade and the dispatcher agree on CNS values,
    // since `cnvme-host` builds Identify commands by hand.
    assert_eq!(cns::CONTROLLER, 0x01);
}
