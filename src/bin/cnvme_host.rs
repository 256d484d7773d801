//! cnvme-host - drives a simulated controller through bring-up and a
//! handful of admin/I/O commands, the way the original project's `Main.cpp`
//! exercised the `Driver` class end to end.
//!
//! Usage: cnvme-host [OPTIONS]

use std::process::ExitCode;

use cnvme_sim::facade::{DataDirection, DriverCommand, DriverStatus, HostFacade};
use cnvme_sim::{command, identify, ControllerConfig};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<String> = None;
    let mut namespace_size: Option<u64> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            "-V" | "--version" => {
                println!("cnvme-host {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = Some(path.clone()),
                    None => {
                        eprintln!("--config requires a path argument");
                        return ExitCode::from(1);
                    }
                }
            }
            "--namespace-size" => {
                i += 1;
                match args.get(i).and_then(|v| v.parse::<u64>().ok()) {
                    Some(bytes) => namespace_size = Some(bytes),
                    None => {
                        eprintln!("--namespace-size requires a byte count");
                        return ExitCode::from(1);
                    }
                }
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage();
                return ExitCode::from(1);
            }
        }
        i += 1;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = match config_path {
        Some(path) => match ControllerConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load config from {path}: {err}");
                return ExitCode::from(1);
            }
        },
        None => ControllerConfig::default(),
    };
    if let Some(bytes) = namespace_size {
        config.namespace_size_bytes = bytes;
    }

    let model_number = config.model_number.clone();
    let serial_number = config.serial_number.clone();

    log::info!("bringing up controller ({model_number})");
    let facade = HostFacade::new(config);

    if !facade.controller().controller_regs().csts_rdy() {
        eprintln!("controller failed to become ready");
        return ExitCode::from(1);
    }
    println!("controller ready, CNTLID={}", facade.controller().cntlid());

    let keep_alive = command::NvmeCommand::new(command::opcode::admin::KEEP_ALIVE, 1);
    let mut keep_alive_cmd = DriverCommand::new(0, keep_alive);
    match facade.send_command(&mut keep_alive_cmd) {
        DriverStatus::SentSuccessfully if keep_alive_cmd.completion.is_success() => {
            println!("Keep Alive: success");
        }
        status => {
            eprintln!("Keep Alive failed: {} (SC={})", status.as_str(), keep_alive_cmd.completion.sc);
            return ExitCode::from(1);
        }
    }

    let mut identify_cmd = command::NvmeCommand::new(command::opcode::admin::IDENTIFY, 2);
    identify_cmd.set_dw10(command::cns::CONTROLLER as u32);
    let mut identify_driver_cmd = DriverCommand::new(0, identify_cmd).with_transfer(
        DataDirection::Read,
        identify::IDENTIFY_STRUCT_SIZE as u32,
    );
    match facade.send_command(&mut identify_driver_cmd) {
        DriverStatus::SentSuccessfully if identify_driver_cmd.completion.is_success() => {
            println!("Identify Controller:");
            println!("  Model Number:      {model_number}");
            println!("  Serial Number:     {serial_number}");
            println!("  Bytes Returned:    {}", identify_driver_cmd.transfer_data.len());
        }
        status => {
            eprintln!("Identify Controller failed: {}", status.as_str());
            return ExitCode::from(1);
        }
    }

    ExitCode::SUCCESS
}

fn print_usage() {
    println!("cnvme-host - simulated NVMe controller bring-up harness");
    println!();
    println!("USAGE:");
    println!("    cnvme-host [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <path>           Load controller config from a YAML file");
    println!("    --namespace-size <bytes>  Override the first namespace's media size");
    println!("    -V, --version             Show version information");
    println!("    -h, --help                Show this help message");
}
