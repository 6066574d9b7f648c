// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::fs::{self, File};
use std::io::Write;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use owo_colors::OwoColorize;
use pbr::{ProgressBar, Units};
use tracing_subscriber::EnvFilter;

use qdl::device::{
    self, DEFAULT_PRESERVE, erase_lun, erase_partition, flash_blob, get_active_slot, read_gpt,
    repair_gpt, set_active_slot,
};
use qdl::firehose::{
    firehose_get_storage_info, firehose_nop, firehose_read_buffer, firehose_reset,
    parse_storage_info,
};
use qdl::gpt::format_guid;
use qdl::sparse::Sparse;
use qdl::{
    FirehoseConfiguration, FirehoseResetMode, FirehoseStorageType, QdlBackend, QdlDevice,
    setup_target_device,
};

#[derive(Debug, Subcommand, PartialEq)]
enum Command {
    /// Dump a partition to a file
    #[command(name = "dump")]
    Dump {
        #[arg()]
        partition: String,

        #[arg()]
        out_path: String,
    },

    /// Erase a partition
    #[command(name = "erase")]
    Erase {
        #[arg()]
        partition: String,
    },

    /// Erase a whole LUN, preserving the partition table and `persist`
    #[command(name = "eraselun")]
    EraseLun {
        #[arg(value_parser=maybe_hex::<u8>)]
        lun: u8,
    },

    /// Write an image (raw or Android sparse) to a partition
    #[command(name = "flash")]
    Flash {
        #[arg()]
        partition: String,

        #[arg()]
        image_path: String,
    },

    /// Print the active A/B slot
    #[command(name = "getactiveslot")]
    GetActiveSlot,

    /// Query the storage geometry of every LUN
    #[command(name = "getstorageinfo")]
    GetStorageInfo,

    /// Ask the device to do nothing, hopefully successfully
    #[command(name = "nop")]
    Nop,

    /// Print the partition tables
    #[command(name = "printgpt")]
    PrintGpt,

    /// Rewrite a LUN's GPT from an image and regenerate its backup
    #[command(name = "repairgpt")]
    RepairGpt {
        #[arg(value_parser=maybe_hex::<u8>)]
        lun: u8,

        #[arg()]
        image_path: String,
    },

    /// Restart the device
    #[command(name = "reset")]
    Reset {
        #[arg(default_value = "reset", value_name = "reset/reset_to_edl/off")]
        mode: String,
    },

    /// Switch the active A/B slot
    #[command(name = "setactiveslot")]
    SetActiveSlot {
        #[arg(value_name = "a/b")]
        slot: String,
    },
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, value_name = "usb/serial")]
    backend: Option<String>,

    #[arg(short, long, help = "E.g. COM4 on Windows")]
    dev_path: Option<String>,

    #[arg(
        long,
        default_value = "info",
        value_name = "silent/error/warn/info/debug"
    )]
    log_level: String,

    /// Firehose loader binary for this device
    #[arg(short, long, value_name = "FILE")]
    programmer: String,

    // Only applies to the USB backend
    #[arg(long)]
    serial_no: Option<String>,

    #[arg(long)]
    sector_size: Option<usize>,

    #[arg(short, long, value_name = "emmc/ufs/nvme/nand")]
    storage_type: Option<String>,

    #[command(subcommand)]
    command: Command,
}

fn init_tracing(log_level: &str) -> Result<()> {
    match EnvFilter::builder()
        .with_env_var("QDL_LOG_LEVEL")
        .try_from_env()
    {
        Ok(filter) => tracing_subscriber::fmt().with_env_filter(filter).init(),
        Err(_) => {
            let level = match log_level {
                "silent" => None,
                "error" => Some(tracing::Level::ERROR),
                "warn" => Some(tracing::Level::WARN),
                "info" => Some(tracing::Level::INFO),
                "debug" => Some(tracing::Level::DEBUG),
                other => bail!("unknown log level '{other}'"),
            };
            match level {
                Some(level) => tracing_subscriber::fmt().with_max_level(level).init(),
                None => tracing_subscriber::fmt()
                    .with_max_level(tracing_subscriber::filter::LevelFilter::OFF)
                    .init(),
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version land here too and aren't failures
            let code = if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = e.print();
            return code;
        }
    };

    if let Err(e) = run(args) {
        eprintln!("{} {e:#}", "error:".bright_red());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<()> {
    init_tracing(&args.log_level)?;

    let backend = match &args.backend {
        Some(b) => QdlBackend::from_str(b)?,
        None => QdlBackend::default(),
    };

    let programmer = fs::read(&args.programmer)
        .with_context(|| format!("couldn't open the programmer binary {}", args.programmer))?;

    let mut fh_cfg = FirehoseConfiguration {
        backend,
        ..Default::default()
    };
    if let Some(t) = &args.storage_type {
        fh_cfg.storage_type = FirehoseStorageType::from_str(t)?;
        fh_cfg.storage_sector_size = fh_cfg.storage_type.default_sector_size();
    }
    if let Some(n) = args.sector_size {
        fh_cfg.storage_sector_size = n;
    }

    println!(
        "{} {}",
        env!("CARGO_PKG_NAME").green(),
        env!("CARGO_PKG_VERSION").yellow()
    );

    let mut rw_channel = setup_target_device(backend, args.serial_no, args.dev_path)
        .context("couldn't set up the device")?;
    let mut qdl_dev = QdlDevice::new(rw_channel.as_mut(), fh_cfg);

    if let Some(serial) = device::connect(&mut qdl_dev, &programmer)? {
        println!("Chip serial number: 0x{serial}");
    }

    match args.command {
        Command::Dump {
            partition,
            out_path,
        } => {
            let Some((gpt, part)) = device::find_partition(&mut qdl_dev, &partition)? else {
                bail!("partition '{partition}' not found on any LUN");
            };
            let sector_size = gpt.sector_size;
            let num_sectors = part.ending_lba - part.starting_lba + 1;
            let mut out = File::create(&out_path)?;

            let mut pb = ProgressBar::new(num_sectors * sector_size);
            pb.set_units(Units::Bytes);
            pb.message(&format!("Dumping {partition}: "));

            // 2048 sectors per read keeps the buffers reasonable
            let mut sector = part.starting_lba;
            let mut left = num_sectors;
            while left > 0 {
                let n = left.min(2048);
                let buf = firehose_read_buffer(&mut qdl_dev, gpt.lun, sector, n)?;
                out.write_all(&buf)?;
                pb.add(n * sector_size);
                sector += n;
                left -= n;
            }
            pb.finish();
        }
        Command::Erase { partition } => {
            if !erase_partition(&mut qdl_dev, &partition)? {
                bail!("couldn't erase '{partition}'");
            }
            println!("Erased {}", partition.bright_yellow());
        }
        Command::EraseLun { lun } => {
            if !erase_lun(&mut qdl_dev, lun, &DEFAULT_PRESERVE)? {
                bail!("couldn't erase LUN {lun}");
            }
            println!("Erased LUN {}", lun.bright_yellow());
        }
        Command::Flash {
            partition,
            image_path,
        } => {
            let blob = fs::read(&image_path)
                .with_context(|| format!("couldn't open the image {image_path}"))?;

            let total = match Sparse::from(&blob)? {
                Some(sparse) => sparse.expanded_size(),
                None => blob.len() as u64,
            };
            let mut pb = ProgressBar::new(total);
            pb.set_units(Units::Bytes);
            pb.message(&format!("Flashing {partition}: "));

            let mut on_progress = |n: u64| {
                pb.set(n);
            };
            if !flash_blob(&mut qdl_dev, &partition, &blob, Some(&mut on_progress))? {
                bail!("couldn't flash '{partition}'");
            }
            pb.finish();
            println!("Flashed {}", partition.bright_yellow());
        }
        Command::GetActiveSlot => {
            println!("Active slot: {}", get_active_slot(&mut qdl_dev)?);
        }
        Command::GetStorageInfo => {
            for lun in qdl_dev.fh_cfg.luns.clone() {
                let logs = firehose_get_storage_info(&mut qdl_dev, lun)?;
                match parse_storage_info(&logs) {
                    Some(info) => println!(
                        "LUN {lun}: {} blocks of {} B, type {}, product {}",
                        info.total_blocks,
                        info.block_size,
                        info.mem_type.as_deref().unwrap_or("?"),
                        info.prod_name.as_deref().unwrap_or("?"),
                    ),
                    None => println!("LUN {lun}: no storage_info in the device log"),
                }
            }
        }
        Command::Nop => println!(
            "Your nop was {}",
            match firehose_nop(&mut qdl_dev) {
                Ok(()) => "successful".bright_green().to_string(),
                Err(_) => "unsuccessful".bright_red().to_string(),
            }
        ),
        Command::PrintGpt => {
            for lun in qdl_dev.fh_cfg.luns.clone() {
                let gpt = match read_gpt(&mut qdl_dev, lun, None) {
                    Ok(gpt) => gpt,
                    Err(e) => {
                        println!("LUN {lun}: {e}");
                        continue;
                    }
                };

                println!("GPT on LUN {}:", lun.bright_yellow());
                for (idx, part) in gpt.partitions().enumerate() {
                    let sectors = part.ending_lba - part.starting_lba + 1;
                    println!(
                        "{idx}] {}: start_sector = {}, {sectors} sectors ({} kiB), type = {}",
                        part.partition_name.as_str().bright_blue(),
                        part.starting_lba,
                        sectors * gpt.sector_size / 1024,
                        format_guid(&part.partition_type_guid),
                    );
                }
            }
        }
        Command::RepairGpt { lun, image_path } => {
            let blob = fs::read(&image_path)
                .with_context(|| format!("couldn't open the GPT image {image_path}"))?;
            repair_gpt(&mut qdl_dev, lun, &blob)?;
            println!("Repaired the GPT on LUN {}", lun.bright_yellow());
        }
        Command::Reset { mode } => {
            let mode = FirehoseResetMode::from_str(&mode)?;
            firehose_reset(&mut qdl_dev, &mode, 0)?;
            println!("Device sent to {}", mode.to_string().bright_yellow());
        }
        Command::SetActiveSlot { slot } => {
            let slot = match slot.as_str() {
                "a" => 'a',
                "b" => 'b',
                other => bail!("expected slot 'a' or 'b', got '{other}'"),
            };
            set_active_slot(&mut qdl_dev, slot)?;
            println!("Active slot set to {}", slot.bright_yellow());
        }
    };

    Ok(())
}
