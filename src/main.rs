#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use twiboot::config::{self, Config};
use twiboot::protocol::*;
use twiboot::sim::Simulator;
use twiboot::Shared;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Part to simulate (atmega8, atmega88, atmega168, atmega328p)
    #[structopt(long, default_value = "atmega88")]
    chip: String,

    /// Raw application image to write to flash
    #[structopt(long)]
    image: Option<PathBuf>,

    /// Raw data to write to EEPROM
    #[structopt(long)]
    eeprom: Option<PathBuf>,

    /// Stay off the bus and let the boot timeout start the application
    #[structopt(long)]
    autoboot: bool,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, LogConfig::default());

    let config = match config::chip(&o.chip) {
        Some(c) => c,
        None => {
            error!("Unknown chip: {}", o.chip);
            return;
        }
    };

    // Page buffer size is fixed at build time
    let r = match config.page_size {
        64 => run::<64>(config, &o),
        128 => run::<128>(config, &o),
        n => Err(anyhow!("Unsupported page size: {}", n)),
    };

    if let Err(e) = r {
        error!("{:?}", e);
    }
}

fn run<const PAGE: usize>(config: &Config, o: &Args) -> anyhow::Result<()> {
    let shared = Shared::new();
    let mut sim = Simulator::<PAGE>::new(config, &shared)?;

    info!("Bootloader running on simulated {}", o.chip);

    if o.autoboot {
        if o.image.is_some() || o.eeprom.is_some() {
            bail!("--autoboot cannot be combined with writes, any bus traffic stops the timeout");
        }

        let mut ticks = 0;
        while !sim.boot_requested() {
            if ticks > config.timeout_ticks as usize {
                bail!("Boot timeout did not expire");
            }
            sim.tick(1);
            ticks += 1;
        }
        info!("Boot timeout expired after {} ticks", ticks);
    } else {
        identify(&mut sim)?;

        if let Some(path) = &o.image {
            let image = fs::read(path)
                .with_context(|| format!("Reading image {}", path.display()))?;
            write_flash(&mut sim, config, &image)?;
        }

        if let Some(path) = &o.eeprom {
            let data = fs::read(path)
                .with_context(|| format!("Reading EEPROM data {}", path.display()))?;
            write_eeprom(&mut sim, config, &data)?;
        }

        info!("Starting application");
        sim.write(&[CMD_SWITCH_APPLICATION, BOOTTYPE_APPLICATION])
            .ok_or_else(|| anyhow!("Bootloader did not respond"))?;
    }

    let h = sim
        .handoff()
        .map_err(|_| anyhow!("Bootloader did not start the application"))?;

    info!(
        "Application entered at 0x{:04x} (vectors: {:?}, TWI address kept: 0x{:02x})",
        h.entry, h.chip.vectors, h.chip.twi.address
    );

    Ok(())
}

fn identify<const PAGE: usize>(sim: &mut Simulator<PAGE>) -> anyhow::Result<()> {
    let version = sim.write_read(&[CMD_SWITCH_APPLICATION], VERSION_LEN);
    if version.len() != VERSION_LEN {
        bail!("Bootloader did not respond");
    }
    let end = version.iter().position(|b| *b == 0).unwrap_or(version.len());
    info!("Version: {}", String::from_utf8_lossy(&version[..end]));

    let info = sim.write_read(&[CMD_ACCESS_MEMORY, MEMTYPE_CHIPINFO], CHIPINFO_LEN);
    if info.len() != CHIPINFO_LEN {
        bail!("Bootloader did not respond");
    }
    info!(
        "Signature: {}, page size: {}, flash: {}, EEPROM: {}",
        hex::encode(&info[..3]),
        info[3],
        bytefmt::format(u16::from_be_bytes([info[4], info[5]]) as u64),
        bytefmt::format(u16::from_be_bytes([info[6], info[7]]) as u64),
    );

    Ok(())
}

fn write_flash<const PAGE: usize>(
    sim: &mut Simulator<PAGE>,
    config: &Config,
    image: &[u8],
) -> anyhow::Result<()> {
    if image.len() > config.app_end as usize {
        bail!(
            "Image of {} does not fit below the bootloader ({})",
            bytefmt::format(image.len() as u64),
            bytefmt::format(config.app_end as u64)
        );
    }

    info!("Writing {} to flash", bytefmt::format(image.len() as u64));

    let pages = image.chunks(PAGE);
    let pb = ProgressBar::new(pages.len() as u64);
    pb.set_style(ProgressStyle::default_bar().template("{bar:40} {pos}/{len} pages"));

    for (i, chunk) in pages.enumerate() {
        let addr = (i * PAGE) as u16;

        let mut page = [0xFFu8; PAGE];
        page[..chunk.len()].copy_from_slice(chunk);

        let mut bytes = vec![CMD_ACCESS_MEMORY, MEMTYPE_FLASH];
        bytes.extend_from_slice(&addr.to_be_bytes());
        bytes.extend_from_slice(&page);

        match sim.write(&bytes) {
            Some(t) if t.acked == bytes.len() && t.terminated => (),
            t => bail!("Page 0x{:04x} write failed: {:?}", addr, t),
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!("Verifying flash");
    let mut bytes = vec![CMD_ACCESS_MEMORY, MEMTYPE_FLASH];
    bytes.extend_from_slice(&0u16.to_be_bytes());
    let readback = sim.write_read(&bytes, image.len());
    verify(image, &readback)
}

fn write_eeprom<const PAGE: usize>(
    sim: &mut Simulator<PAGE>,
    config: &Config,
    data: &[u8],
) -> anyhow::Result<()> {
    if data.len() > config.eeprom_size as usize {
        bail!(
            "EEPROM data of {} exceeds {}",
            bytefmt::format(data.len() as u64),
            bytefmt::format(config.eeprom_size as u64)
        );
    }

    info!("Writing {} to EEPROM", bytefmt::format(data.len() as u64));

    let mut bytes = vec![CMD_ACCESS_MEMORY, MEMTYPE_EEPROM, 0x00, 0x00];
    bytes.extend_from_slice(data);
    match sim.write(&bytes) {
        Some(t) if t.acked == bytes.len() => (),
        t => bail!("EEPROM write failed: {:?}", t),
    }

    info!("Verifying EEPROM");
    let readback = sim.write_read(&[CMD_ACCESS_MEMORY, MEMTYPE_EEPROM, 0x00, 0x00], data.len());
    verify(data, &readback)
}

fn verify(expected: &[u8], actual: &[u8]) -> anyhow::Result<()> {
    if let Some(i) = expected.iter().zip(actual).position(|(a, b)| a != b) {
        let end = (i + 16).min(expected.len()).min(actual.len());
        bail!(
            "Mismatch at 0x{:04x}: expected {} got {}",
            i,
            hex::encode(&expected[i..end]),
            hex::encode(&actual[i..end])
        );
    }
    if actual.len() != expected.len() {
        bail!("Read {} of {} bytes", actual.len(), expected.len());
    }
    Ok(())
}
