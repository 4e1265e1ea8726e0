use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, WrapErr};
use periph_dma::{
    control,
    dma::{MapRequest, UserAddr, DMA_PAGE_SIZE},
    sim::{HwEvent, SimPlatform},
    AddrMode, DmaDevice, DriverConfig, TransferMode,
};
use tracing::Level;

/// Where the internal buffer is aliased in the simulated address space.
const MAP_BASE: UserAddr = UserAddr(0x7000_0000);
/// Where ordinary user buffers are allocated.
const BUF_BASE: UserAddr = UserAddr(0x2000_0000);

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Contiguous,
    ScatterGather,
}

impl From<ModeArg> for TransferMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Contiguous => TransferMode::Contiguous,
            ModeArg::ScatterGather => TransferMode::ScatterGather,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum AddrArg {
    Incrementing,
    Fifo,
}

impl From<AddrArg> for AddrMode {
    fn from(m: AddrArg) -> Self {
        match m {
            AddrArg::Incrementing => AddrMode::Incrementing,
            AddrArg::Fifo => AddrMode::Fifo,
        }
    }
}

#[derive(clap::Args, Clone, Debug)]
struct TransferArgs {
    /// Transfer mode. Defaults to the configured mode.
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Peripheral addressing. Defaults to the configured addressing.
    #[arg(long, value_enum)]
    addr_mode: Option<AddrArg>,
    /// Offset into the peripheral register window.
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long, default_value_t = 4096)]
    len: usize,
    /// Offset of the user buffer within its first page.
    #[arg(long, default_value_t = 0)]
    align: usize,
}

#[derive(Debug, Clone, clap::Subcommand)]
enum Subcommand {
    /// Read from the peripheral and dump the bytes.
    Read {
        #[clap(flatten)]
        args: TransferArgs,
        /// Write this byte through the same path first, so the read has something to return.
        #[arg(long)]
        preload: Option<u8>,
    },
    /// Write a repeated byte to the peripheral.
    Write {
        #[clap(flatten)]
        args: TransferArgs,
        #[arg(long, default_value_t = 0xa5)]
        pattern: u8,
    },
    /// Round-trip data through every mode and check that nothing leaks.
    Selftest,
}

#[derive(clap::Parser, Clone, Debug)]
struct Cli {
    /// Driver configuration in TOML.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log more; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[clap(subcommand)]
    cmd: Subcommand,
}

struct Session {
    plat: SimPlatform,
    dev: DmaDevice,
}

impl Session {
    fn new(config: &DriverConfig) -> miette::Result<Self> {
        let plat = SimPlatform::new(config);
        let dev = DmaDevice::attach(&plat.resources(), plat.memory.clone(), config)
            .into_diagnostic()
            .wrap_err("failed to attach to the simulated device")?;
        Ok(Self { plat, dev })
    }

    /// Select modes through the control interface, as a process would.
    fn select(&self, mode: Option<ModeArg>, addr_mode: Option<AddrArg>) -> miette::Result<()> {
        if let Some(mode) = mode {
            let mode: TransferMode = mode.into();
            self.dev
                .control(control::SET_OPMODE, mode as u64)
                .into_diagnostic()?;
        }
        if let Some(addr_mode) = addr_mode {
            let addr_mode: AddrMode = addr_mode.into();
            self.dev
                .control(control::SET_INCRADDR, addr_mode as u64)
                .into_diagnostic()?;
        }
        Ok(())
    }

    /// A user buffer of `len` bytes that the current mode can transfer from, `slot` buffers past
    /// the first.
    fn buffer(&self, slot: usize, align: usize, len: usize) -> miette::Result<UserAddr> {
        let stride = (align + len).div_ceil(DMA_PAGE_SIZE) * DMA_PAGE_SIZE;
        match self.dev.mode() {
            TransferMode::Contiguous => {
                if self.dev.region().mapping().is_none() {
                    let grant = self
                        .dev
                        .establish_mapping(MapRequest {
                            start: MAP_BASE,
                            len: self.dev.region().size(),
                            offset: 0,
                        })
                        .into_diagnostic()?;
                    self.plat.memory.map_device(MAP_BASE, grant);
                }
                let addr = MAP_BASE.0 + slot * stride + align;
                if addr + len > MAP_BASE.0 + self.dev.region().size() {
                    miette::bail!("{} bytes do not fit in the internal buffer", len);
                }
                Ok(UserAddr(addr))
            }
            _ => {
                let addr = UserAddr(BUF_BASE.0 + slot * stride + align);
                self.plat.memory.alloc(addr, len);
                Ok(addr)
            }
        }
    }

    fn write(&self, args: &TransferArgs, data: &[u8]) -> miette::Result<()> {
        let src = self.buffer(0, args.align, data.len())?;
        self.plat.memory.write(src, data).into_diagnostic()?;
        let n = self
            .dev
            .write(args.offset, src, data.len())
            .into_diagnostic()
            .wrap_err("write failed")?;
        tracing::info!("wrote {} bytes", n);
        Ok(())
    }

    fn read(&self, args: &TransferArgs) -> miette::Result<Vec<u8>> {
        let dst = self.buffer(1, args.align, args.len)?;
        let n = self
            .dev
            .read(args.offset, dst, args.len)
            .into_diagnostic()
            .wrap_err("read failed")?;
        tracing::info!("read {} bytes", n);
        let mut buf = vec![0; n];
        self.plat.memory.read(dst, &mut buf).into_diagnostic()?;
        Ok(buf)
    }

    /// Check that every pin and bus mapping taken for a transfer was given back.
    fn check_released(&self) -> miette::Result<()> {
        let pins = self.plat.memory.total_pins();
        // The register window and the internal buffer stay mapped while attached.
        let mappings = self.plat.bus.mapping_count();
        let bad = self.plat.events.count(|e| {
            matches!(e, HwEvent::BadUnpin { .. } | HwEvent::BadUnmap { .. })
        });
        if pins != 0 || mappings != 2 || bad != 0 {
            miette::bail!(
                "resources leaked: {} pins, {} bus mappings, {} bad releases",
                pins,
                mappings,
                bad
            );
        }
        Ok(())
    }

    fn dump_events(&self) {
        for e in self.plat.events.snapshot() {
            tracing::debug!("{:?}", e);
        }
    }
}

fn hexdump(data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let text: String = line
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{:08x}: {:<47}  {}", i * 16, hex.join(" "), text);
    }
}

fn selftest(config: &DriverConfig) -> miette::Result<()> {
    let len = 3 * DMA_PAGE_SIZE + 123;
    for mode in [ModeArg::Contiguous, ModeArg::ScatterGather] {
        for addr_mode in [AddrArg::Incrementing, AddrArg::Fifo] {
            let session = Session::new(config)?;
            session.select(Some(mode), Some(addr_mode))?;
            let args = TransferArgs {
                mode: None,
                addr_mode: None,
                offset: 0,
                len,
                align: 1000,
            };
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            session.write(&args, &data)?;
            let back = session.read(&args)?;
            session.dump_events();
            if back != data {
                miette::bail!("{:?}/{:?}: data mismatch", mode, addr_mode);
            }
            session.check_released()?;

            session.dev.detach();
            if session.plat.bus.mapping_count() != 0 {
                miette::bail!("{:?}/{:?}: mappings left after detach", mode, addr_mode);
            }
            tracing::info!("{:?}/{:?}: ok", mode, addr_mode);
        }
    }
    println!("selftest passed");
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> miette::Result<DriverConfig> {
    let Some(path) = path else {
        return Ok(DriverConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    DriverConfig::from_toml(&text).into_diagnostic()
}

fn main() -> miette::Result<()> {
    let cli = Cli::try_parse().into_diagnostic()?;

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .without_time()
            .with_max_level(level)
            .finish(),
    )
    .into_diagnostic()?;

    let config = load_config(cli.config.as_ref())?;

    match &cli.cmd {
        Subcommand::Read { args, preload } => {
            let session = Session::new(&config)?;
            session.select(args.mode, args.addr_mode)?;
            if let Some(byte) = preload {
                session.write(args, &vec![*byte; args.len])?;
            }
            let data = session.read(args)?;
            session.dump_events();
            hexdump(&data);
            session.check_released()?;
        }
        Subcommand::Write { args, pattern } => {
            let session = Session::new(&config)?;
            session.select(args.mode, args.addr_mode)?;
            session.write(args, &vec![*pattern; args.len])?;
            session.dump_events();
            session.check_released()?;
        }
        Subcommand::Selftest => selftest(&config)?,
    }

    Ok(())
}
