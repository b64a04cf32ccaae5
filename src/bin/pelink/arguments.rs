use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use pelink::linker::LinkerTargetArch;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct CliArgs {
    /// Set the output file name
    #[arg(
        short,
        long,
        default_value = "a.img",
        value_name = "file",
        value_hint = clap::ValueHint::FilePath
    )]
    pub output: PathBuf,

    /// Files to link
    #[arg(
        value_name = "files",
        value_hint = clap::ValueHint::FilePath
    )]
    pub files: Vec<PathBuf>,

    /// Add the specified library to search for symbols
    #[arg(id = "library", short, long, value_name = "libname")]
    pub libraries: Vec<String>,

    /// Add the directory to the library search path
    #[arg(
        id = "library-path",
        short = 'L',
        long,
        value_name = "directory",
        value_hint = clap::ValueHint::DirPath
    )]
    pub library_paths: Vec<PathBuf>,

    /// Set the target machine
    #[arg(short, long, value_name = "machine")]
    pub machine: Option<TargetMachine>,

    /// Name of the entrypoint
    #[arg(short, long, value_name = "entry")]
    pub entry: Option<String>,

    /// Keep the named symbol's section regardless of references
    #[arg(long, value_name = "symbol")]
    pub include: Vec<String>,

    /// Fall back to an alternate symbol name (from=to)
    #[arg(long = "alternatename", value_name = "from=to")]
    pub alternate_names: Vec<String>,

    /// Merge an output section into another (from=to)
    #[arg(long = "merge", value_name = "from=to")]
    pub merges: Vec<String>,

    /// Keep unreferenced COMDAT sections
    #[arg(long = "no-gc-sections")]
    pub no_gc_sections: bool,

    /// Set the image base address
    #[arg(long, value_name = "address", value_parser = parse_address)]
    pub image_base: Option<u64>,

    /// Set the section alignment
    #[arg(long, value_name = "align", value_parser = parse_align)]
    pub section_align: Option<u32>,

    /// Set the file alignment
    #[arg(long, value_name = "align", value_parser = parse_align)]
    pub file_align: Option<u32>,

    /// Print colored output
    #[arg(long, value_name = "color", default_value_t = ColorOption::Auto)]
    pub color: ColorOption,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Print timing information
    #[arg(long)]
    pub print_timing: bool,
}

fn parse_address(value: &str) -> Result<u64, String> {
    let (digits, radix) = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (value, 10),
    };

    u64::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

fn parse_align(value: &str) -> Result<u32, String> {
    let parsed = parse_address(value).map_err(|e| e.to_string())?;
    let align = u32::try_from(parsed).map_err(|_| "alignment out of range".to_string())?;

    if !align.is_power_of_two() {
        return Err("alignment must be a power of two".to_string());
    }

    Ok(align)
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetMachine {
    #[value(name = "amd64", alias = "x64")]
    Amd64,

    #[value(name = "i386", alias = "x86")]
    I386,
}

impl From<TargetMachine> for LinkerTargetArch {
    fn from(value: TargetMachine) -> Self {
        match value {
            TargetMachine::Amd64 => LinkerTargetArch::Amd64,
            TargetMachine::I386 => LinkerTargetArch::I386,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorOption {
    #[value(name = "never")]
    Never,

    #[value(name = "auto")]
    Auto,

    #[value(name = "always")]
    Always,

    #[value(name = "ansi")]
    AlwaysAnsi,
}

impl std::fmt::Display for ColorOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(v) = self.to_possible_value() {
            write!(f, "{}", v.get_name())?;
        }

        Ok(())
    }
}

impl From<ColorOption> for termcolor::ColorChoice {
    fn from(val: ColorOption) -> Self {
        match val {
            ColorOption::Never => termcolor::ColorChoice::Never,
            ColorOption::Auto => termcolor::ColorChoice::Auto,
            ColorOption::Always => termcolor::ColorChoice::Always,
            ColorOption::AlwaysAnsi => termcolor::ColorChoice::AlwaysAnsi,
        }
    }
}

/// Parses the command line arguments into the [`CliArgs`].
pub fn parse_arguments() -> anyhow::Result<CliArgs> {
    let args = CliArgs::parse_from(argfile::expand_args_from(
        std::env::args_os(),
        argfile::parse_fromfile,
        argfile::PREFIX,
    )?);

    crate::logging::setup_logger(&args)?;

    Ok(args)
}
