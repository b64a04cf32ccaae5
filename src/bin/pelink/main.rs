use anyhow::{Result, anyhow, bail};
use arguments::CliArgs;
use log::{error, info};

use pelink::{
    libsearch::LibrarySearcher,
    linker::{LinkerBuilder, error::LinkError},
    pathed_item::PathedItem,
};

mod arguments;
mod logging;

#[derive(Debug)]
struct EmptyError;

impl std::fmt::Display for EmptyError {
    fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Ok(())
    }
}

impl std::error::Error for EmptyError {}

/// cli entrypoint
fn main() {
    if let Err(e) = try_main() {
        if let Some(link_error) = e.downcast_ref::<LinkError>() {
            match link_error {
                LinkError::Setup(setup_errors) => {
                    for setup_error in setup_errors.errors() {
                        error!("{setup_error}");
                    }
                }
                LinkError::Diagnostics(diagnostics) => {
                    for diagnostic in diagnostics.errors() {
                        error!("{diagnostic}");
                    }
                }
                _ => {
                    error!("{e}");
                }
            }
        } else if !e.is::<EmptyError>() {
            error!("{e}");
        }

        std::process::exit(1);
    }
}

/// Main program entrypoint
fn try_main() -> Result<()> {
    let mut args = arguments::parse_arguments()?;

    let it = std::time::Instant::now();

    let link_res = run_linker(&mut args);

    let elapsed = std::time::Instant::now() - it;
    if args.print_timing {
        info!("link time: {}ms", elapsed.as_micros() as f64 / 1000f64);
    }

    link_res
}

/// Splits a `from=to` command line pair.
fn split_pair(value: &str, option: &str) -> Result<(String, String)> {
    value
        .split_once('=')
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .ok_or_else(|| anyhow!("invalid {option} '{value}': expected from=to"))
}

fn run_linker(args: &mut CliArgs) -> anyhow::Result<()> {
    let mut library_searcher = LibrarySearcher::new();
    library_searcher.extend_search_paths(std::mem::take(&mut args.library_paths));

    if cfg!(windows) {
        if let Some(libenv) = std::env::var_os("LIB") {
            library_searcher.extend_search_paths(std::env::split_paths(&libenv));
        }
    }

    let linker = LinkerBuilder::new().library_searcher(library_searcher);

    let linker = if let Some(machine) = args.machine.take() {
        linker.architecture(machine.into())
    } else {
        linker
    };

    let linker = if let Some(entry) = args.entry.take() {
        linker.entrypoint(entry)
    } else {
        linker
    };

    let mut linker = linker.dead_strip(!args.no_gc_sections);

    for include in std::mem::take(&mut args.include) {
        linker = linker.include_symbol(include);
    }

    for alternate in std::mem::take(&mut args.alternate_names) {
        let (from, to) = split_pair(&alternate, "alternatename")?;
        linker = linker.alternate_name(from, to);
    }

    for merge in std::mem::take(&mut args.merges) {
        let (from, to) = split_pair(&merge, "merge")?;
        linker = linker.merge_section(from, to);
    }

    let linker = if let Some(base) = args.image_base.take() {
        linker.image_base(base)
    } else {
        linker
    };

    let linker = match (args.section_align.take(), args.file_align.take()) {
        (None, None) => linker,
        (section_align, file_align) => linker.alignment(
            section_align.unwrap_or(0x1000),
            file_align.unwrap_or(0x200),
        ),
    };

    let mut error_flag = false;
    let inputs = std::mem::take(&mut args.files)
        .into_iter()
        .filter_map(|file| match std::fs::read(&file) {
            Ok(buffer) => Some(PathedItem::new(file, buffer)),
            Err(e) => {
                error!("could not open {}: {e}", file.display());
                error_flag = true;
                None
            }
        })
        .collect::<Vec<_>>();

    let linker = linker.add_inputs(inputs);

    if error_flag {
        bail!(EmptyError);
    }

    let linker = linker.add_libraries(std::mem::take(&mut args.libraries));

    let mut linker = linker.build();

    match linker.link() {
        Ok(built) => {
            std::fs::write(&args.output, built.image)
                .map_err(|e| anyhow!("could not write output file: {e}"))?;
        }
        Err(e) => {
            return Err(anyhow!(e));
        }
    }

    Ok(())
}
