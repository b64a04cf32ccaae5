use std::io::{IsTerminal, Write};

use log::Level;
use termcolor::{BufferWriter, Color, ColorChoice, ColorSpec, WriteColor};

use crate::arguments::{CliArgs, ColorOption};

struct CliLogger {
    stdout: BufferWriter,
    stderr: BufferWriter,
}

impl log::Log for CliLogger {
    #[inline]
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if record.args().as_str().is_some_and(|args| args.is_empty()) {
            return;
        }

        let writer = if record.level() <= Level::Warn {
            &self.stderr
        } else {
            &self.stdout
        };

        let mut buffer = writer.buffer();
        write!(buffer, "{}: ", env!("CARGO_BIN_NAME")).unwrap();

        let (color, label) = match record.level() {
            Level::Error => (Color::Red, "error:"),
            Level::Warn => (Color::Yellow, "warn:"),
            Level::Info => (Color::Green, "info:"),
            Level::Debug => (Color::White, "debug:"),
            Level::Trace => (Color::Blue, "trace:"),
        };

        let _ = buffer.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true));
        write!(buffer, "{label}").unwrap();

        buffer.reset().unwrap();
        writeln!(buffer, " {}", record.args()).unwrap();

        writer.print(&buffer).unwrap();
    }

    fn flush(&self) {}
}

/// Returns whether the environment allows `auto` color output.
fn env_allows_color() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }

    std::env::var("TERM")
        .ok()
        .is_none_or(|term| !term.eq_ignore_ascii_case("dumb"))
}

fn stream_choice(requested: ColorChoice, terminal: bool) -> ColorChoice {
    match requested {
        ColorChoice::Auto if terminal => ColorChoice::Auto,
        ColorChoice::Auto => ColorChoice::Never,
        other => other,
    }
}

/// Sets up logging for the cli
pub fn setup_logger(args: &CliArgs) -> anyhow::Result<()> {
    let requested = match args.color {
        ColorOption::Auto if !env_allows_color() => ColorChoice::Never,
        option => option.into(),
    };

    log::set_boxed_logger(Box::from(CliLogger {
        stdout: BufferWriter::stdout(stream_choice(requested, std::io::stdout().is_terminal())),
        stderr: BufferWriter::stderr(stream_choice(requested, std::io::stderr().is_terminal())),
    }))
    .map(|()| log::set_max_level(args.verbose.log_level_filter()))?;

    Ok(())
}
