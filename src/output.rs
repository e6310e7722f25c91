//! Shared output sink
//!
//! One sink per process, guarded by a mutex so lines from concurrently
//! failing test threads never interleave. Forked test processes inherit the
//! same underlying file descriptor, so their failure reports land in the same
//! stream as the orchestrator's.

use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const INDENT: &str = "    ";

/// ANSI escape sequences
pub mod style {
    pub const BOLD: &str = "\x1b[1m";
    pub const RESET: &str = "\x1b[0m";
    pub const SUCCESS: &str = "\x1b[32m";
    pub const FAIL: &str = "\x1b[31m";
    pub const MAYBE: &str = "\x1b[35m";
    pub const DESC: &str = "\x1b[33m";
}

pub struct Output {
    sink: Mutex<Box<dyn Write + Send>>,
    color: bool,
}

impl Output {
    pub fn new(sink: Box<dyn Write + Send>, color: bool) -> Self {
        Self {
            sink: Mutex::new(sink),
            color,
        }
    }

    pub fn stderr(color: bool) -> Self {
        Self::new(Box::new(io::stderr()), color)
    }

    /// Default color choice: on for a terminal unless `NO_COLOR` is set
    pub fn default_color() -> bool {
        io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
    }

    pub fn color(&self) -> bool {
        self.color
    }

    /// Take the print mutex. Poisoning is ignored: output must keep flowing
    /// even after a test thread panicked mid-line.
    pub fn lock(&self) -> OutputGuard<'_> {
        OutputGuard {
            sink: self.sink.lock().unwrap_or_else(|e| e.into_inner()),
            color: self.color,
        }
    }

    /// Write and flush under the lock. Write errors are dropped, there is
    /// nowhere left to report them.
    pub fn print(&self, args: fmt::Arguments<'_>) {
        let mut out = self.lock();
        let _ = out.write_fmt(args);
        let _ = out.flush();
    }

    pub fn flush(&self) {
        let _ = self.lock().flush();
    }
}

pub struct OutputGuard<'a> {
    sink: MutexGuard<'a, Box<dyn Write + Send>>,
    color: bool,
}

impl OutputGuard<'_> {
    pub fn paint<T: fmt::Display>(&self, codes: &'static str, value: T) -> Painted<T> {
        Painted {
            value,
            codes,
            enabled: self.color,
        }
    }
}

impl Write for OutputGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// A value wrapped in escape codes when color is enabled
pub struct Painted<T> {
    value: T,
    codes: &'static str,
    enabled: bool,
}

impl<T: fmt::Display> fmt::Display for Painted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.enabled {
            write!(f, "{}{}{}", self.codes, self.value, style::RESET)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

/// Render an elapsed time the way result lines show it: `(12.34ms)`
pub fn format_elapsed(elapsed: Duration) -> String {
    let ms = elapsed.as_secs_f64() * 1000.0;
    if ms < 1.0 {
        format!("({:.2}µs)", ms * 1000.0)
    } else if ms < 1000.0 {
        format!("({:.2}ms)", ms)
    } else {
        format!("({:.2}s)", ms / 1000.0)
    }
}

/// In-memory sink, cloneable so a caller can read back what was written
#[derive(Clone, Default)]
pub struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_elapsed_units() {
        assert_eq!(format_elapsed(Duration::from_micros(250)), "(250.00µs)");
        assert_eq!(format_elapsed(Duration::from_micros(12_340)), "(12.34ms)");
        assert_eq!(format_elapsed(Duration::from_millis(2500)), "(2.50s)");
    }

    #[test]
    fn test_print_goes_to_sink() {
        let capture = Capture::new();
        let output = Output::new(Box::new(capture.clone()), false);
        output.print(format_args!("hello {}\n", 42));
        assert_eq!(capture.contents(), "hello 42\n");
    }

    #[test]
    fn test_paint_respects_color() {
        let plain = Output::new(Box::new(Capture::new()), false);
        assert_eq!(plain.lock().paint(style::FAIL, "x").to_string(), "x");

        let colored = Output::new(Box::new(Capture::new()), true);
        assert_eq!(
            colored.lock().paint(style::FAIL, "x").to_string(),
            "\x1b[31mx\x1b[0m"
        );
    }

    #[test]
    fn test_lock_survives_poison() {
        let capture = Capture::new();
        let output = Arc::new(Output::new(Box::new(capture.clone()), false));

        let poisoner = output.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("poison the sink");
        })
        .join();

        output.print(format_args!("still here\n"));
        assert_eq!(capture.contents(), "still here\n");
    }
}
