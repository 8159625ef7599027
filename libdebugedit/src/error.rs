pub use anyhow::Context;
pub use anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints a warning. By using our own function for this, it'll be easier to
/// find places that issue warnings if we ever want a flag to suppress them.
/// Warnings never abort the edit.
pub(crate) fn warning(message: &str) {
    eprintln!("WARNING: debugedit: {message}");
}

/// Reports the supplied error to stderr then exits with a non-zero status.
pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("debugedit: error: {error:#}");
    std::process::exit(1);
}
