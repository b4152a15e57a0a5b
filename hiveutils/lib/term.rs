//! Terminal detection for CLI output.

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether both stdin and stdout are TTYs.
pub fn is_interactive_terminal() -> bool {
    let stdin_is_tty = unsafe { libc::isatty(libc::STDIN_FILENO) == 1 };
    let stdout_is_tty = unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 };
    stdin_is_tty && stdout_is_tty
}

/// Whether output may carry ANSI colour codes.
///
/// `NO_COLOR` and a `dumb` terminal both turn colours off.
pub fn is_ansi_interactive_terminal() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }

    match std::env::var("TERM") {
        Ok(term) if term == "dumb" => false,
        Ok(_) => is_interactive_terminal(),
        Err(_) => {
            tracing::debug!("TERM is unset, disabling colours");
            false
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
