/// Ends the process.
pub trait ProcessExit: Send + Sync {
    /// Terminates with `code`; never returns.
    fn exit(&self, code: i32) -> !;
}

/// Calls [`std::process::exit`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExit;

impl ProcessExit for SystemExit {
    fn exit(&self, code: i32) -> ! {
        std::process::exit(code)
    }
}
