//! Process-wide cancellation wiring.

use freight_store::CancelToken;
use std::sync::OnceLock;

static SHUTDOWN_TOKEN: OnceLock<CancelToken> = OnceLock::new();

/// The process-wide cancellation token set by the signal handler.
pub fn shutdown_token() -> CancelToken {
    SHUTDOWN_TOKEN.get_or_init(CancelToken::new).clone()
}

/// Install a ctrl-c handler: first signal requests cooperative shutdown at
/// the next suspension point, second exits immediately.
pub fn install_signal_handler() {
    let token = shutdown_token();
    let _ = ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(1);
        }
        token.cancel();
        eprintln!("\ninterrupt received, stopping at the next safe point...");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_token_is_shared() {
        let a = shutdown_token();
        let b = shutdown_token();
        assert!(!a.is_cancelled());
        // Both handles observe the same flag. Leave it untouched: other
        // tests share the process-wide token.
        drop(a);
        drop(b);
    }
}
