use std::io;

#[cfg(unix)]
const SIGABRT: std::os::raw::c_int = 6;

/// Resolve with the name of the first shutdown signal received.
///
/// On unix that is any of SIGINT, SIGTERM, SIGHUP, SIGUSR2 or SIGABRT;
/// elsewhere only Ctrl+C. Fails if a handler cannot be installed.
pub(crate) async fn shutdown_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut user2 = signal(SignalKind::user_defined2())?;
        let mut abort = signal(SignalKind::from_raw(SIGABRT))?;

        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
            _ = user2.recv() => "SIGUSR2",
            _ = abort.recv() => "SIGABRT",
        };
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}
