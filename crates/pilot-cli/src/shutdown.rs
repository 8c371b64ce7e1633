use tokio::signal::unix::{SignalKind, signal};

/// Wait for the first of SIGHUP, SIGINT, SIGQUIT or SIGTERM and return its name.
pub async fn wait_for_signal() -> anyhow::Result<&'static str> {
    let mut hup = signal(SignalKind::hangup())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut term = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = hup.recv() => "SIGHUP",
        _ = int.recv() => "SIGINT",
        _ = quit.recv() => "SIGQUIT",
        _ = term.recv() => "SIGTERM",
    };
    tracing::warn!(signal = name, "caught signal");
    Ok(name)
}
