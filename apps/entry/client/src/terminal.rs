use std::io;

use crossterm::terminal;
use entry_core::WindowSize;
use tokio::sync::mpsc;
use tracing::debug;

const FALLBACK_SIZE: WindowSize = WindowSize {
    width: 80,
    height: 24,
};

/// Puts the local terminal into raw mode until dropped.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = terminal::disable_raw_mode() {
            debug!(error = %err, "failed to restore terminal mode");
        }
    }
}

/// Current size of the local terminal, 80x24 when it cannot be read.
pub fn local_window_size() -> WindowSize {
    match terminal::size() {
        Ok((width, height)) => WindowSize { width, height },
        Err(_) => FALLBACK_SIZE,
    }
}

/// Emits the local terminal size every time the window changes.
#[cfg(unix)]
pub fn watch_resizes() -> io::Result<mpsc::Receiver<WindowSize>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = signal(SignalKind::window_change())?;
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            if tx.send(local_window_size()).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[cfg(not(unix))]
pub fn watch_resizes() -> io::Result<mpsc::Receiver<WindowSize>> {
    let (_tx, rx) = mpsc::channel(1);
    Ok(rx)
}
