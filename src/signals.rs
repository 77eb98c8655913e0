use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::mpsc::Sender;

/// What should we do when the user stops this program?
///
/// The first SIGINT/SIGTERM asks the watcher loop to stop through
/// `shutdown`. A second one exits right away.
pub fn handle_shutdown(shutdown: Sender<()>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        let mut requested = false;
        for signal in signals.forever() {
            if requested {
                log::warn!("Received signal {signal} again, exiting now");
                std::process::exit(1);
            }
            requested = true;
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            // Full or closed both mean the loop is already on its way out.
            let _ = shutdown.try_send(());
        }
    });

    Ok(())
}
