use anyhow::{Context, Result};

fn main() -> Result<()> {
    let cfg = warden::cli::parse()?;
    warden::logging::init(cfg.logfile.as_deref(), cfg.verbose)?;
    cfg.log_params();

    if cfg.daemonize {
        nix::unistd::daemon(false, false).context("daemon()")?;
    }

    let mut supervisor = warden::supervisor::Supervisor::new(cfg)?;
    supervisor.run()?;
    Ok(())
}
