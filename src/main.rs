use std::process::ExitCode;
use std::sync::Arc;

use hearth::{logging, net, privs, CommandHandler, Router, ServerConfig, SiteFile, Supervisor};

fn main() -> ExitCode {
    match serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            eprintln!("hearth: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn serve() -> hearth::Result<()> {
    let mut config = ServerConfig::new()?;
    if let Some(path) = std::env::args_os().nth(1) {
        config.sitefile = path.into();
    }
    logging::init(&config)?;

    let site = Arc::new(SiteFile::load(&config.sitefile)?);
    log::info!(
        "loaded {} rule(s) and {} port(s) from {}",
        site.rules.len(),
        site.ports.len(),
        config.sitefile.display()
    );

    let contexts = net::contexts(&site)?;
    let mut router = Router::new(site.clone());
    if let Some(command) = &site.handler {
        log::info!("linked rules run {}", command.program.display());
        router = router.with_handler(Arc::new(CommandHandler::new(command.clone())));
    }

    let listeners = net::bind_all(&site, config.host, config.backlog)?;
    let supervisor = Supervisor::new(&config, Arc::new(router), contexts, listeners)?;
    supervisor.write_pidfile()?;
    if let Err(err) = privs::apply(config.user.as_deref()) {
        supervisor.remove_pidfile();
        return Err(err);
    }

    supervisor.run()
}
