#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};

mod diagnostics;

use agent_core::{
    Register,
    backend::Backend,
    config::{
        cli::{self, Parser},
        trace,
    },
    engine::{self, Engine},
    sched::Scheduler,
    tokio::{self, runtime::Builder, signal, time},
    tracing::*,
};
use config::AgentConfig;
use dhclient::Dhclient;
use diagnostics::LinkStateJob;
use netplan::Netplan;
use network_manager::NetworkManager;
use networkd::Networkd;
use tokio_util::sync::CancellationToken;
use wicked::Wicked;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.agent_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start agent"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(cli_cfg: cli::Config) -> Result<()> {
    debug!("parsing agent config");
    let agent_cfg = Arc::new(AgentConfig::load(&cli_cfg.config_path)?);

    // backends in detection order; dhclient is the fallback and goes last
    let mut engine = Engine::new(Arc::clone(&agent_cfg));
    Wicked::new(Arc::clone(&agent_cfg)).register(&mut engine);
    NetworkManager::new(Arc::clone(&agent_cfg)).register(&mut engine);
    Netplan::new(Arc::clone(&agent_cfg)).register(&mut engine);
    Networkd::new(Arc::clone(&agent_cfg)).register(&mut engine);
    Dhclient::new(Arc::clone(&agent_cfg)).register(&mut engine);
    // keep a handle on the registry for the catastrophic-failure path
    let backends: Vec<Arc<dyn Backend>> = engine.backends().to_vec();

    let token = CancellationToken::new();

    info!(url = %cli_cfg.metadata_url, "starting metadata watcher");
    let client = Arc::new(::metadata::Client::with_base(cli_cfg.metadata_url.clone()));
    let (events, watcher_task) = ::metadata::spawn(client, token.clone());

    Scheduler::get().schedule(
        &agent_cfg,
        Arc::new(LinkStateJob::new(Arc::clone(&agent_cfg))),
        &token,
    );

    let mut engine_task = tokio::spawn(engine.run(events, token.clone()));

    tokio::select! {
        res = shutdown_signal(token.clone()) => {
            if let Err(err) = res {
                error!(?err);
            }
        }
        res = &mut engine_task => {
            // the engine never stops on its own while the watcher is alive
            error!("reconciliation engine exited unexpectedly");
            token.cancel();
            if flatten(res).is_err() {
                engine::fallback_to_default(&backends).await;
            }
        }
    }

    info!("notifying tasks of shutdown...");
    Scheduler::get().shutdown().await;
    if let Err(_) = time::timeout(Duration::from_secs(3), watcher_task).await {
        error!("watcher did not finish within 3 seconds-- exiting anyway");
    }
    if !engine_task.is_finished() {
        if let Err(_) = time::timeout(Duration::from_secs(3), engine_task).await {
            error!("engine did not finish within 3 seconds-- exiting anyway");
        }
    } else {
        debug!("all tasks finished cleanly");
    }

    Ok(())
}

fn flatten<T>(res: Result<Result<T, agent_core::error::Error>, tokio::task::JoinError>) -> Result<T> {
    match res {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(err)) => Err(anyhow!(err)),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    info!("caught shutdown signal handler");
    token.cancel();
    ret
}
