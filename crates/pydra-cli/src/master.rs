//! Wires the Master together: persistence, scheduler core, Node listener,
//! and Controller interface, started the way `pydra-kernel`'s
//! `tests/integration.rs` wires the same pieces for tests, but against a
//! real on-disk database and a bound Node-listen socket.

use pydra_auth::SessionManager;
use pydra_kernel::{IpcBus, Scheduler, StatusAggregator, WorkerRegistry};
use pydra_rpc::KeyPair;
use pydra_store::{Database, NodeStore, TaskStore};
use pydra_web::{AppState, WebConfig, WebServer};

use crate::config::Config;

/// RSA modulus size for a freshly generated Master keypair.
const MASTER_KEY_BITS: usize = 4096;

/// Bring up the Master and run until the process is terminated.
pub async fn run(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.runtime_files_dir)?;

    let db = Database::open_and_migrate(config.db_path()).await?;
    let task_store = TaskStore::new(db.clone());
    let node_store = NodeStore::new(db.clone());
    let registry = WorkerRegistry::new();
    let ipc = IpcBus::new(256);

    let scheduler = Scheduler::new(task_store.clone(), registry.clone(), ipc);
    scheduler.rehydrate().await?;
    tracing::info!("scheduler rehydrated from task store");

    let master_key = load_master_key(&config)?;
    let sessions = SessionManager::new(master_key.public());
    let _sweeper = sessions.spawn_sweeper();

    let node_listener = {
        let addr = config.node_listen_addr();
        let master_key = master_key.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(reason) = pydra_rpc::serve(&addr, master_key, scheduler).await {
                tracing::error!(%reason, "node listener exited");
            }
        })
    };

    let (controller_host, controller_port) = config.controller_addr();
    let web_state = AppState {
        scheduler,
        task_store,
        node_store,
        registry,
        status: StatusAggregator::new(),
        sessions,
    };
    let web_server = WebServer::new(
        WebConfig {
            bind_addr: controller_host,
            port: controller_port,
        },
        web_state,
    );

    tracing::info!(
        node_addr = %config.node_listen_addr(),
        controller_addr = %web_server.addr(),
        "pydra master starting"
    );

    tokio::select! {
        result = web_server.start() => result.map_err(|e| anyhow::anyhow!(e))?,
        result = node_listener => result?,
    }

    Ok(())
}

fn load_master_key(config: &Config) -> anyhow::Result<KeyPair> {
    let path = config.master_key_path();
    KeyPair::load_or_create(&path, MASTER_KEY_BITS).map_err(|e| anyhow::anyhow!(e)).inspect(|_| {
        tracing::info!(path = %path.display(), "master key ready");
    })
}
