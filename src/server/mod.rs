// src/server/mod.rs

//! Daemon bootstrap: build the cluster state, wire the driver and the
//! event serializer together, join, and run until shutdown.

use crate::config::Config;
use crate::core::cluster::driver::GroupDriver;
use crate::core::cluster::events::{EventSerializer, IoGate};
use crate::core::cluster::local::LocalNet;
use crate::core::cluster::ops::ClusterOps;
use crate::core::cluster::peer::TcpPeerClient;
use crate::core::cluster::state::{ClusterCtx, ClusterInfo};
use crate::core::recovery::RecoveryHandle;
use crate::core::store::{ObjectStore, PlainStore};
use anyhow::{Result, anyhow, bail};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// The main daemon startup function, orchestrating all setup phases.
pub async fn run(config: Config, format_on_start: bool) -> Result<()> {
    config.validate()?;
    let me = config.advertised_node()?;
    let base = PathBuf::from(&config.directory);

    // 1. Durable state and the store adapter.
    let store: Arc<dyn ObjectStore> = Arc::new(PlainStore::new());
    store.init(&base)?;
    let defaults = ClusterInfo::unformatted(
        config.nr_copies,
        config.cluster_flags(),
        config.store.clone(),
    );
    let ctx = ClusterCtx::new(me, &base, defaults)?;
    let published = ctx.published.clone();
    info!(
        "Starting flockd node {} (zone {}, {} vnodes), latest epoch {}",
        me, me.zone, me.nr_vnodes, ctx.epoch
    );

    // 2. Wire the driver, peer client, and serializer together.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (ops, requests_rx) = ClusterOps::channel();
    let gate = IoGate::new();
    let recovery = RecoveryHandle::spawn();
    let peers = Arc::new(TcpPeerClient::new(
        config.cluster.probe_connect_timeout,
        config.cluster.bitmap_read_timeout,
    ));

    let driver: Arc<dyn GroupDriver> = match config.cluster.driver.as_str() {
        "local" => {
            let net = LocalNet::new();
            Arc::new(net.register(me, published, events_tx))
        }
        other => bail!("unsupported cluster driver '{other}'"),
    };

    let payload = ctx.join_request().encode()?;
    let serializer = EventSerializer::new(
        ctx,
        driver.clone(),
        peers,
        store,
        recovery,
        gate,
        events_rx,
        requests_rx,
    );
    let mut serializer_task = tokio::spawn(serializer.run());

    // 3. Propose ourselves for membership.
    driver.join(me, payload).await?;

    if format_on_start {
        ops.format(config.nr_copies, config.cluster_flags(), config.store.clone())
            .await?;
        info!("Cluster formatted with {} copies", config.nr_copies);
    }

    // 4. Run until interrupted or self-demoted.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received; leaving the cluster");
            driver.leave().await?;
            serializer_task.abort();
        }
        joined = &mut serializer_task => {
            match joined {
                Ok(Ok(())) => info!("Event serializer finished"),
                Ok(Err(e)) => {
                    // Self-demotion: leave cleanly and let the operator
                    // restart us rather than run incoherently.
                    error!("Event serializer demoted this node: {}", e);
                    let _ = driver.leave().await;
                    return Err(e.into());
                }
                Err(e) => return Err(anyhow!("event serializer panicked: {e}")),
            }
        }
    }

    Ok(())
}
