//! Startup, wiring and graceful shutdown.
//!
//! Components start leaf-first: the shared store, then the things client,
//! then the inbound bridge, then the listeners; a signal or a fatal error
//! from any of them tears everything down within the shutdown grace window.

use std::sync::Arc;

use color_eyre::eyre::{eyre, Context};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::args::Args;
use crate::bridge::Bridge;
use crate::broker::fanout::Fanout;
use crate::broker::{MqttBroker, Shared};
use crate::bus::NatsBus;
use crate::events::RedisEventStream;
use crate::hooks::Hooks;
use crate::store::{Emitter, RedisStore};
use crate::things::GrpcThingsClient;

pub fn main(args: Args) -> crate::Result<()> {
    main_async(args)
}

// `#[tokio::main]` doesn't have to be attached to the actual `main()`.
#[tokio::main]
async fn main_async(args: Args) -> crate::Result<()> {
    let token = CancellationToken::new();

    // Shared broker state first; everything else hangs off it.
    let store = RedisStore::connect(args.broker_store()).await?;
    let fanout = Fanout::default();
    let persistence = Arc::new(store.persistence());
    let emitter: Arc<dyn Emitter> = Arc::new(store.emitter());

    let emitter_loop: JoinHandle<crate::Result<()>> = tokio::spawn({
        let store = store.clone();
        let fanout = fanout.clone();
        let token = token.clone();
        async move { store.run_emitter_loop(fanout, token).await }
    });

    let events = RedisEventStream::connect(args.event_store(), args.es_stream.clone()).await?;

    let things = GrpcThingsClient::connect(&args.things_transport(), args.auth_deadline())?;

    let bus = NatsBus::connect(&args.nats_url).await?;

    let hooks = Hooks::new(
        Arc::new(things),
        Arc::new(bus.clone()),
        Arc::new(events),
        args.instance_id.clone(),
    );

    let bridge = Bridge::new(emitter.clone(), args.concurrency);
    let mut bridge_loop: JoinHandle<crate::Result<()>> = tokio::spawn({
        let bridge = bridge.clone();
        let bus = bus.clone();
        let token = token.clone();
        let grace = args.shutdown_grace();
        async move { bridge.run(&bus, token, grace).await }
    });

    // Listeners last, so a device can never reach a half-wired adapter.
    let mut broker = MqttBroker::bind(
        args.mqtt_addr(),
        args.ws_addr(),
        Shared {
            hooks,
            persistence,
            fanout,
            instance: args.instance_id.clone(),
        },
        token.clone(),
    )
    .await?;

    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("error installing SIGTERM handler")?;

    tokio::select! {
        res = broker.run() => {
            res?;
        }
        res = tokio::signal::ctrl_c() => {
            res.wrap_err("error from ctrl_c() handler")?;
            tracing::info!("interrupt received");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received");
        }
        res = &mut bridge_loop => {
            crate::flatten_task_result(res)?;
            return Err(eyre!("bridge task exited unexpectedly"));
        }
        res = emitter_loop => {
            crate::flatten_task_result(res)?;
            return Err(eyre!("emitter task exited unexpectedly"));
        }
    }

    tracing::info!(
        "shutting down; waiting for {} connections to close",
        broker.connections()
    );

    token.cancel();

    let drained = tokio::time::timeout(args.shutdown_grace(), async {
        broker.shutdown().await?;
        crate::flatten_task_result(bridge_loop.await)
    })
    .await;

    match drained {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!("shutdown deadline exceeded; forcing close");
            Ok(())
        }
    }
}
