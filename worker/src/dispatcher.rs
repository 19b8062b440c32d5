//! Pulls cluster-operation messages off the durable queue and drives
//! the engine with exactly-once semantics per operation.
//!
//! The broker is at-least-once; the exactly-once effect comes from the
//! Operation state machine plus idempotent `apply`. A message is acked
//! only once the operation is observably finished (`State = Done`) or
//! observably claimed by an earlier delivery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_nats::jetstream::{self, consumer::PullConsumer};
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use keel_cloud::Context;
use keel_common::streams::{OPS_STREAM, WORKER_QUEUE, subjects};
use keel_store::Store;
use keel_types::OperationState;

use crate::args::ServeArgs;
use crate::notifier::NatsNotifier;

/// Redelivery kicks in quickly when a worker dies mid-operation.
const ACK_WAIT: Duration = Duration::from_secs(1);

#[derive(Deserialize, Debug)]
struct ClusterOperation {
    #[serde(default)]
    operation_id: String,
}

/// What the dispatcher decided about one delivery.
#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    /// Fresh ticket, moved `Pending → Running`; the work is ours.
    Claimed(keel_types::Operation),
    /// Someone already ran (or is running) this one; ack and move on.
    Replay,
}

/// Loads the operation and claims it if still pending.
pub async fn claim_operation(store: &Store, code: &str) -> Result<Claim> {
    let mut operation = store
        .operations()
        .get(code)
        .await
        .with_context(|| format!("loading operation `{code}`"))?;
    if operation.state != OperationState::Pending {
        tracing::info!(operation = code, state = %operation.state, "operation already claimed, skipping");
        return Ok(Claim::Replay);
    }
    operation
        .transition(OperationState::Running)
        .map_err(anyhow::Error::msg)?;
    let operation = store.operations().update(&operation).await?;
    Ok(Claim::Claimed(operation))
}

/// Marks a claimed operation finished. Only after this persists may the
/// delivery be acked.
pub async fn complete_operation(store: &Store, code: &str) -> Result<()> {
    let mut operation = store.operations().get(code).await?;
    operation
        .transition(OperationState::Done)
        .map_err(anyhow::Error::msg)?;
    store.operations().update(&operation).await?;
    Ok(())
}

pub async fn run(args: ServeArgs, cancel: CancellationToken) -> Result<()> {
    keel_cloud::registry::register_builtin();

    let store = Store::open(&args.store).await?;
    tracing::info!(backend = %args.store.store, "store ready");

    let nats = args.nats.connect().await?;
    tracing::info!(url = %args.nats.nats_url, "connected to NATS");

    let jetstream = jetstream::new(nats.clone());
    let stream = jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: OPS_STREAM.to_string(),
            subjects: vec![subjects::CREATE_CLUSTER.to_string()],
            ..Default::default()
        })
        .await
        .context("failed to get or create stream")?;
    let consumer: PullConsumer = stream
        .get_or_create_consumer(
            WORKER_QUEUE,
            jetstream::consumer::pull::Config {
                durable_name: Some(WORKER_QUEUE.to_string()),
                filter_subject: subjects::CREATE_CLUSTER.to_string(),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                ack_wait: ACK_WAIT,
                ..Default::default()
            },
        )
        .await
        .context("failed to get or create consumer")?;
    tracing::info!(consumer = WORKER_QUEUE, "listening for cluster operations");

    let ctx = Context::new(store);
    let mut messages = consumer.messages().await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("dispatcher shutting down");
                return Ok(());
            }
            message = messages.next() => {
                match message {
                    Some(Ok(message)) => handle_message(ctx.clone(), nats.clone(), message),
                    Some(Err(e)) => tracing::error!(error = %e, "error receiving message"),
                    None => {
                        tracing::warn!("message stream closed");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle_message(ctx: Context, nats: async_nats::Client, message: jetstream::Message) {
    let operation = match serde_json::from_slice::<ClusterOperation>(&message.payload) {
        Ok(operation) if !operation.operation_id.is_empty() => operation,
        // Undecodable or empty: drop without ack and let the broker
        // dead-letter it.
        Ok(_) => {
            tracing::warn!("message without operation_id, dropping");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "undecodable message, dropping");
            return;
        }
    };

    // Each message gets its own task so slow clusters don't block the
    // subscription.
    tokio::spawn(async move {
        let code = operation.operation_id;
        let claimed = match claim_operation(ctx.store(), &code).await {
            Ok(Claim::Claimed(op)) => op,
            Ok(Claim::Replay) => {
                ack(&message).await;
                return;
            }
            Err(e) => {
                // Leave unacked so the broker redelivers.
                tracing::error!(operation = %code, error = %e, "failed to claim operation");
                return;
            }
        };

        let ctx = ctx
            .with_owner(&claimed.user_id)
            .with_notifier(Arc::new(NatsNotifier::new(nats)));

        if let Err(e) = keel_cloud::create_cluster(&ctx, &claimed.cluster_id).await {
            tracing::error!(cluster = %claimed.cluster_id, error = %e, "cluster setup failed");
            return;
        }

        // The reconciliation itself runs detached; the delivery is
        // acked only after Done is persisted.
        tokio::spawn(async move {
            match keel_cloud::apply(&ctx, &claimed.cluster_id, false).await {
                Ok(actions) => {
                    tracing::info!(
                        cluster = %claimed.cluster_id,
                        operation = %claimed.code,
                        actions = actions.len(),
                        "apply finished"
                    );
                    match complete_operation(ctx.store(), &claimed.code).await {
                        Ok(()) => ack(&message).await,
                        Err(e) => tracing::error!(
                            operation = %claimed.code,
                            error = %e,
                            "failed to mark operation done"
                        ),
                    }
                }
                Err(e) => {
                    // Not done: leave the message unacked so the broker
                    // redelivers within the retry budget.
                    tracing::error!(
                        cluster = %claimed.cluster_id,
                        operation = %claimed.code,
                        error = %e,
                        "apply failed"
                    );
                }
            }
        });
    });
}

async fn ack(message: &jetstream::Message) {
    if let Err(e) = message.ack().await {
        tracing::error!(error = %e, "failed to ack message");
    }
}
