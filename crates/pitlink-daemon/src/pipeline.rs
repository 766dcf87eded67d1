//! The publish pipeline: bounded queue, worker pool, bus fan-out.
//!
//! HTTP handlers push whole batches; workers pop them, validate each packet
//! against the session manager and publish the survivors as CBOR envelopes.
//! The queue bound is the backpressure point: a submitter waits when 128
//! batches are already in flight.
//!
//! A batch is an indivisible unit of work, so packets within one batch are
//! processed in input order. With more than one worker, ordering across
//! batches is unspecified; downstream consumers that insert into
//! order-sensitive tables should run against a single worker.

use std::sync::{Arc, Mutex, PoisonError};

use pitlink_core::envelope::PublishEnvelope;
use pitlink_core::packet::{InnerPacket, Packet};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::{BusChannel, BusTransport};
use crate::session::SessionManager;

/// Queue bound, in batches.
pub const QUEUE_CAPACITY: usize = 128;

/// The pipeline has shut down; the batch was not enqueued.
#[derive(Debug, Error)]
#[error("publish queue is closed")]
pub struct QueueClosed;

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<Packet>>>>;

/// Handle to the running pipeline.
pub struct PublishPipeline {
    sender: Mutex<Option<mpsc::Sender<Vec<Packet>>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PublishPipeline {
    /// Spawns `workers` publish workers (at least one) sharing the bounded
    /// queue. Each worker opens its own bus channel.
    pub fn start(
        workers: usize,
        sessions: Arc<SessionManager>,
        transport: Arc<dyn BusTransport>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&receiver),
                    Arc::clone(&sessions),
                    Arc::clone(&transport),
                ))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: tokio::sync::Mutex::new(handles),
        }
    }

    /// Enqueues a batch, waiting while the queue is full.
    pub async fn submit(&self, batch: Vec<Packet>) -> Result<(), QueueClosed> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(QueueClosed)?;

        sender.send(batch).await.map_err(|_| QueueClosed)
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn stop(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "publish worker did not exit cleanly");
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    receiver: SharedReceiver,
    sessions: Arc<SessionManager>,
    transport: Arc<dyn BusTransport>,
) {
    let mut channel = match transport.open_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            error!(worker, error = %e, "worker could not open a bus channel");
            return;
        }
    };

    loop {
        let batch = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };

        let Some(batch) = batch else {
            break;
        };

        process_batch(worker, &batch, &sessions, channel.as_mut()).await;
    }

    debug!(worker, "publish worker drained and exiting");
}

async fn process_batch(
    worker: usize,
    batch: &[Packet],
    sessions: &SessionManager,
    channel: &mut dyn BusChannel,
) {
    debug!(worker, packets = batch.len(), "processing batch");

    for packet in batch {
        let seq = packet.header.sequence_id;

        let session_id = match sessions.ingest_packet(packet) {
            Ok(session_id) => session_id,
            Err(e) => {
                warn!(worker, seq, error = %e, "packet rejected");
                continue;
            }
        };

        if let InnerPacket::Full(inner) = &packet.inner {
            debug!(
                worker,
                seq,
                ts = packet.header.timestamp,
                queue_fill = inner.queue_fill_amount,
                free_heap = inner.free_heap,
                alloc_count = inner.alloc_count,
                free_count = inner.free_count,
                "accepted full packet"
            );
        }

        let envelope = PublishEnvelope {
            session_id,
            packet: packet.clone(),
        };

        let body = match envelope.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(worker, seq, error = %e, "envelope encoding failed; packet dropped");
                continue;
            }
        };

        if let Err(e) = channel.publish(body).await {
            warn!(worker, seq, error = %e, "publish failed; packet dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::{Signature, SigningKey};
    use pitlink_core::crypto::DeviceKey;
    use pitlink_core::packet::{EssentialsPacket, PacketHeader};
    use pitlink_core::rng;
    use rand::rngs::OsRng;

    use super::*;
    use crate::bus::MemoryTransport;
    use crate::session::ResetOutcome;
    use crate::store::SqliteSessionStore;

    fn manager_with_session() -> (Arc<SessionManager>, ResetOutcome) {
        let signing = SigningKey::random(&mut OsRng);
        let point = signing.verifying_key().to_encoded_point(false);
        let device = DeviceKey::from_coordinates(
            &hex::encode(point.x().unwrap()),
            &hex::encode(point.y().unwrap()),
        )
        .unwrap();

        let manager = Arc::new(SessionManager::new(
            device,
            Arc::new(SqliteSessionStore::in_memory().unwrap()),
        ));

        let token = hex::decode(manager.reset_challenge()).unwrap();
        let signature: Signature = signing.sign_prehash(&token).unwrap();
        let (r, s) = signature.split_bytes();
        let mut body = hex::encode(r).into_bytes();
        body.extend_from_slice(hex::encode(s).as_bytes());

        let outcome = manager.reset(&body).unwrap();
        (manager, outcome)
    }

    fn packet(seq: u32, rng_state: u32) -> Packet {
        Packet {
            header: PacketHeader {
                sequence_id: seq,
                timestamp: 100,
                rng_state,
            },
            inner: InnerPacket::Essentials(EssentialsPacket {
                speed: 10.0,
                battery_temperatures: [25.0; 5],
                voltage: 96.0,
                remaining_watt_hours: 900.0,
            }),
        }
    }

    #[tokio::test]
    async fn accepted_packets_publish_exactly_once() {
        let (manager, outcome) = manager_with_session();
        let transport = Arc::new(MemoryTransport::new());
        let pipeline = PublishPipeline::start(1, manager, Arc::clone(&transport) as _);

        let batch = vec![
            packet(0, rng::nth_output(outcome.seed, 0)),
            packet(1, rng::nth_output(outcome.seed, 1)),
        ];

        pipeline.submit(batch).await.unwrap();
        pipeline.stop().await;

        let published = transport.published();
        assert_eq!(published.len(), 2);

        for (i, body) in published.iter().enumerate() {
            let envelope = PublishEnvelope::from_bytes(body).unwrap();
            assert_eq!(envelope.session_id, outcome.session_id);
            assert_eq!(envelope.packet.header.sequence_id, i as u32);
        }
    }

    #[tokio::test]
    async fn corrupt_packet_is_skipped_but_the_batch_continues() {
        let (manager, outcome) = manager_with_session();
        let transport = Arc::new(MemoryTransport::new());
        let pipeline = PublishPipeline::start(1, Arc::clone(&manager), Arc::clone(&transport) as _);

        let batch = vec![
            packet(0, rng::nth_output(outcome.seed, 0)),
            packet(1, rng::nth_output(outcome.seed, 1) ^ 1),
            packet(2, rng::nth_output(outcome.seed, 2)),
        ];

        pipeline.submit(batch).await.unwrap();
        pipeline.stop().await;

        let published = transport.published();
        assert_eq!(published.len(), 2);

        let sequences: Vec<u32> = published
            .iter()
            .map(|b| PublishEnvelope::from_bytes(b).unwrap().packet.header.sequence_id)
            .collect();
        assert_eq!(sequences, vec![0, 2]);

        // The rejected packet never counted as accepted, so the only gap is
        // the one it left behind.
        assert_eq!(manager.dropped_count(), Some(1));
    }

    #[tokio::test]
    async fn publish_failures_drop_packets_but_keep_the_worker_alive() {
        let (manager, outcome) = manager_with_session();
        let transport = Arc::new(MemoryTransport::failing());
        let pipeline = PublishPipeline::start(1, Arc::clone(&manager), Arc::clone(&transport) as _);

        pipeline
            .submit(vec![packet(0, rng::nth_output(outcome.seed, 0))])
            .await
            .unwrap();
        pipeline
            .submit(vec![packet(1, rng::nth_output(outcome.seed, 1))])
            .await
            .unwrap();
        pipeline.stop().await;

        assert!(transport.published().is_empty());
        // Both packets were still validated and accepted.
        assert_eq!(manager.dropped_count(), Some(0));
    }

    #[tokio::test]
    async fn submit_after_stop_reports_a_closed_queue() {
        let (manager, outcome) = manager_with_session();
        let transport = Arc::new(MemoryTransport::new());
        let pipeline = PublishPipeline::start(1, manager, transport);

        pipeline.stop().await;

        let result = pipeline
            .submit(vec![packet(0, rng::nth_output(outcome.seed, 0))])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn batches_without_a_session_publish_nothing() {
        let signing = SigningKey::random(&mut OsRng);
        let point = signing.verifying_key().to_encoded_point(false);
        let device = DeviceKey::from_coordinates(
            &hex::encode(point.x().unwrap()),
            &hex::encode(point.y().unwrap()),
        )
        .unwrap();
        let manager = Arc::new(SessionManager::new(
            device,
            Arc::new(SqliteSessionStore::in_memory().unwrap()),
        ));

        let transport = Arc::new(MemoryTransport::new());
        let pipeline = PublishPipeline::start(1, manager, Arc::clone(&transport) as _);

        pipeline.submit(vec![packet(0, 641)]).await.unwrap();
        pipeline.stop().await;

        assert!(transport.published().is_empty());
    }
}
