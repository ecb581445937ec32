//! Built-in handlers and self-contained traffic for bustxd

use crate::config::DemoConfig;
use bustx_core::{
    wait, Command, Context, Reaction, ReactionResult, Transaction, TransactionManager,
    TransactionMode, TxnResult,
};
use bustx_frame::Frame;
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Echo request
pub const CMD_ECHO: Command = 0x1001;
/// Echo reply
pub const CMD_ECHO_REPLY: Command = 0x1002;
/// Query request
pub const CMD_QUERY: Command = 0x2001;
/// Query reply, payload is a status byte followed by the result
pub const CMD_QUERY_REPLY: Command = 0x2002;
/// Query forwarded to the backend
pub const CMD_BACKEND_QUERY: Command = 0x2101;
/// Backend answer to a forwarded query
pub const CMD_BACKEND_RESULT: Command = 0x2102;

/// Query answered by the backend
pub const STATUS_OK: u8 = 0;
/// Backend did not answer in time
pub const STATUS_TIMEOUT: u8 = 1;

const PHASE_WAIT_BACKEND: u32 = 1;

/// Replies with the request payload
#[derive(Debug, Default)]
pub struct EchoTransaction;

impl Transaction for EchoTransaction {
    fn on_awake(&mut self, ctx: &mut Context<'_>) -> ReactionResult {
        let payload = ctx.payload().clone();
        ctx.reply(CMD_ECHO_REPLY, payload);
        Ok(Reaction::Exit)
    }
}

/// Forwards a query to the backend and relays its answer
#[derive(Debug, Default)]
pub struct QueryTransaction {
    origin: Option<Frame>,
}

impl QueryTransaction {
    fn answer(&mut self, ctx: &mut Context<'_>, status: u8, result: &[u8]) -> ReactionResult {
        let Some(origin) = self.origin.take() else {
            anyhow::bail!("query {} lost its request", ctx.id());
        };

        let mut body = BytesMut::with_capacity(1 + result.len());
        body.put_u8(status);
        body.put_slice(result);
        ctx.send(origin.reply(CMD_QUERY_REPLY, body.freeze()).with_transaction_id(ctx.id()));
        Ok(Reaction::Exit)
    }
}

impl Transaction for QueryTransaction {
    fn on_awake(&mut self, ctx: &mut Context<'_>) -> ReactionResult {
        let origin = ctx.frame().clone();
        let query = Frame::request(CMD_BACKEND_QUERY, ctx.requester_id(), origin.payload.clone())
            .with_transaction_id(ctx.id());
        self.origin = Some(origin);

        ctx.send(query);
        ctx.enter_phase(PHASE_WAIT_BACKEND, wait::TWO_SECONDS, CMD_BACKEND_RESULT);
        Ok(Reaction::Wait)
    }

    fn on_active(&mut self, ctx: &mut Context<'_>) -> ReactionResult {
        let result = ctx.payload().clone();
        self.answer(ctx, STATUS_OK, &result)
    }

    fn on_timeout(&mut self, ctx: &mut Context<'_>) -> ReactionResult {
        tracing::warn!("Query {} timed out waiting for backend", ctx.id());
        self.answer(ctx, STATUS_TIMEOUT, &[])
    }

    fn reconstruct(&mut self) {
        self.origin = None;
    }

    fn destruct(&mut self) {
        self.origin = None;
    }
}

/// Register the built-in handlers
pub fn register_handlers(manager: &mut TransactionManager) -> TxnResult<()> {
    manager.register::<EchoTransaction>(CMD_ECHO, TransactionMode::Asynchronous)?;
    manager.register::<QueryTransaction>(CMD_QUERY, TransactionMode::Asynchronous)?;
    Ok(())
}

/// Answer for a frame sent to the backend, `None` for frames leaving the bus
pub fn backend_answer(frame: &Frame) -> Option<Frame> {
    if frame.cmd() != CMD_BACKEND_QUERY {
        return None;
    }

    let mut result = BytesMut::with_capacity(frame.payload.len());
    result.extend(frame.payload.iter().rev());
    Some(frame.reply(CMD_BACKEND_RESULT, result.freeze()))
}

/// Consume outbound frames, answering backend queries into the inbox
///
/// Returns when the outbound channel closes.
pub async fn loopback(mut outbound: mpsc::Receiver<Frame>, inbox: mpsc::Sender<Bytes>) {
    let mut delivered = 0u64;

    while let Some(frame) = outbound.recv().await {
        match backend_answer(&frame) {
            Some(answer) => {
                // Dropping on a full inbox mirrors a lossy bus
                if inbox.try_send(answer.encode()).is_err() {
                    tracing::warn!(
                        "Inbox full, backend answer for {} dropped",
                        frame.transaction_id()
                    );
                }
            }
            None => {
                delivered += 1;
                tracing::debug!(
                    "Outbound cmd {:#06x} txn {} payload {}",
                    frame.cmd(),
                    frame.transaction_id(),
                    hex::encode(&frame.payload)
                );
            }
        }
    }

    tracing::info!("Loopback stopped after {} replies", delivered);
}

/// Feed random echo and query requests into the inbox every tick
///
/// Returns when the inbox closes.
pub async fn generate_load(config: DemoConfig, tick: Duration, inbox: mpsc::Sender<Bytes>) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval(tick);
    let pool = config.requester_pool.max(1);

    tracing::info!(
        "Demo traffic: {} requests per tick from {} requesters",
        config.requests_per_tick,
        pool
    );

    loop {
        ticker.tick().await;

        for _ in 0..config.requests_per_tick {
            let cmd = if rng.gen_bool(0.5) { CMD_ECHO } else { CMD_QUERY };
            let requester = rng.gen_range(0..pool);
            let payload: [u8; 8] = rng.gen();

            let frame = Frame::request(cmd, requester, payload.to_vec());
            if inbox.send(frame.encode()).await.is_err() {
                tracing::info!("Inbox closed, demo traffic stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bustx_core::{Completion, ManagerConfig, ManualClock};

    fn manager() -> (TransactionManager, ManualClock) {
        let clock = ManualClock::new(0);
        let mut manager = TransactionManager::with_clock(ManagerConfig::default(), clock.clone());
        register_handlers(&mut manager).unwrap();
        (manager, clock)
    }

    #[test]
    fn test_echo() {
        let (mut manager, _clock) = manager();
        let request = Frame::request(CMD_ECHO, 5, &b"abc"[..]);

        let dispatch = manager.process_frame(&request).unwrap();
        assert_eq!(dispatch.completion, Completion::Exited);

        let out = manager.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cmd(), CMD_ECHO_REPLY);
        assert_eq!(out[0].requester_id(), 5);
        assert_eq!(out[0].payload, Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_query_answered_by_backend() {
        let (mut manager, _clock) = manager();
        let request = Frame::request(CMD_QUERY, 5, &b"abc"[..]);
        let id = manager.process_frame(&request).unwrap().transaction_id;

        let out = manager.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cmd(), CMD_BACKEND_QUERY);
        assert_eq!(out[0].transaction_id(), id);

        let answer = backend_answer(&out[0]).unwrap();
        assert_eq!(answer.cmd(), CMD_BACKEND_RESULT);
        let dispatch = manager.process_frame(&answer).unwrap();
        assert_eq!(dispatch.completion, Completion::Exited);

        let out = manager.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cmd(), CMD_QUERY_REPLY);
        assert_eq!(out[0].requester_id(), 5);
        assert_eq!(out[0].payload, Bytes::from_static(b"\x00cba"));
    }

    #[test]
    fn test_query_timeout() {
        let (mut manager, clock) = manager();
        manager
            .process_frame(&Frame::request(CMD_QUERY, 5, &b"abc"[..]))
            .unwrap();
        manager.drain_outbox();

        clock.advance(2_000);
        assert_eq!(manager.handle_timeout(), 1);

        let out = manager.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cmd(), CMD_QUERY_REPLY);
        assert_eq!(out[0].payload, Bytes::from_static(&[STATUS_TIMEOUT]));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_backend_answer_ignores_replies() {
        let reply = Frame::request(CMD_ECHO_REPLY, 1, Bytes::new());
        assert!(backend_answer(&reply).is_none());
    }

    #[tokio::test]
    async fn test_loopback_answers_queries() {
        let (out_tx, out_rx) = mpsc::channel(4);
        let (inbox_tx, mut inbox_rx) = mpsc::channel(4);
        let task = tokio::spawn(loopback(out_rx, inbox_tx));

        let query = Frame::request(CMD_BACKEND_QUERY, 3, &b"xy"[..]).with_transaction_id(77);
        out_tx.send(query).await.unwrap();
        out_tx
            .send(Frame::request(CMD_ECHO_REPLY, 3, Bytes::new()))
            .await
            .unwrap();
        drop(out_tx);
        task.await.unwrap();

        let answer = Frame::decode(inbox_rx.recv().await.unwrap()).unwrap();
        assert_eq!(answer.cmd(), CMD_BACKEND_RESULT);
        assert_eq!(answer.transaction_id(), 77);
        assert_eq!(answer.payload, Bytes::from_static(b"yx"));
        assert!(inbox_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_generate_load_stops_on_closed_inbox() {
        let (inbox_tx, mut inbox_rx) = mpsc::channel(64);
        let config = DemoConfig {
            enabled: true,
            requests_per_tick: 3,
            requester_pool: 2,
        };
        let task = tokio::spawn(generate_load(config, Duration::from_millis(5), inbox_tx));

        for _ in 0..3 {
            let frame = Frame::decode(inbox_rx.recv().await.unwrap()).unwrap();
            assert!(frame.cmd() == CMD_ECHO || frame.cmd() == CMD_QUERY);
            assert!(frame.requester_id() < 2);
            assert_eq!(frame.payload.len(), 8);
        }
        drop(inbox_rx);
        task.await.unwrap();
    }
}
