//! Per-token streaming meters.

use alloy_primitives::U256;
use metrics::counter;
use tracing::{debug, warn};

use agora_primitives::{
    AgentMessage, Invoice, PeerId, unix_ms,
    records::{LedgerEntry, LedgerKind, LedgerStatus, StreamStatus, StreamingAgreement},
    wei,
};

use crate::{PaymentContext, PaymentError, PaymentManager, PaymentResult, StreamContext};

/// Result of recording tokens on a channel.
#[derive(Debug, Clone)]
pub struct StreamingUpdate {
    /// The metered channel.
    pub channel_id: String,
    /// Amount added by this tick, 18-decimal string.
    pub increment: String,
    /// New accumulated total, 18-decimal string.
    pub accumulated: String,
    /// Tokens metered so far (`round(accumulated / rate)`).
    pub total_tokens: u64,
    /// The auto-issued invoice for this increment, when requested.
    pub invoice: Option<Invoice>,
}

impl PaymentManager {
    fn channel_lock(&self, channel_id: &str) -> std::sync::Arc<tokio::sync::Mutex<()>> {
        self.channel_locks
            .entry(channel_id.to_owned())
            .or_default()
            .clone()
    }

    /// The streaming agreement for a channel, from cache or ledger.
    pub fn streaming_channel(&self, channel_id: &str) -> PaymentResult<StreamingAgreement> {
        if let Some(stream) = self.streams.read().get(channel_id) {
            return Ok(stream.clone());
        }
        self.ledger
            .get_stream(channel_id)?
            .ok_or_else(|| PaymentError::NotFound(format!("streaming channel {channel_id}")))
    }

    /// Record `count` generated tokens on a channel.
    ///
    /// All mutation of one channel is serialised by its mutex. The channel
    /// (and its ledger row) is created lazily on the first tick. With
    /// `auto_invoice`, a signed invoice for just the increment goes to the
    /// payer.
    pub async fn record_tokens(
        &self,
        ctx: &StreamContext,
        count: u64,
        auto_invoice: bool,
    ) -> PaymentResult<StreamingUpdate> {
        let lock = self.channel_lock(&ctx.channel_id);
        let _guard = lock.lock().await;

        wei::to_wei_positive(&ctx.rate_per_token)?;
        let now = unix_ms();

        let mut stream = match self.streams.read().get(&ctx.channel_id).cloned() {
            Some(stream) => stream,
            None => match self.ledger.get_stream(&ctx.channel_id)? {
                Some(stream) => stream,
                None => {
                    let stream = StreamingAgreement {
                        id: ctx.channel_id.clone(),
                        job_id: ctx.payment.job_id.clone(),
                        payer: ctx.payment.payer,
                        recipient: ctx.payment.recipient,
                        chain_id: ctx.payment.chain_id,
                        token: ctx.payment.token.clone(),
                        rate_per_token: ctx.rate_per_token.clone(),
                        accumulated_amount: "0".into(),
                        last_tick: now,
                        status: StreamStatus::Active,
                        created_at: now,
                        closed_at: None,
                    };
                    self.ledger.write_stream(&stream)?;
                    self.ledger.write_entry(&LedgerEntry::new(
                        &stream.id,
                        LedgerKind::Streaming,
                        LedgerStatus::Streaming,
                        stream.chain_id,
                        &stream.token,
                        "0",
                        stream.recipient,
                        stream.payer,
                        Some(stream.job_id.clone()),
                        now,
                    ))?;
                    debug!(channel = %stream.id, "Streaming channel opened");
                    stream
                }
            },
        };

        if stream.status == StreamStatus::Closed {
            return Err(PaymentError::StreamClosed(ctx.channel_id.clone()));
        }

        // An existing channel keeps the rate it was opened with.
        let rate = wei::to_wei_positive(&stream.rate_per_token)?;
        let increment = U256::from(count)
            .checked_mul(rate)
            .ok_or(wei::WeiError::Overflow)?;
        let accumulated = stream
            .accumulated_wei()?
            .checked_add(increment)
            .ok_or(wei::WeiError::Overflow)?;

        stream.accumulated_amount = wei::from_wei(accumulated);
        stream.last_tick = now;
        self.ledger.write_stream(&stream)?;
        if let Some(entry) = self.ledger.get_entry(&stream.id)? {
            self.ledger.write_entry(&LedgerEntry {
                amount: stream.accumulated_amount.clone(),
                ..entry
            })?;
        }
        self.streams
            .write()
            .insert(stream.id.clone(), stream.clone());
        counter!("agora_stream_ticks_total").increment(1);

        let invoice = if auto_invoice && !increment.is_zero() {
            let invoice = self.sign_invoice(Invoice::new(
                stream.job_id.clone(),
                stream.chain_id,
                stream.token.clone(),
                ctx.payment.token_address,
                wei::from_wei(increment),
                stream.recipient,
                self.config.invoice_validity_ms,
            ))?;
            self.overlay
                .send(stream.payer, AgentMessage::Invoice(invoice.clone()))
                .await?;
            Some(invoice)
        } else {
            None
        };

        Ok(StreamingUpdate {
            channel_id: stream.id.clone(),
            increment: wei::from_wei(increment),
            accumulated: stream.accumulated_amount.clone(),
            total_tokens: stream.total_tokens()?,
            invoice,
        })
    }

    /// Close a channel: the meter stops, the ledger row settles, and the
    /// in-memory record (and its lock) are dropped.
    pub async fn close_streaming_channel(
        &self,
        channel_id: &str,
    ) -> PaymentResult<StreamingAgreement> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let mut stream = self.streaming_channel(channel_id)?;
        if stream.status == StreamStatus::Closed {
            return Err(PaymentError::AlreadySettled(format!(
                "streaming channel {channel_id}"
            )));
        }

        let now = unix_ms();
        stream.status = StreamStatus::Closed;
        stream.closed_at = Some(now);
        self.ledger.write_stream(&stream)?;
        if let Some(entry) = self.ledger.get_entry(channel_id)? {
            if entry.status.can_transition(LedgerStatus::Settled) {
                self.ledger.write_entry(&LedgerEntry {
                    status: LedgerStatus::Settled,
                    settled_at: Some(now),
                    amount: stream.accumulated_amount.clone(),
                    ..entry
                })?;
            }
        }

        self.streams.write().remove(channel_id);
        drop(_guard);
        self.channel_locks.remove(channel_id);
        debug!(channel = %channel_id, accumulated = %stream.accumulated_amount, "Streaming channel closed");
        Ok(stream)
    }

    /// Dispatcher entry point for `streaming-tick` messages.
    ///
    /// Ticks address an explicit channel, or the sender's sole active
    /// channel. Unknown channels open lazily only when the node configures
    /// a default rate.
    pub async fn handle_streaming_tick(
        &self,
        from: PeerId,
        channel_id: Option<&str>,
        tokens_generated: u64,
    ) -> PaymentResult<StreamingUpdate> {
        let resolved = match channel_id {
            Some(id) => Some(id.to_owned()),
            None => {
                let streams = self.streams.read();
                streams
                    .values()
                    .find(|s| s.payer == from && s.status == StreamStatus::Active)
                    .map(|s| s.id.clone())
            }
        };

        let ctx = match resolved {
            Some(id) => match self.streaming_channel(&id) {
                Ok(stream) => StreamContext {
                    channel_id: id,
                    payment: PaymentContext {
                        job_id: stream.job_id.clone(),
                        payer: stream.payer,
                        recipient: stream.recipient,
                        chain_id: stream.chain_id,
                        token: stream.token.clone(),
                        token_address: None,
                    },
                    rate_per_token: stream.rate_per_token.clone(),
                },
                Err(_) => self.lazy_stream_context(from, id)?,
            },
            None => {
                warn!(%from, "Tick without a resolvable channel");
                return Err(PaymentError::NotFound(format!(
                    "active streaming channel for {from}"
                )));
            }
        };

        self.record_tokens(&ctx, tokens_generated, true).await
    }

    fn lazy_stream_context(&self, from: PeerId, channel_id: String) -> PaymentResult<StreamContext> {
        let Some(rate) = self.config.stream_rate_per_token.clone() else {
            return Err(PaymentError::NotFound(format!(
                "streaming channel {channel_id}"
            )));
        };
        Ok(StreamContext {
            channel_id: channel_id.clone(),
            payment: PaymentContext {
                job_id: channel_id,
                payer: from,
                recipient: self.wallet,
                chain_id: self.config.default_chain_id,
                token: self.config.default_token.clone(),
                token_address: None,
            },
            rate_per_token: rate,
        })
    }
}
