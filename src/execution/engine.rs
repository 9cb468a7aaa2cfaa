// =============================================================================
// Execution Engine — turns ApprovedOrders into live broker orders
// =============================================================================
//
// Per-order lifecycle:
//
//   PENDING -> WORKING -> OPEN -> CLOSING -> CLOSED
//                \          \        \
//                 -> REJECTED, EXPIRED, STOPPED_OUT
//
// Contract points:
//   - The engine waits for the entry fill before placing the stop-loss and
//     take-profit children (bracket discipline).
//   - A partial fill at the wait-window deadline cancels the remainder and
//     proceeds on filled_qty; a zero fill expires the trade.
//   - Every broker call carries a deterministic client_tag derived from
//     (trade_id, purpose), so retries are idempotent.
//   - One order's rejection never aborts the batch.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::artifacts::ApprovedOrder;
use crate::audit::{AuditKind, AuditLog};
use crate::auth::{AuthManager, AuthStatus};
use crate::broker::{
    BrokerError, BrokerOrder, BrokerOrderStatus, BrokerPort, OrderChanges, OrderIntent,
    OrderUpdate,
};
use crate::config::ExecutionParams;
use crate::ledger::{Trade, TradeLedger, TradeStatus};
use crate::types::{Direction, EntryType, ProductType};

/// Bounded retry attempts for rate-limited broker calls.
const MAX_PLACE_ATTEMPTS: u32 = 3;

/// Poll cadence while waiting inside the entry fill window.
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Per-order outcome of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub symbol: String,
    pub trade_id: String,
    pub status: String,
    pub message: Option<String>,
}

/// Execution report written back into the workflow session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub session_id: String,
    pub results: Vec<OrderResult>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives approved orders through the broker and keeps the trade ledger as
/// the authoritative record.
pub struct ExecutionEngine {
    broker: Arc<dyn BrokerPort>,
    ledger: Arc<TradeLedger>,
    audit: Arc<AuditLog>,
    params: ExecutionParams,
    auth: Option<Arc<AuthManager>>,
}

impl ExecutionEngine {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        ledger: Arc<TradeLedger>,
        audit: Arc<AuditLog>,
        params: ExecutionParams,
        auth: Option<Arc<AuthManager>>,
    ) -> Self {
        Self {
            broker,
            ledger,
            audit,
            params,
            auth,
        }
    }

    pub fn ledger(&self) -> &Arc<TradeLedger> {
        &self.ledger
    }

    // -------------------------------------------------------------------------
    // Batch entry point
    // -------------------------------------------------------------------------

    /// Execute a batch of approved orders.  An empty batch is a valid input
    /// and produces an empty report.
    pub async fn execute_batch(
        &self,
        orders: &[ApprovedOrder],
        session_id: &str,
    ) -> ExecutionReport {
        let mut results = Vec::with_capacity(orders.len());

        for order in orders {
            let result = match self.execute_one(order, session_id).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(symbol = %order.symbol, error = %e, "order execution errored");
                    OrderResult {
                        symbol: order.symbol.clone(),
                        trade_id: String::new(),
                        status: "ERROR".to_string(),
                        message: Some(format!("{e:#}")),
                    }
                }
            };
            results.push(result);
        }

        info!(
            session_id,
            orders = orders.len(),
            results = results.len(),
            "execution batch complete"
        );
        ExecutionReport {
            session_id: session_id.to_string(),
            results,
        }
    }

    async fn execute_one(&self, order: &ApprovedOrder, session_id: &str) -> Result<OrderResult> {
        let trade = self.ledger.create(order, session_id)?;
        let trade_id = trade.trade_id.clone();

        // --- Margin gate -----------------------------------------------------
        let intent = self.entry_intent(order, &trade_id).await;
        if let Ok(margin) = self.broker.calc_margin(std::slice::from_ref(&intent)).await {
            if !margin.sufficient() {
                let msg = format!(
                    "insufficient margin: need {:.0}, have {:.0}",
                    margin.required, margin.available
                );
                self.ledger
                    .transition(&trade_id, TradeStatus::Rejected, msg.clone())?;
                return Ok(OrderResult {
                    symbol: order.symbol.clone(),
                    trade_id,
                    status: TradeStatus::Rejected.to_string(),
                    message: Some(msg),
                });
            }
        }

        // --- Entry -----------------------------------------------------------
        let entry_order_id = match self.place_with_backoff(&intent).await {
            Ok(id) => id,
            Err(BrokerError::InvalidSymbol(msg)) | Err(BrokerError::Rejected { message: msg, .. }) => {
                self.ledger
                    .transition(&trade_id, TradeStatus::Rejected, msg.clone())?;
                return Ok(OrderResult {
                    symbol: order.symbol.clone(),
                    trade_id,
                    status: TradeStatus::Rejected.to_string(),
                    message: Some(msg),
                });
            }
            Err(e) => {
                // Hard failure before anything reached the broker: the trade
                // stays PENDING for the next reconcile pass to resolve.
                return Err(anyhow!("entry placement failed: {e}"));
            }
        };

        self.ledger.update(&trade_id, |t| {
            t.entry_order_id = Some(entry_order_id.clone());
        })?;
        self.ledger
            .transition(&trade_id, TradeStatus::Working, "entry accepted by broker")?;

        // --- Fill wait window -----------------------------------------------
        let filled = self.await_entry_fill(&entry_order_id).await?;

        if filled.filled_qty == 0 {
            let (terminal, reason) = if filled.status == BrokerOrderStatus::Rejected {
                (
                    TradeStatus::Rejected,
                    filled
                        .message
                        .unwrap_or_else(|| "entry rejected by broker".to_string()),
                )
            } else {
                self.cancel_quietly(&entry_order_id).await;
                (
                    TradeStatus::Expired,
                    "no fill inside the entry wait window".to_string(),
                )
            };
            self.ledger.transition(&trade_id, terminal, reason)?;
            return Ok(OrderResult {
                symbol: order.symbol.clone(),
                trade_id,
                status: terminal.to_string(),
                message: None,
            });
        }

        let min_fill = (order.quantity as f64 * self.params.min_fill_ratio).ceil() as u32;
        if filled.filled_qty < order.quantity {
            self.cancel_quietly(&entry_order_id).await;
            if filled.filled_qty < min_fill {
                // Unwind the sub-minimum fill at market before expiring the
                // intent; a trade below the viable size is not worth running.
                let unwind = OrderIntent {
                    client_tag: format!("{trade_id}:unwind"),
                    symbol: order.symbol.clone(),
                    side: order.direction.exit_side(),
                    order_type: EntryType::Market,
                    quantity: filled.filled_qty,
                    limit_price: None,
                    trigger_price: None,
                    product_type: ProductType::Intraday,
                    parent_id: None,
                };
                if let Err(e) = self.place_with_backoff(&unwind).await {
                    warn!(trade_id = %trade_id, error = %e, "sub-minimum fill unwind failed");
                }
                self.ledger.transition(
                    &trade_id,
                    TradeStatus::Expired,
                    format!(
                        "fill {} below minimum {} — unwound and cancelled",
                        filled.filled_qty, min_fill
                    ),
                )?;
                return Ok(OrderResult {
                    symbol: order.symbol.clone(),
                    trade_id,
                    status: TradeStatus::Expired.to_string(),
                    message: None,
                });
            }
            debug!(
                trade_id = %trade_id,
                filled = filled.filled_qty,
                requested = order.quantity,
                "partial fill — proceeding on filled quantity"
            );
        }

        self.ledger.update(&trade_id, |t| {
            t.filled_qty = filled.filled_qty;
            t.remaining_qty = filled.filled_qty;
            t.entry_fill_price = Some(filled.avg_fill_price);
            t.entry_time = Some(Utc::now());
        })?;
        self.ledger.transition(
            &trade_id,
            TradeStatus::Open,
            format!(
                "entry filled {}@{:.2}",
                filled.filled_qty, filled.avg_fill_price
            ),
        )?;

        // --- Brackets --------------------------------------------------------
        self.place_brackets(&trade_id, order, &entry_order_id, filled.filled_qty)
            .await?;

        Ok(OrderResult {
            symbol: order.symbol.clone(),
            trade_id,
            status: TradeStatus::Open.to_string(),
            message: None,
        })
    }

    /// Build the entry intent.  A MARKET approval is downgraded to LIMIT
    /// when the live quote no longer shows the liquidity that justified it.
    async fn entry_intent(&self, order: &ApprovedOrder, trade_id: &str) -> OrderIntent {
        let mut entry_type = order.entry_type;
        let mut limit_price = order.entry_price;

        if entry_type == EntryType::Market {
            let quote = self
                .broker
                .get_quote(&[order.symbol.clone()])
                .await
                .ok()
                .and_then(|mut q| q.pop());
            match quote {
                Some(q) if q.volume >= self.params.high_liquidity_volume => {}
                _ => {
                    // Low liquidity never goes MARKET: limit with a small
                    // offset past the touch to stay fillable.
                    entry_type = EntryType::Limit;
                    let offset = order.entry_price * self.params.limit_offset_bps / 10_000.0;
                    limit_price = match order.direction {
                        Direction::Long => order.entry_price + offset,
                        Direction::Short => order.entry_price - offset,
                    };
                    debug!(symbol = %order.symbol, "downgraded MARKET entry to LIMIT on thin quote");
                }
            }
        }

        OrderIntent {
            client_tag: format!("{trade_id}:entry"),
            symbol: order.symbol.clone(),
            side: order.direction.entry_side(),
            order_type: entry_type,
            quantity: order.quantity,
            limit_price: (entry_type == EntryType::Limit).then_some(limit_price),
            trigger_price: None,
            product_type: ProductType::Intraday,
            parent_id: None,
        }
    }

    /// Poll the broker for the entry fill until the wait window closes.
    async fn await_entry_fill(&self, entry_order_id: &str) -> Result<BrokerOrder> {
        let window = Duration::from_secs(self.params.entry_wait_secs);
        let start = tokio::time::Instant::now();

        loop {
            let order = self.find_order(entry_order_id).await?;
            if order.status == BrokerOrderStatus::Filled {
                return Ok(order);
            }
            if matches!(
                order.status,
                BrokerOrderStatus::Rejected | BrokerOrderStatus::Cancelled
            ) {
                return Ok(order);
            }
            if start.elapsed() >= window {
                return Ok(order);
            }
            tokio::time::sleep(FILL_POLL_INTERVAL.min(window.saturating_sub(start.elapsed())))
                .await;
        }
    }

    async fn find_order(&self, order_id: &str) -> Result<BrokerOrder> {
        let orders = self
            .broker
            .get_orders()
            .await
            .map_err(|e| anyhow!("order book fetch failed: {e}"))?;
        orders
            .into_iter()
            .find(|o| o.order_id == order_id)
            .with_context(|| format!("order {order_id} not found at broker"))
    }

    /// Place the SL and TP children.  A failed placement is retried once;
    /// two consecutive failures escalate to a forced close.
    async fn place_brackets(
        &self,
        trade_id: &str,
        order: &ApprovedOrder,
        entry_order_id: &str,
        quantity: u32,
    ) -> Result<()> {
        let exit_side = order.direction.exit_side();

        let sl_id = self
            .place_child_with_retry(
                entry_order_id,
                exit_side,
                EntryType::Market,
                order.stop_loss,
                quantity,
                &format!("{trade_id}:sl"),
            )
            .await;
        let sl_id = match sl_id {
            Ok(id) => id,
            Err(e) => {
                self.force_close(trade_id, &format!("stop-loss placement failed twice: {e}"))
                    .await?;
                return Ok(());
            }
        };

        let tp_id = self
            .place_child_with_retry(
                entry_order_id,
                exit_side,
                EntryType::Limit,
                order.take_profit,
                quantity,
                &format!("{trade_id}:tp"),
            )
            .await;
        let tp_id = match tp_id {
            Ok(id) => id,
            Err(e) => {
                self.cancel_quietly(&sl_id).await;
                self.force_close(trade_id, &format!("take-profit placement failed twice: {e}"))
                    .await?;
                return Ok(());
            }
        };

        self.ledger.update(trade_id, |t| {
            t.sl_order_id = Some(sl_id.clone());
            t.tp_order_id = Some(tp_id.clone());
        })?;
        info!(trade_id, sl = %sl_id, tp = %tp_id, "bracket children placed");
        Ok(())
    }

    async fn place_child_with_retry(
        &self,
        parent_id: &str,
        side: crate::types::Side,
        order_type: EntryType,
        price: f64,
        quantity: u32,
        client_tag: &str,
    ) -> Result<String, BrokerError> {
        let mut last_err = None;
        for attempt in 0..2 {
            match self
                .broker
                .place_bracket_child(parent_id, side, order_type, price, quantity, client_tag)
                .await
            {
                Ok(id) => return Ok(id),
                Err(e) => {
                    warn!(attempt, error = %e, "bracket child placement failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    // -------------------------------------------------------------------------
    // Monitor-facing operations (modify existing orders only)
    // -------------------------------------------------------------------------

    /// Move a trade's stop to `new_stop` by modifying the live SL child.
    pub async fn modify_stop(&self, trade_id: &str, new_stop: f64, reason: &str) -> Result<()> {
        let trade = self.trade(trade_id)?;
        let sl_id = trade
            .sl_order_id
            .clone()
            .with_context(|| format!("trade {trade_id} has no stop order"))?;

        self.broker
            .modify_order(
                &sl_id,
                &OrderChanges {
                    trigger_price: Some(new_stop),
                    ..OrderChanges::default()
                },
            )
            .await
            .map_err(|e| anyhow!("stop modification failed: {e}"))?;

        self.ledger.update(trade_id, |t| t.current_stop = new_stop)?;
        self.ledger
            .add_note(trade_id, format!("stop -> {new_stop:.2} ({reason})"))?;
        Ok(())
    }

    /// Book part of a position with a market exit; children shrink to the
    /// remainder.
    pub async fn partial_exit(&self, trade_id: &str, quantity: u32, reason: &str) -> Result<()> {
        let trade = self.trade(trade_id)?;
        if quantity == 0 || quantity >= trade.remaining_qty {
            return Err(anyhow!(
                "partial exit quantity {quantity} out of range (remaining {})",
                trade.remaining_qty
            ));
        }

        let intent = OrderIntent {
            client_tag: format!("{trade_id}:partial"),
            symbol: trade.order.symbol.clone(),
            side: trade.order.direction.exit_side(),
            order_type: EntryType::Market,
            quantity,
            limit_price: None,
            trigger_price: None,
            product_type: ProductType::Intraday,
            parent_id: None,
        };
        let exit_id = self
            .place_with_backoff(&intent)
            .await
            .map_err(|e| anyhow!("partial exit failed: {e}"))?;

        let exit_price = self
            .find_order(&exit_id)
            .await
            .map(|o| o.avg_fill_price)
            .unwrap_or(0.0);
        let entry = trade.entry_fill_price.unwrap_or(trade.order.entry_price);
        let booked =
            (exit_price - entry) * trade.order.direction.sign() * quantity as f64;

        let remaining = trade.remaining_qty - quantity;
        self.ledger.update(trade_id, |t| {
            t.remaining_qty = remaining;
            t.realized_pnl = Some(t.realized_pnl.unwrap_or(0.0) + booked);
            t.partial_booked = true;
        })?;
        self.ledger.add_note(
            trade_id,
            format!("partial exit {quantity}@{exit_price:.2} ({reason})"),
        )?;

        for child in [trade.sl_order_id.as_deref(), trade.tp_order_id.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self
                .broker
                .modify_order(
                    child,
                    &OrderChanges {
                        quantity: Some(remaining),
                        ..OrderChanges::default()
                    },
                )
                .await
            {
                warn!(trade_id, child, error = %e, "failed to shrink bracket child");
            }
        }
        Ok(())
    }

    /// Close a trade at market (monitor decision, news invalidation, time
    /// flatten, forced close).
    pub async fn close_trade(&self, trade_id: &str, reason: &str) -> Result<()> {
        let trade = self.trade(trade_id)?;
        if trade.status != TradeStatus::Open {
            return Err(anyhow!(
                "cannot close trade {trade_id} in state {}",
                trade.status
            ));
        }

        self.ledger
            .transition(trade_id, TradeStatus::Closing, reason.to_string())?;

        // Children first so the exit cannot double-fill.
        for child in [trade.sl_order_id.as_deref(), trade.tp_order_id.as_deref()]
            .into_iter()
            .flatten()
        {
            self.cancel_quietly(child).await;
        }

        let intent = OrderIntent {
            client_tag: format!("{trade_id}:close"),
            symbol: trade.order.symbol.clone(),
            side: trade.order.direction.exit_side(),
            order_type: EntryType::Market,
            quantity: trade.remaining_qty,
            limit_price: None,
            trigger_price: None,
            product_type: ProductType::Intraday,
            parent_id: None,
        };
        let exit_id = self
            .place_with_backoff(&intent)
            .await
            .map_err(|e| anyhow!("close order failed: {e}"))?;

        if let Ok(exit) = self.find_order(&exit_id).await {
            if exit.status == BrokerOrderStatus::Filled {
                self.finalize_exit(trade_id, exit.avg_fill_price, reason, TradeStatus::Closed)?;
            }
        }
        Ok(())
    }

    async fn force_close(&self, trade_id: &str, reason: &str) -> Result<()> {
        self.audit.record(
            AuditKind::ForcedClose,
            format!("trade {trade_id} force-closed"),
            json!({ "reason": reason }),
        );
        self.close_trade(trade_id, reason).await
    }

    // -------------------------------------------------------------------------
    // Order update reconciliation
    // -------------------------------------------------------------------------

    /// Apply one broker order update to the ledger.  Idempotent on
    /// (order_id, status): replays of an already-applied update are no-ops.
    pub fn process_update(&self, update: &OrderUpdate) -> Result<()> {
        let Some(trade) = self.trade_for_order(&update.order_id) else {
            debug!(order_id = %update.order_id, "update for unknown order — ignoring");
            return Ok(());
        };
        if trade.status.is_terminal() {
            return Ok(());
        }

        let trade_id = trade.trade_id.clone();
        let is_sl = trade.sl_order_id.as_deref() == Some(update.order_id.as_str());
        let is_tp = trade.tp_order_id.as_deref() == Some(update.order_id.as_str());

        match update.status {
            BrokerOrderStatus::Filled if is_sl => {
                if trade.status == TradeStatus::Open {
                    self.finalize_exit(
                        &trade_id,
                        update.avg_fill_price,
                        "stop-loss filled",
                        TradeStatus::StoppedOut,
                    )?;
                    if let Some(tp) = &trade.tp_order_id {
                        self.spawn_cancel(tp.clone());
                    }
                } else if trade.status == TradeStatus::Closing {
                    self.finalize_exit(
                        &trade_id,
                        update.avg_fill_price,
                        "stop-loss filled during close",
                        TradeStatus::StoppedOut,
                    )?;
                }
            }
            BrokerOrderStatus::Filled if is_tp => {
                if trade.status == TradeStatus::Open {
                    self.ledger
                        .transition(&trade_id, TradeStatus::Closing, "take-profit filled")?;
                    self.finalize_exit(
                        &trade_id,
                        update.avg_fill_price,
                        "take-profit filled",
                        TradeStatus::Closed,
                    )?;
                    if let Some(sl) = &trade.sl_order_id {
                        self.spawn_cancel(sl.clone());
                    }
                }
            }
            _ => {
                debug!(
                    order_id = %update.order_id,
                    status = %update.status,
                    "order update noted"
                );
            }
        }
        Ok(())
    }

    /// Drain an order-update stream into the ledger (spawned at startup).
    pub fn spawn_update_pump(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.broker.subscribe_orders();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = engine.process_update(&update) {
                    warn!(error = %e, order_id = %update.order_id, "order update processing failed");
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn trade(&self, trade_id: &str) -> Result<Trade> {
        self.ledger
            .get(trade_id)
            .with_context(|| format!("unknown trade {trade_id}"))
    }

    fn trade_for_order(&self, order_id: &str) -> Option<Trade> {
        self.ledger.by_status(TradeStatus::Open).into_iter()
            .chain(self.ledger.by_status(TradeStatus::Working))
            .chain(self.ledger.by_status(TradeStatus::Closing))
            .find(|t| {
                t.entry_order_id.as_deref() == Some(order_id)
                    || t.sl_order_id.as_deref() == Some(order_id)
                    || t.tp_order_id.as_deref() == Some(order_id)
            })
    }

    pub(crate) fn finalize_exit(
        &self,
        trade_id: &str,
        exit_price: f64,
        reason: &str,
        terminal: TradeStatus,
    ) -> Result<()> {
        let trade = self.trade(trade_id)?;
        let entry = trade.entry_fill_price.unwrap_or(trade.order.entry_price);
        let pnl = (exit_price - entry)
            * trade.order.direction.sign()
            * trade.remaining_qty as f64;

        self.ledger.update(trade_id, |t| {
            t.exit_time = Some(Utc::now());
            t.exit_fill_price = Some(exit_price);
            t.realized_pnl = Some(t.realized_pnl.unwrap_or(0.0) + pnl);
            t.remaining_qty = 0;
            t.exit_reason = Some(reason.to_string());
        })?;
        self.ledger.transition(trade_id, terminal, reason.to_string())?;

        info!(
            trade_id,
            exit_price,
            pnl,
            terminal = %terminal,
            reason,
            "trade exited"
        );
        Ok(())
    }

    fn spawn_cancel(&self, order_id: String) {
        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            if let Err(e) = broker.cancel_order(&order_id).await {
                debug!(order_id = %order_id, error = %e, "sibling cancel failed (may already be done)");
            }
        });
    }

    async fn cancel_quietly(&self, order_id: &str) {
        if let Err(e) = self.broker.cancel_order(order_id).await {
            debug!(order_id, error = %e, "cancel failed (may already be terminal)");
        }
    }

    /// Place an order with bounded backoff on RATE_LIMIT and a single token
    /// ladder pass on AUTH_EXPIRED.
    async fn place_with_backoff(&self, intent: &OrderIntent) -> Result<String, BrokerError> {
        let mut attempt = 0;
        loop {
            match self.broker.place_order(intent).await {
                Ok(id) => return Ok(id),
                Err(BrokerError::RateLimit { retry_after_ms }) if attempt + 1 < MAX_PLACE_ATTEMPTS => {
                    let backoff = Duration::from_millis(retry_after_ms.max(100) << attempt);
                    warn!(
                        client_tag = %intent.client_tag,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "rate limited — backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(BrokerError::AuthExpired) if attempt == 0 => {
                    let Some(auth) = &self.auth else {
                        return Err(BrokerError::AuthExpired);
                    };
                    warn!("auth expired during placement — running token ladder");
                    match auth.ensure_valid().await {
                        AuthStatus::Valid => attempt += 1,
                        _ => return Err(BrokerError::AuthExpired),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{Candidate, ProducedBy};
    use crate::broker::sim::SimBroker;

    fn produced() -> ProducedBy {
        ProducedBy::new("order_execution", "execute", "run-1")
    }

    fn approved(symbol: &str, entry: f64, sl: f64, tp: f64, qty: u32) -> ApprovedOrder {
        let candidate = Candidate::new(
            format!("c-{symbol}"),
            symbol,
            Direction::Long,
            0.8,
            0.8,
            entry,
            entry + 0.2,
            sl,
            tp,
            0.5,
            Vec::new(),
            produced(),
        )
        .unwrap();
        ApprovedOrder::new(
            &candidate,
            qty,
            EntryType::Limit,
            entry,
            1,
            qty as f64 * (entry - sl).abs() + 1.0,
            format!("tag-{symbol}"),
            produced(),
        )
        .unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        sim: Arc<SimBroker>,
        engine: Arc<ExecutionEngine>,
    }

    fn fixture() -> Fixture {
        fixture_with(ExecutionParams {
            entry_wait_secs: 0,
            ..ExecutionParams::default()
        })
    }

    fn fixture_with(params: ExecutionParams) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimBroker::new());
        let ledger = Arc::new(TradeLedger::open(dir.path().join("ledger")).unwrap());
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&sim) as Arc<dyn BrokerPort>,
            ledger,
            audit,
            params,
            None,
        ));
        Fixture {
            _dir: dir,
            sim,
            engine,
        }
    }

    #[tokio::test]
    async fn calm_day_long_full_lifecycle() {
        let f = fixture();
        let sym = "NSE:RELIANCE-EQ";
        // Tape at 99.9 makes the limit buy at 100.0 marketable on placement.
        f.sim.set_price(sym, 99.9);

        // Entry 100.0-100.2, SL 99.0, TP 101.2, qty 500 (per-trade risk 500).
        let order = approved(sym, 100.0, 99.0, 101.2, 500);
        let report = f.engine.execute_batch(&[order], "2026-07-30").await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, "OPEN");

        let trade_id = &report.results[0].trade_id;
        let trade = f.engine.ledger().get(trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.filled_qty, 500);
        assert!(trade.sl_order_id.is_some());
        assert!(trade.tp_order_id.is_some());

        // Tape runs to 101.3: the TP limit (sell at 101.2) fires.
        let mut rx = f.sim.subscribe_orders();
        f.sim.set_price(sym, 101.3);
        while let Ok(update) = rx.try_recv() {
            f.engine.process_update(&update).unwrap();
        }

        let done = f.engine.ledger().get(trade_id).unwrap();
        assert_eq!(done.status, TradeStatus::Closed);
        let pnl = done.realized_pnl.unwrap();
        // (101.2 - 100.0) * 500 = 600 with the limit fill at 100.0.
        assert!((pnl - 600.0).abs() < 1e-6, "unexpected pnl {pnl}");
    }

    #[tokio::test]
    async fn market_entry_books_tp_from_actual_fill() {
        let f = fixture();
        let sym = "NSE:RELIANCE-EQ";
        f.sim.set_price(sym, 100.1);
        f.sim.set_volume(sym, 2_000_000.0);

        let candidate = Candidate::new(
            "c-mkt",
            sym,
            Direction::Long,
            0.8,
            0.8,
            100.0,
            100.2,
            99.0,
            101.2,
            0.5,
            Vec::new(),
            produced(),
        )
        .unwrap();
        let order = ApprovedOrder::new(
            &candidate,
            500,
            EntryType::Market,
            100.0,
            1,
            500.0,
            "t-mkt",
            produced(),
        )
        .unwrap();

        let report = f.engine.execute_batch(&[order], "2026-07-30").await;
        let trade_id = report.results[0].trade_id.clone();
        let trade = f.engine.ledger().get(&trade_id).unwrap();
        assert_eq!(trade.entry_fill_price, Some(100.1));

        let mut rx = f.sim.subscribe_orders();
        f.sim.set_price(sym, 101.3);
        while let Ok(update) = rx.try_recv() {
            f.engine.process_update(&update).unwrap();
        }

        let done = f.engine.ledger().get(&trade_id).unwrap();
        assert_eq!(done.status, TradeStatus::Closed);
        // (101.2 - 100.1) * 500 = 550 off the actual market fill.
        assert!((done.realized_pnl.unwrap() - 550.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn empty_batch_is_ok_with_zero_trades() {
        let f = fixture();
        let report = f.engine.execute_batch(&[], "2026-07-30").await;
        assert!(report.results.is_empty());
        assert!(f.engine.ledger().by_date("2026-07-30").is_empty());
    }

    #[tokio::test]
    async fn zero_fill_expires_the_trade() {
        let f = fixture();
        let sym = "NSE:TCS-EQ";
        f.sim.set_price(sym, 105.0);

        // Limit at 100 never touched inside a zero-second window.
        let order = approved(sym, 100.0, 99.0, 101.2, 100);
        let report = f.engine.execute_batch(&[order], "2026-07-30").await;

        assert_eq!(report.results[0].status, "EXPIRED");
        let trade = f.engine.ledger().get(&report.results[0].trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::Expired);
        assert_eq!(trade.filled_qty, 0);
    }

    #[tokio::test]
    async fn partial_fill_proceeds_on_filled_quantity() {
        let f = fixture();
        let sym = "NSE:HDFCBANK-EQ";
        f.sim.set_price(sym, 100.0);
        f.sim.set_fill_fraction(sym, 0.4);

        let order = approved(sym, 100.0, 99.0, 101.2, 100);
        let report = f.engine.execute_batch(&[order], "2026-07-30").await;

        assert_eq!(report.results[0].status, "OPEN");
        let trade = f.engine.ledger().get(&report.results[0].trade_id).unwrap();
        assert_eq!(trade.filled_qty, 40);
        assert_eq!(trade.remaining_qty, 40);

        // Children cover the filled quantity only.
        let sl = f.sim.order(trade.sl_order_id.as_ref().unwrap()).unwrap();
        assert_eq!(sl.quantity, 40);
    }

    #[tokio::test]
    async fn broker_rejection_marks_one_trade_and_continues() {
        let f = fixture();
        f.sim.set_price("NSE:GOOD-EQ", 100.0);
        f.sim.set_price("NSE:BAD-EQ", 100.0);

        let good = approved("NSE:GOOD-EQ", 100.0, 99.0, 101.2, 10);
        let bad = approved("NSE:BAD-EQ", 100.0, 99.0, 101.2, 10);

        f.sim.fail_next(BrokerError::InvalidSymbol("unknown scrip".to_string()));
        let report = f
            .engine
            .execute_batch(&[bad, good], "2026-07-30")
            .await;

        assert_eq!(report.results[0].status, "REJECTED");
        assert_eq!(report.results[1].status, "OPEN");
    }

    #[tokio::test]
    async fn stop_fill_stops_out_via_update() {
        let f = fixture();
        let sym = "NSE:SBIN-EQ";
        f.sim.set_price(sym, 500.0);

        let order = approved(sym, 500.0, 495.0, 510.0, 100);
        let report = f.engine.execute_batch(&[order], "2026-07-30").await;
        let trade_id = report.results[0].trade_id.clone();

        let mut rx = f.sim.subscribe_orders();
        f.sim.set_price(sym, 494.0);
        while let Ok(update) = rx.try_recv() {
            f.engine.process_update(&update).unwrap();
        }

        let trade = f.engine.ledger().get(&trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::StoppedOut);
        // (495 - 500) * 100 = -500.
        assert!((trade.realized_pnl.unwrap() + 500.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn duplicate_update_is_idempotent() {
        let f = fixture();
        let sym = "NSE:ITC-EQ";
        f.sim.set_price(sym, 400.0);

        let order = approved(sym, 400.0, 396.0, 408.0, 50);
        let report = f.engine.execute_batch(&[order], "2026-07-30").await;
        let trade_id = report.results[0].trade_id.clone();

        let mut rx = f.sim.subscribe_orders();
        f.sim.set_price(sym, 395.0);
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        for update in updates.iter().chain(updates.iter()) {
            f.engine.process_update(update).unwrap();
        }

        let trade = f.engine.ledger().get(&trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::StoppedOut);
        // P&L booked exactly once: (396 - 400) * 50 = -200.
        assert!((trade.realized_pnl.unwrap() + 200.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn monitor_close_walks_closing_to_closed() {
        let f = fixture();
        let sym = "NSE:WIPRO-EQ";
        f.sim.set_price(sym, 250.0);

        let order = approved(sym, 250.0, 247.0, 256.0, 100);
        let report = f.engine.execute_batch(&[order], "2026-07-30").await;
        let trade_id = report.results[0].trade_id.clone();

        f.engine.close_trade(&trade_id, "news_invalidation").await.unwrap();

        let trade = f.engine.ledger().get(&trade_id).unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_reason.as_deref(), Some("news_invalidation"));
        // Journal shows OPEN -> CLOSING -> CLOSED.
        let path: Vec<_> = trade.journal.iter().map(|j| j.to).collect();
        assert!(path.ends_with(&[TradeStatus::Closing, TradeStatus::Closed]));
    }

    #[tokio::test]
    async fn modify_stop_updates_child_and_ledger() {
        let f = fixture();
        let sym = "NSE:LT-EQ";
        f.sim.set_price(sym, 500.0);

        let order = approved(sym, 500.0, 495.0, 510.0, 100);
        let report = f.engine.execute_batch(&[order], "2026-07-30").await;
        let trade_id = report.results[0].trade_id.clone();

        f.engine.modify_stop(&trade_id, 500.0, "trail to breakeven").await.unwrap();

        let trade = f.engine.ledger().get(&trade_id).unwrap();
        assert_eq!(trade.current_stop, 500.0);
        let sl = f.sim.order(trade.sl_order_id.as_ref().unwrap()).unwrap();
        assert_eq!(sl.trigger_price, Some(500.0));
        assert!(!trade.notes.is_empty());
    }

    #[tokio::test]
    async fn partial_exit_books_pnl_and_shrinks_children() {
        let f = fixture();
        let sym = "NSE:MARUTI-EQ";
        f.sim.set_price(sym, 100.0);

        let order = approved(sym, 100.0, 99.0, 102.0, 100);
        let report = f.engine.execute_batch(&[order], "2026-07-30").await;
        let trade_id = report.results[0].trade_id.clone();

        f.sim.set_price(sym, 101.0);
        // After the move the TP has not fired (limit 102), book half.
        f.engine.partial_exit(&trade_id, 50, "2R harvest").await.unwrap();

        let trade = f.engine.ledger().get(&trade_id).unwrap();
        assert_eq!(trade.remaining_qty, 50);
        // (101 - 100) * 50 = 50 booked.
        assert!((trade.realized_pnl.unwrap() - 50.0).abs() < 1e-6);
        let sl = f.sim.order(trade.sl_order_id.as_ref().unwrap()).unwrap();
        assert_eq!(sl.quantity, 50);
    }
}
