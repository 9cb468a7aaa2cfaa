// =============================================================================
// Reconciliation — compare the ledger against broker truth and correct drift
// =============================================================================
//
// Runs after restart and on the monitor cadence.  When the local trade state
// and the broker disagree, the broker wins: the trade is corrected through
// its normal state transitions and an audit entry is appended.  No error is
// surfaced for a divergence; it is expected operational reality after a
// crash or missed order update.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditKind, AuditLog};
use crate::broker::{BrokerOrder, BrokerOrderStatus, BrokerPort};
use crate::execution::ExecutionEngine;
use crate::ledger::{TradeLedger, TradeStatus};

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub trades_checked: u32,
    pub corrections: u32,
}

/// Run one reconciliation cycle over the live trades of `session_id`.
pub async fn reconcile_once(
    broker: &Arc<dyn BrokerPort>,
    ledger: &Arc<TradeLedger>,
    engine: &Arc<ExecutionEngine>,
    audit: &Arc<AuditLog>,
    session_id: &str,
) -> Result<ReconcileResult> {
    let broker_orders: HashMap<String, BrokerOrder> = broker
        .get_orders()
        .await
        .map_err(|e| anyhow::anyhow!("reconcile: order fetch failed: {e}"))?
        .into_iter()
        .map(|o| (o.order_id.clone(), o))
        .collect();

    let live = ledger.live_trades(session_id);
    let mut corrections = 0u32;

    for trade in &live {
        let trade_id = &trade.trade_id;

        match trade.status {
            TradeStatus::Working => {
                let Some(entry_id) = trade.entry_order_id.as_deref() else {
                    continue;
                };
                match broker_orders.get(entry_id) {
                    Some(entry) if entry.status == BrokerOrderStatus::Filled => {
                        // We missed the fill: bring the trade to OPEN.
                        warn!(trade_id, "broker shows entry filled while ledger says WORKING");
                        ledger.update(trade_id, |t| {
                            t.filled_qty = entry.filled_qty;
                            t.remaining_qty = entry.filled_qty;
                            t.entry_fill_price = Some(entry.avg_fill_price);
                            t.entry_time = Some(chrono::Utc::now());
                        })?;
                        ledger.transition(
                            trade_id,
                            TradeStatus::Open,
                            "reconcile: broker shows entry filled",
                        )?;
                        record_correction(audit, trade_id, "WORKING -> OPEN (entry filled)");
                        corrections += 1;
                    }
                    Some(entry)
                        if matches!(
                            entry.status,
                            BrokerOrderStatus::Cancelled | BrokerOrderStatus::Rejected
                        ) =>
                    {
                        let to = if entry.status == BrokerOrderStatus::Rejected {
                            TradeStatus::Rejected
                        } else {
                            TradeStatus::Expired
                        };
                        ledger.transition(
                            trade_id,
                            to,
                            format!("reconcile: broker shows entry {}", entry.status),
                        )?;
                        record_correction(audit, trade_id, "WORKING -> terminal (entry gone)");
                        corrections += 1;
                    }
                    Some(_) => {}
                    None => {
                        debug!(trade_id, "entry order unknown to broker — leaving for operator");
                    }
                }
            }
            TradeStatus::Open | TradeStatus::Closing => {
                // An exit child may have filled while we were away.
                let sl_fill = trade
                    .sl_order_id
                    .as_deref()
                    .and_then(|id| broker_orders.get(id))
                    .filter(|o| o.status == BrokerOrderStatus::Filled);
                let tp_fill = trade
                    .tp_order_id
                    .as_deref()
                    .and_then(|id| broker_orders.get(id))
                    .filter(|o| o.status == BrokerOrderStatus::Filled);

                if let Some(sl) = sl_fill {
                    engine.finalize_exit(
                        trade_id,
                        sl.avg_fill_price,
                        "reconcile: stop-loss filled at broker",
                        TradeStatus::StoppedOut,
                    )?;
                    record_correction(audit, trade_id, "exit corrected to STOPPED_OUT");
                    corrections += 1;
                } else if trade.status == TradeStatus::Open && tp_fill.is_none() {
                    // A bracket child lost while the position is on gets
                    // re-placed; the stop must never be absent from an open
                    // trade.
                    corrections +=
                        restore_lost_children(broker, ledger, audit, trade, &broker_orders).await;
                }

                if let (None, Some(tp)) = (sl_fill, tp_fill) {
                    if trade.status == TradeStatus::Open {
                        ledger.transition(
                            trade_id,
                            TradeStatus::Closing,
                            "reconcile: take-profit filled at broker",
                        )?;
                    }
                    engine.finalize_exit(
                        trade_id,
                        tp.avg_fill_price,
                        "reconcile: take-profit filled at broker",
                        TradeStatus::Closed,
                    )?;
                    record_correction(audit, trade_id, "exit corrected to CLOSED");
                    corrections += 1;
                }
            }
            _ => {}
        }
    }

    // Net-quantity cross-check against broker positions.  A mismatch after
    // the order-level corrections has an ambiguous cause (manual trade, fee
    // adjustment), so it is recorded for the operator rather than auto-fixed.
    if let Ok(positions) = broker.get_positions().await {
        let broker_net: HashMap<String, i64> = positions
            .into_iter()
            .map(|p| (p.symbol, p.net_qty))
            .collect();
        let mut ledger_net: HashMap<String, i64> = HashMap::new();
        for trade in ledger.live_trades(session_id) {
            let signed = trade.remaining_qty as i64
                * if trade.order.direction == crate::types::Direction::Long {
                    1
                } else {
                    -1
                };
            *ledger_net.entry(trade.order.symbol.clone()).or_insert(0) += signed;
        }
        for (symbol, &ledger_qty) in &ledger_net {
            let broker_qty = broker_net.get(symbol).copied().unwrap_or(0);
            if broker_qty != ledger_qty {
                warn!(
                    symbol = %symbol,
                    ledger_qty,
                    broker_qty,
                    "net position mismatch against broker"
                );
                audit.record(
                    AuditKind::TradeCorrection,
                    format!("net position mismatch on {symbol}"),
                    json!({ "ledger": ledger_qty, "broker": broker_qty }),
                );
            }
        }
    }

    let result = ReconcileResult {
        trades_checked: live.len() as u32,
        corrections,
    };
    info!(
        session_id,
        checked = result.trades_checked,
        corrections = result.corrections,
        "reconciliation cycle complete"
    );
    Ok(result)
}

fn record_correction(audit: &AuditLog, trade_id: &str, what: &str) {
    audit.record(
        AuditKind::ReconcileCorrection,
        format!("trade {trade_id}: {what}"),
        json!({ "trade_id": trade_id }),
    );
}

/// Re-place any SL/TP child the broker shows as cancelled while the trade
/// is still open.  Returns the number of children restored.
async fn restore_lost_children(
    broker: &Arc<dyn BrokerPort>,
    ledger: &Arc<TradeLedger>,
    audit: &Arc<AuditLog>,
    trade: &crate::ledger::Trade,
    broker_orders: &HashMap<String, BrokerOrder>,
) -> u32 {
    let Some(entry_id) = trade.entry_order_id.as_deref() else {
        return 0;
    };
    let exit_side = trade.order.direction.exit_side();
    let mut restored = 0;

    let children = [
        (
            "sl",
            trade.sl_order_id.as_deref(),
            trade.current_stop,
            crate::types::EntryType::Market,
        ),
        (
            "tp",
            trade.tp_order_id.as_deref(),
            trade.order.take_profit,
            crate::types::EntryType::Limit,
        ),
    ];

    for (which, child_id, price, order_type) in children {
        let lost = child_id
            .and_then(|id| broker_orders.get(id))
            .map(|o| o.status == BrokerOrderStatus::Cancelled)
            .unwrap_or(false);
        if !lost {
            continue;
        }

        let tag = format!("{}:{which}-restore", trade.trade_id);
        match broker
            .place_bracket_child(
                entry_id,
                exit_side,
                order_type,
                price,
                trade.remaining_qty,
                &tag,
            )
            .await
        {
            Ok(new_id) => {
                let set_sl = which == "sl";
                let update = ledger.update(&trade.trade_id, |t| {
                    if set_sl {
                        t.sl_order_id = Some(new_id.clone());
                    } else {
                        t.tp_order_id = Some(new_id.clone());
                    }
                });
                if update.is_ok() {
                    record_correction(audit, &trade.trade_id, "lost bracket child re-placed");
                    restored += 1;
                }
            }
            Err(e) => {
                warn!(
                    trade_id = %trade.trade_id,
                    which,
                    error = %e,
                    "failed to re-place lost bracket child"
                );
            }
        }
    }
    restored
}
