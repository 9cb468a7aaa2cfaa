// =============================================================================
// Simulated Broker — deterministic in-process brokerage for paper mode & tests
// =============================================================================
//
// A scriptable tape drives fills: `set_price` moves the market, which
// evaluates resting limit orders and bracket children exactly once per move.
// Order ids are sequential, iteration order is sorted, and duplicate
// `client_tag`s return the original id, so two identical scripts produce
// identical order flow.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broker::{
    BrokerError, BrokerOrder, BrokerOrderStatus, BrokerPort, BrokerPosition, Depth, DepthLevel,
    FundsSnapshot, Holding, MarginRequirement, OptionChain, OrderChanges, OrderIntent,
    OrderUpdate, Profile, Quote, Tick, TradebookEntry,
};
use crate::types::{Candle, EntryType, Resolution, Side};

struct SimState {
    prices: HashMap<String, f64>,
    volumes: HashMap<String, f64>,
    histories: HashMap<String, Vec<Candle>>,
    orders: BTreeMap<String, BrokerOrder>,
    tag_index: HashMap<String, String>,
    positions: BTreeMap<String, BrokerPosition>,
    tradebook: Vec<TradebookEntry>,
    next_id: u64,
    /// Scripted fraction of the requested quantity that fills, per symbol.
    fill_fraction: HashMap<String, f64>,
    /// One-shot scripted failure for the next fallible call.
    fail_next: Option<BrokerError>,
    funds: FundsSnapshot,
}

/// In-process simulated brokerage.
pub struct SimBroker {
    state: Mutex<SimState>,
    order_subscribers: Mutex<Vec<mpsc::UnboundedSender<OrderUpdate>>>,
    market_subscribers: Mutex<Vec<(Vec<String>, mpsc::UnboundedSender<Tick>)>>,
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                prices: HashMap::new(),
                volumes: HashMap::new(),
                histories: HashMap::new(),
                orders: BTreeMap::new(),
                tag_index: HashMap::new(),
                positions: BTreeMap::new(),
                tradebook: Vec::new(),
                next_id: 1,
                fill_fraction: HashMap::new(),
                fail_next: None,
                funds: FundsSnapshot {
                    available: 1_000_000.0,
                    utilized: 0.0,
                },
            }),
            order_subscribers: Mutex::new(Vec::new()),
            market_subscribers: Mutex::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Scripting surface (tests and paper mode)
    // -------------------------------------------------------------------------

    /// Move the tape: set the last price for `symbol` and evaluate every
    /// resting order against it.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let updates = {
            let mut s = self.state.lock();
            s.prices.insert(symbol.to_string(), price);
            self.evaluate_orders(&mut s, symbol, price)
        };
        for u in updates {
            self.emit_order_update(u);
        }
        self.emit_tick(symbol, price);
    }

    /// Script the daily traded volume reported in quotes for `symbol`.
    pub fn set_volume(&self, symbol: &str, volume: f64) {
        self.state.lock().volumes.insert(symbol.to_string(), volume);
    }

    /// Script the candle history served for `symbol`.
    pub fn set_history(&self, symbol: &str, candles: Vec<Candle>) {
        self.state
            .lock()
            .histories
            .insert(symbol.to_string(), candles);
    }

    /// Script a partial fill: the next entry orders for `symbol` fill only
    /// `fraction` of the requested quantity.
    pub fn set_fill_fraction(&self, symbol: &str, fraction: f64) {
        self.state
            .lock()
            .fill_fraction
            .insert(symbol.to_string(), fraction.clamp(0.0, 1.0));
    }

    /// Script the next fallible call to fail with `err`.
    pub fn fail_next(&self, err: BrokerError) {
        self.state.lock().fail_next = Some(err);
    }

    /// Snapshot of one order (test inspection).
    pub fn order(&self, order_id: &str) -> Option<BrokerOrder> {
        self.state.lock().orders.get(order_id).cloned()
    }

    /// All orders, sorted by id (test inspection).
    pub fn all_orders(&self) -> Vec<BrokerOrder> {
        self.state.lock().orders.values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn take_scripted_failure(&self) -> Result<(), BrokerError> {
        if let Some(err) = self.state.lock().fail_next.take() {
            return Err(err);
        }
        Ok(())
    }

    fn emit_order_update(&self, update: OrderUpdate) {
        let mut subs = self.order_subscribers.lock();
        subs.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn emit_tick(&self, symbol: &str, price: f64) {
        let tick = Tick {
            symbol: symbol.to_string(),
            last_price: price,
            at: Utc::now(),
        };
        let mut subs = self.market_subscribers.lock();
        subs.retain(|(symbols, tx)| {
            if symbols.iter().any(|s| s == symbol) {
                tx.send(tick.clone()).is_ok()
            } else {
                true
            }
        });
    }

    fn update_for(order: &BrokerOrder) -> OrderUpdate {
        OrderUpdate {
            order_id: order.order_id.clone(),
            client_tag: order.client_tag.clone(),
            symbol: order.symbol.clone(),
            status: order.status,
            filled_qty: order.filled_qty,
            avg_fill_price: order.avg_fill_price,
            at: Utc::now(),
        }
    }

    fn apply_fill(s: &mut SimState, order_id: &str, qty: u32, price: f64) -> OrderUpdate {
        let order = s.orders.get_mut(order_id).expect("order exists");
        order.filled_qty = (order.filled_qty + qty).min(order.quantity);
        order.avg_fill_price = price;
        order.status = if order.filled_qty == order.quantity {
            BrokerOrderStatus::Filled
        } else {
            BrokerOrderStatus::PartiallyFilled
        };

        let signed = match order.side {
            Side::Buy => qty as i64,
            Side::Sell => -(qty as i64),
        };
        let pos = s
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| BrokerPosition {
                symbol: order.symbol.clone(),
                net_qty: 0,
                avg_price: 0.0,
                realized_pnl: 0.0,
            });
        pos.net_qty += signed;
        pos.avg_price = price;

        s.tradebook.push(TradebookEntry {
            order_id: order_id.to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: qty,
            price,
            traded_at: Utc::now(),
        });

        debug!(
            order_id,
            qty,
            price,
            status = %order.status,
            "sim fill applied"
        );
        Self::update_for(order)
    }

    /// Whether a resting order is executable at `price`.
    ///
    /// Plain limits fill when the tape crosses the limit price.  Orders with
    /// a trigger price behave as stops: they fire when the tape crosses the
    /// trigger against the position.
    fn is_executable(order: &BrokerOrder, price: f64) -> Option<f64> {
        if order.status != BrokerOrderStatus::Accepted
            && order.status != BrokerOrderStatus::PartiallyFilled
        {
            return None;
        }

        if let Some(trigger) = order.trigger_price {
            let fired = match order.side {
                Side::Sell => price <= trigger,
                Side::Buy => price >= trigger,
            };
            return fired.then_some(trigger);
        }

        if let Some(limit) = order.price {
            let fired = match order.side {
                Side::Buy => price <= limit,
                Side::Sell => price >= limit,
            };
            return fired.then_some(limit);
        }

        // Market order with no script price: fill at the tape.
        Some(price)
    }

    fn evaluate_orders(&self, s: &mut SimState, symbol: &str, price: f64) -> Vec<OrderUpdate> {
        let ids: Vec<String> = s
            .orders
            .iter()
            .filter(|(_, o)| o.symbol == symbol)
            .map(|(id, _)| id.clone())
            .collect();

        let mut updates = Vec::new();
        for id in ids {
            let (exec_price, remaining) = {
                let order = &s.orders[&id];
                match Self::is_executable(order, price) {
                    Some(p) => (p, order.quantity - order.filled_qty),
                    None => continue,
                }
            };
            if remaining > 0 {
                updates.push(Self::apply_fill(s, &id, remaining, exec_price));
            }
        }
        updates
    }
}

#[async_trait]
impl BrokerPort for SimBroker {
    async fn get_profile(&self) -> Result<Profile, BrokerError> {
        self.take_scripted_failure()?;
        Ok(Profile {
            user_id: "SIM0001".to_string(),
            name: "Simulated Account".to_string(),
        })
    }

    async fn get_quote(&self, symbols: &[String]) -> Result<Vec<Quote>, BrokerError> {
        self.take_scripted_failure()?;
        let s = self.state.lock();
        Ok(symbols
            .iter()
            .filter_map(|sym| {
                s.prices.get(sym).map(|&price| Quote {
                    symbol: sym.clone(),
                    last_price: price,
                    change_pct: 0.0,
                    volume: s.volumes.get(sym).copied().unwrap_or(1_000_000.0),
                    bid: price - 0.05,
                    ask: price + 0.05,
                })
            })
            .collect())
    }

    async fn get_depth(&self, symbol: &str) -> Result<Depth, BrokerError> {
        self.take_scripted_failure()?;
        let s = self.state.lock();
        let price = *s
            .prices
            .get(symbol)
            .ok_or_else(|| BrokerError::InvalidSymbol(symbol.to_string()))?;
        let level = |p: f64| DepthLevel {
            price: p,
            quantity: 1_000,
            orders: 10,
        };
        Ok(Depth {
            symbol: symbol.to_string(),
            bids: (1..=5).map(|i| level(price - 0.05 * i as f64)).collect(),
            asks: (1..=5).map(|i| level(price + 0.05 * i as f64)).collect(),
            open: price,
            high: price,
            low: price,
            close: price,
            upper_circuit: price * 1.1,
            lower_circuit: price * 0.9,
        })
    }

    async fn get_history(
        &self,
        symbol: &str,
        _resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.take_scripted_failure()?;
        let s = self.state.lock();
        let candles = s.histories.get(symbol).cloned().unwrap_or_default();
        Ok(candles
            .into_iter()
            .filter(|c| c.ts >= from.timestamp() && c.ts <= to.timestamp())
            .collect())
    }

    async fn get_option_chain(
        &self,
        symbol: &str,
        _strike_count: u32,
    ) -> Result<OptionChain, BrokerError> {
        self.take_scripted_failure()?;
        let s = self.state.lock();
        let spot = s.prices.get(symbol).copied().unwrap_or(0.0);
        Ok(OptionChain {
            symbol: symbol.to_string(),
            spot,
            strikes: Vec::new(),
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.take_scripted_failure()?;
        Ok(self.state.lock().positions.values().cloned().collect())
    }

    async fn get_holdings(&self) -> Result<Vec<Holding>, BrokerError> {
        self.take_scripted_failure()?;
        Ok(Vec::new())
    }

    async fn get_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        self.take_scripted_failure()?;
        Ok(self.all_orders())
    }

    async fn get_tradebook(&self) -> Result<Vec<TradebookEntry>, BrokerError> {
        self.take_scripted_failure()?;
        Ok(self.state.lock().tradebook.clone())
    }

    async fn get_funds(&self) -> Result<FundsSnapshot, BrokerError> {
        self.take_scripted_failure()?;
        Ok(self.state.lock().funds.clone())
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<String, BrokerError> {
        self.take_scripted_failure()?;

        let (order_id, immediate) = {
            let mut s = self.state.lock();

            // Idempotency: identical client_tag returns the original id.
            if let Some(existing) = s.tag_index.get(&intent.client_tag) {
                info!(client_tag = %intent.client_tag, order_id = %existing, "duplicate tag — no-op");
                return Ok(existing.clone());
            }

            let order_id = format!("SIM-{:06}", s.next_id);
            s.next_id += 1;

            let order = BrokerOrder {
                order_id: order_id.clone(),
                client_tag: intent.client_tag.clone(),
                symbol: intent.symbol.clone(),
                side: intent.side,
                order_type: intent.order_type,
                price: intent.limit_price,
                trigger_price: intent.trigger_price,
                quantity: intent.quantity,
                filled_qty: 0,
                avg_fill_price: 0.0,
                status: BrokerOrderStatus::Accepted,
                parent_id: intent.parent_id.clone(),
                message: None,
            };
            s.orders.insert(order_id.clone(), order);
            s.tag_index
                .insert(intent.client_tag.clone(), order_id.clone());

            // Entry orders may fill immediately against the current tape.
            // Bracket children rest until the tape crosses them.
            let mut updates = Vec::new();
            if intent.parent_id.is_none() {
                if let Some(&price) = s.prices.get(&intent.symbol) {
                    let exec_price = match intent.order_type {
                        EntryType::Market => Some(price),
                        EntryType::Limit => {
                            Self::is_executable(&s.orders[&order_id], price)
                        }
                    };
                    if let Some(p) = exec_price {
                        let fraction = s
                            .fill_fraction
                            .get(&intent.symbol)
                            .copied()
                            .unwrap_or(1.0);
                        let qty = ((intent.quantity as f64) * fraction).round() as u32;
                        if qty > 0 {
                            updates.push(Self::apply_fill(&mut s, &order_id, qty, p));
                        }
                    }
                }
            }
            (order_id, updates)
        };

        for u in immediate {
            self.emit_order_update(u);
        }
        Ok(order_id)
    }

    async fn modify_order(
        &self,
        order_id: &str,
        changes: &OrderChanges,
    ) -> Result<(), BrokerError> {
        self.take_scripted_failure()?;
        let mut s = self.state.lock();
        let order = s
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::Rejected {
                code: -20,
                message: format!("unknown order {order_id}"),
            })?;
        if let Some(q) = changes.quantity {
            order.quantity = q;
        }
        if let Some(p) = changes.limit_price {
            order.price = Some(p);
        }
        if let Some(t) = changes.trigger_price {
            order.trigger_price = Some(t);
        }
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.take_scripted_failure()?;
        let update = {
            let mut s = self.state.lock();
            let order = s
                .orders
                .get_mut(order_id)
                .ok_or_else(|| BrokerError::Rejected {
                    code: -20,
                    message: format!("unknown order {order_id}"),
                })?;
            order.status = BrokerOrderStatus::Cancelled;
            Self::update_for(order)
        };
        self.emit_order_update(update);
        Ok(())
    }

    async fn place_bracket_child(
        &self,
        parent_id: &str,
        side: Side,
        order_type: EntryType,
        price: f64,
        quantity: u32,
        client_tag: &str,
    ) -> Result<String, BrokerError> {
        let symbol = {
            let s = self.state.lock();
            s.orders
                .get(parent_id)
                .map(|o| o.symbol.clone())
                .ok_or_else(|| BrokerError::Rejected {
                    code: -21,
                    message: format!("unknown parent {parent_id}"),
                })?
        };
        let intent = OrderIntent {
            client_tag: client_tag.to_string(),
            symbol,
            side,
            order_type,
            quantity,
            limit_price: (order_type == EntryType::Limit).then_some(price),
            trigger_price: (order_type == EntryType::Market).then_some(price),
            product_type: crate::types::ProductType::Intraday,
            parent_id: Some(parent_id.to_string()),
        };
        self.place_order(&intent).await
    }

    async fn calc_margin(&self, intents: &[OrderIntent]) -> Result<MarginRequirement, BrokerError> {
        let s = self.state.lock();
        let required: f64 = intents
            .iter()
            .map(|i| {
                let price = i
                    .limit_price
                    .or_else(|| s.prices.get(&i.symbol).copied())
                    .unwrap_or(0.0);
                price * i.quantity as f64 * 0.2 // 5x intraday leverage
            })
            .sum();
        Ok(MarginRequirement {
            required,
            available: s.funds.available,
        })
    }

    fn subscribe_orders(&self) -> mpsc::UnboundedReceiver<OrderUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.order_subscribers.lock().push(tx);
        rx
    }

    fn subscribe_market(&self, symbols: &[String]) -> mpsc::UnboundedReceiver<Tick> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.market_subscribers
            .lock()
            .push((symbols.to_vec(), tx));
        rx
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProductType;

    fn intent(tag: &str, symbol: &str, side: Side, qty: u32, limit: Option<f64>) -> OrderIntent {
        OrderIntent {
            client_tag: tag.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: if limit.is_some() {
                EntryType::Limit
            } else {
                EntryType::Market
            },
            quantity: qty,
            limit_price: limit,
            trigger_price: None,
            product_type: ProductType::Intraday,
            parent_id: None,
        }
    }

    #[tokio::test]
    async fn market_order_fills_at_tape() {
        let sim = SimBroker::new();
        sim.set_price("NSE:RELIANCE-EQ", 100.0);

        let id = sim
            .place_order(&intent("t1", "NSE:RELIANCE-EQ", Side::Buy, 10, None))
            .await
            .unwrap();

        let order = sim.order(&id).unwrap();
        assert_eq!(order.status, BrokerOrderStatus::Filled);
        assert_eq!(order.filled_qty, 10);
        assert_eq!(order.avg_fill_price, 100.0);
    }

    #[tokio::test]
    async fn duplicate_client_tag_is_noop() {
        let sim = SimBroker::new();
        sim.set_price("NSE:INFY-EQ", 50.0);

        let a = sim
            .place_order(&intent("dup", "NSE:INFY-EQ", Side::Buy, 5, None))
            .await
            .unwrap();
        let b = sim
            .place_order(&intent("dup", "NSE:INFY-EQ", Side::Buy, 5, None))
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(sim.all_orders().len(), 1);
    }

    #[tokio::test]
    async fn limit_order_rests_until_crossed() {
        let sim = SimBroker::new();
        sim.set_price("NSE:TCS-EQ", 105.0);

        let id = sim
            .place_order(&intent("t2", "NSE:TCS-EQ", Side::Buy, 10, Some(100.0)))
            .await
            .unwrap();
        assert_eq!(sim.order(&id).unwrap().status, BrokerOrderStatus::Accepted);

        sim.set_price("NSE:TCS-EQ", 99.5);
        let order = sim.order(&id).unwrap();
        assert_eq!(order.status, BrokerOrderStatus::Filled);
        assert_eq!(order.avg_fill_price, 100.0);
    }

    #[tokio::test]
    async fn stop_child_fires_on_retrace() {
        let sim = SimBroker::new();
        sim.set_price("NSE:SBIN-EQ", 500.0);

        let entry = sim
            .place_order(&intent("e", "NSE:SBIN-EQ", Side::Buy, 100, None))
            .await
            .unwrap();

        // Sell-stop at 495: fires when price <= 495.
        let sl = sim
            .place_bracket_child(&entry, Side::Sell, EntryType::Market, 495.0, 100, "sl")
            .await
            .unwrap();

        sim.set_price("NSE:SBIN-EQ", 498.0);
        assert_eq!(sim.order(&sl).unwrap().status, BrokerOrderStatus::Accepted);

        sim.set_price("NSE:SBIN-EQ", 494.0);
        let child = sim.order(&sl).unwrap();
        assert_eq!(child.status, BrokerOrderStatus::Filled);
        assert_eq!(child.avg_fill_price, 495.0);
    }

    #[tokio::test]
    async fn partial_fill_fraction_respected() {
        let sim = SimBroker::new();
        sim.set_price("NSE:HDFCBANK-EQ", 200.0);
        sim.set_fill_fraction("NSE:HDFCBANK-EQ", 0.4);

        let id = sim
            .place_order(&intent("p", "NSE:HDFCBANK-EQ", Side::Buy, 100, None))
            .await
            .unwrap();

        let order = sim.order(&id).unwrap();
        assert_eq!(order.status, BrokerOrderStatus::PartiallyFilled);
        assert_eq!(order.filled_qty, 40);
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let sim = SimBroker::new();
        sim.fail_next(BrokerError::AuthExpired);
        assert_eq!(sim.get_profile().await.unwrap_err(), BrokerError::AuthExpired);
        assert!(sim.get_profile().await.is_ok());
    }

    #[tokio::test]
    async fn order_updates_are_pushed() {
        let sim = SimBroker::new();
        let mut rx = sim.subscribe_orders();
        sim.set_price("NSE:ITC-EQ", 400.0);

        sim.place_order(&intent("u", "NSE:ITC-EQ", Side::Buy, 10, None))
            .await
            .unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.status, BrokerOrderStatus::Filled);
        assert_eq!(update.filled_qty, 10);
    }
}
