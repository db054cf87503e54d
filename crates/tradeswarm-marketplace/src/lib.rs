//! TradeSwarm Marketplace - matching and negotiation engine
//!
//! The marketplace maintains a live order book of buy/sell bids, matches
//! compatible opposite-side bids at submission time, runs bilateral
//! offer/counter-offer negotiations to price convergence, and periodically
//! sweeps expired state.
//!
//! # Concurrency
//!
//! The bid book, match table and negotiation table are shared mutable state
//! accessed by many agents concurrently. Every mutating operation (insert
//! bid, remove matched bids, append offer, expiry sweep) runs as one
//! write-lock critical section, so two callers can never both consume the
//! same resting bid and two offers can never lose an update. Persistence
//! I/O happens strictly outside those locks, best-effort and bounded by a
//! timeout.
//!
//! # Example
//!
//! ```ignore
//! use tradeswarm_marketplace::{Marketplace, MarketplaceConfig, FlatRateEstimator};
//!
//! let market = Marketplace::new(config, estimator, cache);
//!
//! let submission = market.submit_bid(draft).await?;
//! for m in submission.matches {
//!     println!("matched {} @ {}", m.agreed_quantity, m.agreed_price);
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tradeswarm_bus::PersistenceCache;
use tradeswarm_types::{
    AgentId, AgreedTerms, BidDraft, BidId, BidSide, CoreEvent, MarketBid, MarketMatch, MatchId,
    MatchStatus, Negotiation, NegotiationId, NegotiationOffer, NegotiationStatus,
    NegotiationSubject, StoreId,
};

/// Buffered events before a lagging observer starts dropping
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

/// Marketplace configuration.
///
/// The convergence tolerance and the cadences are business thresholds
/// inherited from the source system; they are configuration, not constants.
#[derive(Debug, Clone)]
pub struct MarketplaceConfig {
    /// Relative price tolerance under which a counter-offer is accepted
    pub convergence_tolerance: Decimal,
    /// How long a negotiation stays open
    pub negotiation_ttl: Duration,
    /// Period of the expiry sweep
    pub clearing_interval: Duration,
    /// Upper bound on any single persistence write
    pub persist_timeout: Duration,
    /// Snapshot window for persisted matches
    pub match_snapshot_ttl: Duration,
    /// Active-bid count at which activity reads as "high"
    pub high_activity_bid_count: usize,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            convergence_tolerance: Decimal::new(5, 2), // 0.05
            negotiation_ttl: Duration::from_secs(30 * 60),
            clearing_interval: Duration::from_secs(60),
            persist_timeout: Duration::from_secs(3),
            match_snapshot_ttl: Duration::from_secs(60 * 60),
            high_activity_bid_count: 10,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from marketplace operations
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("invalid bid: {0}")]
    InvalidBid(String),

    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    #[error("negotiation not found: {0}")]
    NegotiationNotFound(NegotiationId),

    #[error("negotiation {id} is {status:?}, offers are no longer accepted")]
    NegotiationClosed {
        id: NegotiationId,
        status: NegotiationStatus,
    },

    #[error("agent {agent_id} is not a participant in negotiation {id}")]
    NotAParticipant { id: NegotiationId, agent_id: AgentId },

    #[error("match not found: {0}")]
    MatchNotFound(MatchId),
}

pub type MarketResult<T> = Result<T, MarketError>;

// ============================================================================
// Transport cost estimation
// ============================================================================

/// Pluggable transport/logistics cost model.
///
/// Real costing is out of scope; the core only needs a number to gate
/// opportunities and price matches.
pub trait TransportCostEstimator: Send + Sync {
    fn estimate(&self, from: Option<&StoreId>, to: Option<&StoreId>, quantity: u64) -> Decimal;
}

/// Per-unit flat rate, route-independent
pub struct FlatRateEstimator {
    pub rate_per_unit: Decimal,
}

impl FlatRateEstimator {
    pub fn new(rate_per_unit: Decimal) -> Self {
        Self { rate_per_unit }
    }
}

impl TransportCostEstimator for FlatRateEstimator {
    fn estimate(&self, _from: Option<&StoreId>, _to: Option<&StoreId>, quantity: u64) -> Decimal {
        self.rate_per_unit * Decimal::from(quantity)
    }
}

/// Fixed cost per transfer, independent of quantity and route
pub struct FixedCostEstimator {
    pub cost: Decimal,
}

impl FixedCostEstimator {
    pub fn new(cost: Decimal) -> Self {
        Self { cost }
    }
}

impl TransportCostEstimator for FixedCostEstimator {
    fn estimate(&self, _from: Option<&StoreId>, _to: Option<&StoreId>, _quantity: u64) -> Decimal {
        self.cost
    }
}

// ============================================================================
// Results & summaries
// ============================================================================

/// Outcome of a bid submission
#[derive(Debug, Clone)]
pub struct BidSubmission {
    /// The bid as accepted (id and timestamp assigned)
    pub bid: MarketBid,
    /// Matches created against the book at submission time
    pub matches: Vec<MarketMatch>,
}

/// Outcome of a counter-offer
#[derive(Debug, Clone)]
pub enum CounterOutcome {
    /// Offers converged; the negotiation is settled on these terms
    Agreed(AgreedTerms),
    /// The negotiation stays open awaiting further offers
    Countered { offers: usize },
}

/// Draft of one negotiation offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferDraft {
    pub price_offer: Decimal,
    #[serde(default)]
    pub conditions: serde_json::Value,
}

/// What an expiry sweep removed
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub expired_bids: Vec<BidId>,
    pub expired_negotiations: Vec<NegotiationId>,
}

/// Aggregate marketplace statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketStats {
    /// Transfers executed through completed negotiations
    pub total_transfers: u64,
    /// Units moved through completed negotiations
    pub total_volume: u64,
    /// Sum of final prices of completed negotiations
    pub total_profit: Decimal,
    /// Mean milliseconds from bid submission to match creation
    pub avg_time_to_match_ms: f64,
    /// Completed matches over all matches
    pub success_rate: f64,
    /// Bids expired without matching, lifetime
    pub total_bids_expired: u64,
}

/// Snapshot of current market liveliness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketActivity {
    pub active_bids: usize,
    pub recent_matches: usize,
    pub market_activity: String,
}

// ============================================================================
// Marketplace
// ============================================================================

/// The order book and negotiation engine
pub struct Marketplace {
    config: MarketplaceConfig,
    book: RwLock<HashMap<BidId, MarketBid>>,
    matches: RwLock<HashMap<MatchId, MarketMatch>>,
    negotiations: RwLock<HashMap<NegotiationId, Negotiation>>,
    stats: RwLock<MarketStats>,
    estimator: Arc<dyn TransportCostEstimator>,
    cache: Arc<dyn PersistenceCache>,
    events: broadcast::Sender<CoreEvent>,
    clearing_stop: AsyncMutex<Option<oneshot::Sender<()>>>,
    clearing_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Marketplace {
    pub fn new(
        config: MarketplaceConfig,
        estimator: Arc<dyn TransportCostEstimator>,
        cache: Arc<dyn PersistenceCache>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            book: RwLock::new(HashMap::new()),
            matches: RwLock::new(HashMap::new()),
            negotiations: RwLock::new(HashMap::new()),
            stats: RwLock::new(MarketStats::default()),
            estimator,
            cache,
            events,
            clearing_stop: AsyncMutex::new(None),
            clearing_task: AsyncMutex::new(None),
        }
    }

    /// Subscribe to marketplace events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Bid submission & matching
    // ========================================================================

    /// Submit a bid: validate, enter the book, then match against the book
    /// as it stands at this moment.
    pub async fn submit_bid(&self, draft: BidDraft) -> MarketResult<BidSubmission> {
        Self::validate_draft(&draft)?;

        let bid = MarketBid {
            id: BidId::new(),
            agent_id: draft.agent_id,
            product_id: draft.product_id,
            side: draft.side,
            quantity: draft.quantity,
            price_per_unit: draft.price_per_unit,
            from_store: draft.from_store,
            to_store: draft.to_store,
            urgency: draft.urgency,
            valid_until: draft.valid_until,
            conditions: draft.conditions,
            metadata: draft.metadata,
            submitted_at: Utc::now(),
        };
        let accepted = bid.clone();

        // Insert and match inside one critical section: the new bid sees a
        // consistent book and a resting bid can only be consumed once.
        let matches = {
            let mut book = self.book.write();
            book.insert(bid.id, bid);
            self.match_bid(&mut book, accepted.id)
        };

        info!(
            bid_id = %accepted.id,
            agent_id = %accepted.agent_id,
            product_id = %accepted.product_id,
            side = %accepted.side,
            quantity = accepted.quantity,
            price = %accepted.price_per_unit,
            matched = matches.len(),
            "bid submitted"
        );

        self.emit(CoreEvent::BidSubmitted {
            bid: accepted.clone(),
            timestamp: Utc::now(),
        });

        let ttl = (accepted.valid_until - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !ttl.is_zero() {
            if let Ok(value) = serde_json::to_value(&accepted) {
                self.persist(format!("bid:{}", accepted.id), value, ttl).await;
            }
        }

        for market_match in &matches {
            self.record_match(market_match.clone()).await;
        }

        Ok(BidSubmission {
            bid: accepted,
            matches,
        })
    }

    fn validate_draft(draft: &BidDraft) -> MarketResult<()> {
        if draft.agent_id.as_str().is_empty() {
            return Err(MarketError::InvalidBid("agent id is required".into()));
        }
        if draft.product_id.as_str().is_empty() {
            return Err(MarketError::InvalidBid("product id is required".into()));
        }
        if draft.quantity == 0 {
            return Err(MarketError::InvalidBid("quantity must be positive".into()));
        }
        if draft.price_per_unit <= Decimal::ZERO {
            return Err(MarketError::InvalidBid("price per unit must be positive".into()));
        }
        if draft.valid_until <= Utc::now() {
            return Err(MarketError::InvalidBid("valid_until must be in the future".into()));
        }
        Ok(())
    }

    /// Match the bid with the given id against the opposite side of the
    /// book. Both constituents of a match are removed atomically; a
    /// consumed bid never matches again.
    fn match_bid(&self, book: &mut HashMap<BidId, MarketBid>, bid_id: BidId) -> Vec<MarketMatch> {
        let mut created = Vec::new();

        while let Some(new_bid) = book.get(&bid_id).cloned() {
            // Oldest compatible resting bid first
            let counter_id = book
                .values()
                .filter(|resting| {
                    resting.id != new_bid.id
                        && resting.side == new_bid.side.opposite()
                        && resting.product_id == new_bid.product_id
                        && Self::compatible(&new_bid, resting)
                })
                .min_by_key(|resting| resting.submitted_at)
                .map(|resting| resting.id);

            let Some(counter_id) = counter_id else { break };

            let counter = book.remove(&counter_id).expect("counter bid present");
            let new_bid = book.remove(&bid_id).expect("new bid present");

            let (buy, sell) = match new_bid.side {
                BidSide::Buy => (new_bid, counter),
                BidSide::Sell => (counter, new_bid),
            };
            created.push(self.make_match(buy, sell));
        }

        created
    }

    /// Two opposite-side bids are compatible when the buy price covers the
    /// sell price and the overlapping quantity satisfies both minimums.
    fn compatible(a: &MarketBid, b: &MarketBid) -> bool {
        let (buy, sell) = match a.side {
            BidSide::Buy => (a, b),
            BidSide::Sell => (b, a),
        };
        if buy.price_per_unit < sell.price_per_unit {
            return false;
        }
        let overlap = buy.quantity.min(sell.quantity);
        let min_required = buy
            .conditions
            .min_quantity
            .unwrap_or(0)
            .max(sell.conditions.min_quantity.unwrap_or(0));
        overlap >= min_required
    }

    fn make_match(&self, buy: MarketBid, sell: MarketBid) -> MarketMatch {
        let agreed_quantity = buy.quantity.min(sell.quantity);
        let agreed_price = (buy.price_per_unit + sell.price_per_unit) / Decimal::TWO;
        let transport_cost = self.estimator.estimate(
            sell.from_store.as_ref(),
            buy.to_store.as_ref(),
            agreed_quantity,
        );
        let estimated_profit = agreed_price * Decimal::from(agreed_quantity) - transport_cost;

        MarketMatch {
            id: MatchId::new(),
            buy_bid: buy,
            sell_bid: sell,
            agreed_quantity,
            agreed_price,
            estimated_profit,
            transport_cost,
            status: MatchStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    async fn record_match(&self, market_match: MarketMatch) {
        info!(
            match_id = %market_match.id,
            product_id = %market_match.product_id(),
            quantity = market_match.agreed_quantity,
            price = %market_match.agreed_price,
            "match created"
        );

        self.matches
            .write()
            .insert(market_match.id, market_match.clone());

        if let Ok(value) = serde_json::to_value(&market_match) {
            self.persist(
                format!("match:{}", market_match.id),
                value,
                self.config.match_snapshot_ttl,
            )
            .await;
        }

        self.emit(CoreEvent::MatchCreated {
            market_match,
            timestamp: Utc::now(),
        });
    }

    /// Move a match along its settlement lifecycle. Settlement itself is
    /// driven by the outer API surface; the core only tracks the status for
    /// statistics.
    pub fn update_match_status(&self, id: MatchId, status: MatchStatus) -> MarketResult<()> {
        let mut matches = self.matches.write();
        let market_match = matches.get_mut(&id).ok_or(MarketError::MatchNotFound(id))?;
        market_match.status = status;
        if status == MatchStatus::Completed {
            market_match.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    /// Open a negotiation between two agents with the initiator's offer.
    pub async fn start_negotiation(
        &self,
        initiator: AgentId,
        target: AgentId,
        subject: NegotiationSubject,
        initial_offer: OfferDraft,
    ) -> MarketResult<Negotiation> {
        if initiator == target {
            return Err(MarketError::InvalidOffer(
                "a negotiation needs two distinct participants".into(),
            ));
        }
        if initial_offer.price_offer <= Decimal::ZERO {
            return Err(MarketError::InvalidOffer("price offer must be positive".into()));
        }
        if subject.quantity == 0 {
            return Err(MarketError::InvalidOffer("subject quantity must be positive".into()));
        }

        let now = Utc::now();
        let negotiation = Negotiation {
            id: NegotiationId::new(),
            participants: [initiator.clone(), target.clone()],
            subject,
            offers: vec![NegotiationOffer {
                agent_id: initiator.clone(),
                price_offer: initial_offer.price_offer,
                conditions: initial_offer.conditions,
                timestamp: now,
            }],
            status: NegotiationStatus::Negotiating,
            deadline: now
                + chrono::Duration::from_std(self.config.negotiation_ttl)
                    .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            agreed_terms: None,
            started_at: now,
        };

        self.negotiations
            .write()
            .insert(negotiation.id, negotiation.clone());

        info!(
            negotiation_id = %negotiation.id,
            initiator = %initiator,
            target = %target,
            product_id = %negotiation.subject.product_id,
            opening_offer = %initial_offer.price_offer,
            "negotiation started"
        );

        if let Ok(value) = serde_json::to_value(&negotiation) {
            self.persist(
                format!("negotiation:{}", negotiation.id),
                value,
                self.config.negotiation_ttl,
            )
            .await;
        }

        self.emit(CoreEvent::NegotiationStarted {
            negotiation: negotiation.clone(),
            timestamp: Utc::now(),
        });

        Ok(negotiation)
    }

    /// Append one offer to an open negotiation, settling it when the new
    /// offer converges with the previous one.
    pub async fn submit_counter_offer(
        &self,
        id: NegotiationId,
        agent_id: AgentId,
        offer: OfferDraft,
    ) -> MarketResult<CounterOutcome> {
        if offer.price_offer <= Decimal::ZERO {
            return Err(MarketError::InvalidOffer("price offer must be positive".into()));
        }

        // Append + convergence check under one write lock so offers are
        // strictly ordered and none is lost.
        let (settled, offers_len, price) = {
            let mut negotiations = self.negotiations.write();
            let negotiation = negotiations
                .get_mut(&id)
                .ok_or(MarketError::NegotiationNotFound(id))?;

            if negotiation.status.is_terminal() {
                return Err(MarketError::NegotiationClosed {
                    id,
                    status: negotiation.status,
                });
            }
            if !negotiation.is_participant(&agent_id) {
                return Err(MarketError::NotAParticipant { id, agent_id });
            }

            let previous = negotiation
                .last_offer()
                .expect("negotiation always holds the opening offer")
                .clone();

            negotiation.offers.push(NegotiationOffer {
                agent_id: agent_id.clone(),
                price_offer: offer.price_offer,
                conditions: offer.conditions.clone(),
                timestamp: Utc::now(),
            });

            let delta = (offer.price_offer - previous.price_offer).abs();
            let converged = delta < self.config.convergence_tolerance * previous.price_offer;

            if converged {
                let final_price = (offer.price_offer + previous.price_offer) / Decimal::TWO;
                let terms = AgreedTerms {
                    final_price,
                    quantity: negotiation.subject.quantity,
                    conditions: merge_conditions(&previous.conditions, &offer.conditions),
                };
                negotiation.status = NegotiationStatus::Agreed;
                negotiation.agreed_terms = Some(terms);
                (Some(negotiation.clone()), 0, offer.price_offer)
            } else {
                (None, negotiation.offers.len(), offer.price_offer)
            }
        };

        match settled {
            Some(negotiation) => {
                let terms = negotiation
                    .agreed_terms
                    .clone()
                    .expect("agreed negotiation carries terms");
                self.execute_transfer(&negotiation, &terms).await;
                Ok(CounterOutcome::Agreed(terms))
            }
            None => {
                debug!(
                    negotiation_id = %id,
                    agent_id = %agent_id,
                    price_offer = %price,
                    offers = offers_len,
                    "counter-offer received, no convergence"
                );
                self.emit(CoreEvent::CounterOfferReceived {
                    negotiation_id: id,
                    agent_id,
                    price_offer: price,
                    timestamp: Utc::now(),
                });
                Ok(CounterOutcome::Countered { offers: offers_len })
            }
        }
    }

    /// Book the agreed transfer into the aggregate statistics and notify
    /// observers.
    async fn execute_transfer(&self, negotiation: &Negotiation, terms: &AgreedTerms) {
        {
            let mut stats = self.stats.write();
            stats.total_transfers += 1;
            stats.total_volume += terms.quantity;
            stats.total_profit += terms.final_price;
        }

        info!(
            negotiation_id = %negotiation.id,
            product_id = %negotiation.subject.product_id,
            quantity = terms.quantity,
            final_price = %terms.final_price,
            "negotiation settled, transfer executed"
        );

        if let Ok(value) = serde_json::to_value(negotiation) {
            self.persist(
                format!("negotiation:{}", negotiation.id),
                value,
                self.config.match_snapshot_ttl,
            )
            .await;
        }

        self.emit(CoreEvent::NegotiationCompleted {
            negotiation: negotiation.clone(),
            timestamp: Utc::now(),
        });
        self.emit(CoreEvent::TransferExecuted {
            negotiation_id: negotiation.id,
            product_id: negotiation.subject.product_id.clone(),
            quantity: terms.quantity,
            final_price: terms.final_price,
            timestamp: Utc::now(),
        });
    }

    // ========================================================================
    // Clearing
    // ========================================================================

    /// Run one maintenance sweep: expire overdue bids and negotiations,
    /// refresh statistics.
    pub fn sweep_now(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let expired: Vec<MarketBid> = {
            let mut book = self.book.write();
            let ids: Vec<BidId> = book
                .values()
                .filter(|bid| now > bid.valid_until)
                .map(|bid| bid.id)
                .collect();
            ids.iter().filter_map(|id| book.remove(id)).collect()
        };

        {
            let mut negotiations = self.negotiations.write();
            for negotiation in negotiations.values_mut() {
                if negotiation.status == NegotiationStatus::Negotiating && now > negotiation.deadline
                {
                    negotiation.status = NegotiationStatus::Expired;
                    report.expired_negotiations.push(negotiation.id);
                }
            }
        }

        for bid in &expired {
            debug!(bid_id = %bid.id, product_id = %bid.product_id, "bid expired");
            report.expired_bids.push(bid.id);
            self.emit(CoreEvent::BidExpired {
                bid_id: bid.id,
                product_id: bid.product_id.clone(),
                timestamp: now,
            });
        }
        for id in &report.expired_negotiations {
            debug!(negotiation_id = %id, "negotiation expired");
            self.emit(CoreEvent::NegotiationExpired {
                negotiation_id: *id,
                timestamp: now,
            });
        }

        self.refresh_stats(expired.len() as u64);

        if !report.expired_bids.is_empty() || !report.expired_negotiations.is_empty() {
            info!(
                expired_bids = report.expired_bids.len(),
                expired_negotiations = report.expired_negotiations.len(),
                "clearing sweep"
            );
        }

        report
    }

    fn refresh_stats(&self, newly_expired_bids: u64) {
        let (avg_ms, success_rate) = {
            let matches = self.matches.read();
            if matches.is_empty() {
                (0.0, 1.0)
            } else {
                let total_ms: i64 = matches
                    .values()
                    .map(|m| {
                        let submitted = m.buy_bid.submitted_at.max(m.sell_bid.submitted_at);
                        (m.created_at - submitted).num_milliseconds().max(0)
                    })
                    .sum();
                let completed = matches
                    .values()
                    .filter(|m| m.status == MatchStatus::Completed)
                    .count();
                (
                    total_ms as f64 / matches.len() as f64,
                    completed as f64 / matches.len() as f64,
                )
            }
        };

        let mut stats = self.stats.write();
        stats.avg_time_to_match_ms = avg_ms;
        stats.success_rate = success_rate;
        stats.total_bids_expired += newly_expired_bids;
    }

    /// Start the periodic clearing task. Idempotent: a second call while
    /// running is a no-op.
    pub async fn start_clearing(self: &Arc<Self>) {
        let mut stop_slot = self.clearing_stop.lock().await;
        if stop_slot.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        *stop_slot = Some(stop_tx);
        drop(stop_slot);

        let market = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(market.config.clearing_interval) => {
                        market.sweep_now();
                    }
                }
            }
        });
        *self.clearing_task.lock().await = Some(task);
        info!(interval = ?self.config.clearing_interval, "clearing task started");
    }

    /// Stop the clearing task
    pub async fn shutdown(&self) {
        if let Some(stop_tx) = self.clearing_stop.lock().await.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.clearing_task.lock().await.take() {
            let _ = task.await;
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn bid(&self, id: &BidId) -> Option<MarketBid> {
        self.book.read().get(id).cloned()
    }

    pub fn active_bids(&self) -> Vec<MarketBid> {
        self.book.read().values().cloned().collect()
    }

    pub fn active_bid_count(&self) -> usize {
        self.book.read().len()
    }

    pub fn get_match(&self, id: &MatchId) -> Option<MarketMatch> {
        self.matches.read().get(id).cloned()
    }

    pub fn match_count(&self) -> usize {
        self.matches.read().len()
    }

    pub fn negotiation(&self, id: &NegotiationId) -> Option<Negotiation> {
        self.negotiations.read().get(id).cloned()
    }

    pub fn stats(&self) -> MarketStats {
        self.stats.read().clone()
    }

    /// Liveliness summary for status probes
    pub fn activity(&self) -> MarketActivity {
        let active_bids = self.book.read().len();
        let recent_matches = self.matches.read().len();
        let market_activity = if active_bids > self.config.high_activity_bid_count {
            "high"
        } else {
            "low"
        };
        MarketActivity {
            active_bids,
            recent_matches,
            market_activity: market_activity.to_string(),
        }
    }

    // ========================================================================
    // Persistence (best-effort)
    // ========================================================================

    /// Snapshot a value into the cache. Failures and timeouts are logged
    /// and never fail the in-memory operation.
    async fn persist(&self, key: String, value: serde_json::Value, ttl: Duration) {
        match tokio::time::timeout(self.config.persist_timeout, self.cache.put(&key, value, ttl))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = %key, error = %e, "persistence write failed"),
            Err(_) => warn!(key = %key, "persistence write timed out"),
        }
    }
}

/// Merge offer conditions: keys of `new` override keys of `previous`.
fn merge_conditions(previous: &serde_json::Value, new: &serde_json::Value) -> serde_json::Value {
    match (previous, new) {
        (serde_json::Value::Object(prev), serde_json::Value::Object(next)) => {
            let mut merged = prev.clone();
            for (k, v) in next {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        (_, serde_json::Value::Null) => previous.clone(),
        _ => new.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tradeswarm_bus::InMemoryCache;
    use tradeswarm_types::{BidConditions, ProductId, Urgency};

    fn market() -> Arc<Marketplace> {
        Arc::new(Marketplace::new(
            MarketplaceConfig::default(),
            Arc::new(FlatRateEstimator::new(dec!(0.5))),
            Arc::new(InMemoryCache::new()),
        ))
    }

    fn draft(agent: &str, side: BidSide, quantity: u64, price: Decimal) -> BidDraft {
        BidDraft {
            agent_id: AgentId::new(agent),
            product_id: ProductId::new("P1"),
            side,
            quantity,
            price_per_unit: price,
            from_store: None,
            to_store: None,
            urgency: Urgency::Medium,
            valid_until: Utc::now() + chrono::Duration::minutes(15),
            conditions: BidConditions::default(),
            metadata: serde_json::Value::Null,
        }
    }

    fn subject() -> NegotiationSubject {
        NegotiationSubject {
            product_id: ProductId::new("P1"),
            quantity: 40,
            from_store: StoreId::new("S1"),
            to_store: StoreId::new("S2"),
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_bids() {
        let market = market();

        let mut zero_qty = draft("a", BidSide::Buy, 10, dec!(12));
        zero_qty.quantity = 0;
        assert!(matches!(
            market.submit_bid(zero_qty).await,
            Err(MarketError::InvalidBid(_))
        ));

        let mut bad_price = draft("a", BidSide::Buy, 10, dec!(0));
        bad_price.price_per_unit = dec!(0);
        assert!(matches!(
            market.submit_bid(bad_price).await,
            Err(MarketError::InvalidBid(_))
        ));

        let mut stale = draft("a", BidSide::Buy, 10, dec!(12));
        stale.valid_until = Utc::now() - chrono::Duration::seconds(1);
        assert!(matches!(
            market.submit_bid(stale).await,
            Err(MarketError::InvalidBid(_))
        ));

        // Nothing entered the book
        assert_eq!(market.active_bid_count(), 0);
    }

    #[tokio::test]
    async fn test_crossing_bids_match_at_average_price() {
        let market = market();

        let resting = market
            .submit_bid(draft("seller", BidSide::Sell, 10, dec!(10)))
            .await
            .unwrap();
        assert!(resting.matches.is_empty());
        assert_eq!(market.active_bid_count(), 1);

        let submission = market
            .submit_bid(draft("buyer", BidSide::Buy, 10, dec!(12)))
            .await
            .unwrap();

        assert_eq!(submission.matches.len(), 1);
        let m = &submission.matches[0];
        assert_eq!(m.agreed_price, dec!(11));
        assert_eq!(m.agreed_quantity, 10);
        // Both constituents left the book
        assert_eq!(market.active_bid_count(), 0);
    }

    #[tokio::test]
    async fn test_non_crossing_bids_rest() {
        let market = market();

        market
            .submit_bid(draft("seller", BidSide::Sell, 10, dec!(15)))
            .await
            .unwrap();
        let submission = market
            .submit_bid(draft("buyer", BidSide::Buy, 10, dec!(12)))
            .await
            .unwrap();

        assert!(submission.matches.is_empty());
        assert_eq!(market.active_bid_count(), 2);
    }

    #[tokio::test]
    async fn test_min_quantity_condition_blocks_match() {
        let market = market();

        let mut sell = draft("seller", BidSide::Sell, 10, dec!(10));
        sell.conditions.min_quantity = Some(20);
        market.submit_bid(sell).await.unwrap();

        let submission = market
            .submit_bid(draft("buyer", BidSide::Buy, 10, dec!(12)))
            .await
            .unwrap();

        // Overlap of 10 is below the seller's minimum of 20
        assert!(submission.matches.is_empty());
        assert_eq!(market.active_bid_count(), 2);
    }

    #[tokio::test]
    async fn test_matched_bid_is_never_reused() {
        let market = market();

        market
            .submit_bid(draft("seller", BidSide::Sell, 10, dec!(10)))
            .await
            .unwrap();
        let first = market
            .submit_bid(draft("buyer-1", BidSide::Buy, 10, dec!(12)))
            .await
            .unwrap();
        assert_eq!(first.matches.len(), 1);

        // The sell bid was consumed; a second buyer rests instead
        let second = market
            .submit_bid(draft("buyer-2", BidSide::Buy, 10, dec!(12)))
            .await
            .unwrap();
        assert!(second.matches.is_empty());
        assert_eq!(market.match_count(), 1);
    }

    #[tokio::test]
    async fn test_products_do_not_cross_match() {
        let market = market();

        let mut other = draft("seller", BidSide::Sell, 10, dec!(10));
        other.product_id = ProductId::new("P2");
        market.submit_bid(other).await.unwrap();

        let submission = market
            .submit_bid(draft("buyer", BidSide::Buy, 10, dec!(12)))
            .await
            .unwrap();
        assert!(submission.matches.is_empty());
    }

    #[tokio::test]
    async fn test_negotiation_rejects_strangers_and_closed() {
        let market = market();

        let negotiation = market
            .start_negotiation(
                AgentId::new("a"),
                AgentId::new("b"),
                subject(),
                OfferDraft {
                    price_offer: dec!(100),
                    conditions: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();

        let stranger = market
            .submit_counter_offer(
                negotiation.id,
                AgentId::new("c"),
                OfferDraft {
                    price_offer: dec!(90),
                    conditions: serde_json::Value::Null,
                },
            )
            .await;
        assert!(matches!(stranger, Err(MarketError::NotAParticipant { .. })));

        // Converge it, then further offers are rejected
        market
            .submit_counter_offer(
                negotiation.id,
                AgentId::new("b"),
                OfferDraft {
                    price_offer: dec!(98),
                    conditions: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        let late = market
            .submit_counter_offer(
                negotiation.id,
                AgentId::new("a"),
                OfferDraft {
                    price_offer: dec!(97),
                    conditions: serde_json::Value::Null,
                },
            )
            .await;
        assert!(matches!(late, Err(MarketError::NegotiationClosed { .. })));
    }

    #[tokio::test]
    async fn test_convergence_boundary_is_strict() {
        let market = market();

        let negotiation = market
            .start_negotiation(
                AgentId::new("a"),
                AgentId::new("b"),
                subject(),
                OfferDraft {
                    price_offer: dec!(100),
                    conditions: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();

        // Exactly 5% apart: |95 - 100| = 5 is NOT < 5, stays open
        let outcome = market
            .submit_counter_offer(
                negotiation.id,
                AgentId::new("b"),
                OfferDraft {
                    price_offer: dec!(95),
                    conditions: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, CounterOutcome::Countered { offers: 2 }));

        // |96 - 95| = 1 < 0.05 * 95, converges at the midpoint
        let outcome = market
            .submit_counter_offer(
                negotiation.id,
                AgentId::new("a"),
                OfferDraft {
                    price_offer: dec!(96),
                    conditions: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        match outcome {
            CounterOutcome::Agreed(terms) => assert_eq!(terms.final_price, dec!(95.5)),
            other => panic!("expected agreement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_agreed_conditions_merge_with_new_overriding() {
        let market = market();

        let negotiation = market
            .start_negotiation(
                AgentId::new("a"),
                AgentId::new("b"),
                subject(),
                OfferDraft {
                    price_offer: dec!(100),
                    conditions: serde_json::json!({"delivery_days": 5, "insured": true}),
                },
            )
            .await
            .unwrap();

        let outcome = market
            .submit_counter_offer(
                negotiation.id,
                AgentId::new("b"),
                OfferDraft {
                    price_offer: dec!(98),
                    conditions: serde_json::json!({"delivery_days": 3}),
                },
            )
            .await
            .unwrap();

        match outcome {
            CounterOutcome::Agreed(terms) => {
                assert_eq!(terms.conditions["delivery_days"], 3);
                assert_eq!(terms.conditions["insured"], true);
            }
            other => panic!("expected agreement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_expires_only_overdue_state() {
        let market = market();

        let mut short = draft("a", BidSide::Buy, 5, dec!(10));
        short.valid_until = Utc::now() + chrono::Duration::milliseconds(30);
        let short = market.submit_bid(short).await.unwrap().bid;

        let long = market
            .submit_bid(draft("b", BidSide::Buy, 5, dec!(10)))
            .await
            .unwrap()
            .bid;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let report = market.sweep_now();

        assert_eq!(report.expired_bids, vec![short.id]);
        assert!(market.bid(&long.id).is_some());
        assert!(market.bid(&short.id).is_none());
        assert_eq!(market.stats().total_bids_expired, 1);
    }

    #[tokio::test]
    async fn test_activity_summary() {
        let market = market();
        for i in 0..12 {
            market
                .submit_bid(draft(&format!("agent-{i}"), BidSide::Buy, 1, dec!(1)))
                .await
                .unwrap();
        }

        let activity = market.activity();
        assert_eq!(activity.active_bids, 12);
        assert_eq!(activity.market_activity, "high");
    }
}
