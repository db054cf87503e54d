use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use tradeswarm_bus::InMemoryCache;
use tradeswarm_marketplace::{
    CounterOutcome, FixedCostEstimator, Marketplace, MarketplaceConfig, OfferDraft,
};
use tradeswarm_types::{
    AgentId, BidConditions, BidDraft, BidSide, CoreEvent, NegotiationStatus, NegotiationSubject,
    ProductId, StoreId, Urgency,
};

fn marketplace_with(config: MarketplaceConfig) -> Arc<Marketplace> {
    Arc::new(Marketplace::new(
        config,
        Arc::new(FixedCostEstimator::new(dec!(25))),
        Arc::new(InMemoryCache::new()),
    ))
}

fn bid(agent: &str, side: BidSide, quantity: u64, price: rust_decimal::Decimal) -> BidDraft {
    BidDraft {
        agent_id: AgentId::new(agent),
        product_id: ProductId::new("P1"),
        side,
        quantity,
        price_per_unit: price,
        from_store: Some(StoreId::new("S1")),
        to_store: Some(StoreId::new("S2")),
        urgency: Urgency::Medium,
        valid_until: Utc::now() + chrono::Duration::minutes(15),
        conditions: BidConditions::default(),
        metadata: serde_json::Value::Null,
    }
}

fn subject(quantity: u64) -> NegotiationSubject {
    NegotiationSubject {
        product_id: ProductId::new("P1"),
        quantity,
        from_store: StoreId::new("S1"),
        to_store: StoreId::new("S2"),
    }
}

fn offer(price: rust_decimal::Decimal) -> OfferDraft {
    OfferDraft {
        price_offer: price,
        conditions: serde_json::Value::Null,
    }
}

/// A buy at 12 against a sell at 10 settles at the midpoint
#[tokio::test]
async fn crossing_buy_and_sell_bids_match_at_midpoint() {
    let market = marketplace_with(MarketplaceConfig::default());
    let mut events = market.subscribe_events();

    market
        .submit_bid(bid("buyer", BidSide::Buy, 10, dec!(12)))
        .await
        .unwrap();
    let submission = market
        .submit_bid(bid("seller", BidSide::Sell, 10, dec!(10)))
        .await
        .unwrap();

    assert_eq!(submission.matches.len(), 1);
    let m = &submission.matches[0];
    assert_eq!(m.agreed_price, dec!(11));
    assert_eq!(m.agreed_quantity, 10);
    assert_eq!(m.transport_cost, dec!(25));
    assert_eq!(m.estimated_profit, dec!(85)); // 11 * 10 - 25

    // Both bids are gone from the book
    assert_eq!(market.active_bid_count(), 0);

    // Observer surface saw two submissions and one match
    let mut submitted = 0;
    let mut matched = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::BidSubmitted { .. } => submitted += 1,
            CoreEvent::MatchCreated { .. } => matched += 1,
            _ => {}
        }
    }
    assert_eq!(submitted, 2);
    assert_eq!(matched, 1);
}

/// Offers of 100 then 97 are within tolerance: settle at 98.5
#[tokio::test]
async fn close_offers_converge_and_book_the_transfer() {
    let market = marketplace_with(MarketplaceConfig::default());

    let negotiation = market
        .start_negotiation(
            AgentId::new("product-agent-P1"),
            AgentId::new("product-agent-P2"),
            subject(40),
            offer(dec!(100)),
        )
        .await
        .unwrap();

    let outcome = market
        .submit_counter_offer(negotiation.id, AgentId::new("product-agent-P2"), offer(dec!(97)))
        .await
        .unwrap();

    let terms = match outcome {
        CounterOutcome::Agreed(terms) => terms,
        other => panic!("expected agreement, got {other:?}"),
    };
    assert_eq!(terms.final_price, dec!(98.5));

    let settled = market.negotiation(&negotiation.id).unwrap();
    assert_eq!(settled.status, NegotiationStatus::Agreed);
    assert_eq!(settled.offers.len(), 2);

    let stats = market.stats();
    assert_eq!(stats.total_transfers, 1);
    assert_eq!(stats.total_volume, 40);
    assert_eq!(stats.total_profit, dec!(98.5));
}

/// Offers are monotonically appended; divergent offers never auto-reject
#[tokio::test]
async fn divergent_offers_keep_the_negotiation_open_until_deadline() {
    let market = marketplace_with(MarketplaceConfig {
        negotiation_ttl: Duration::from_millis(50),
        ..MarketplaceConfig::default()
    });

    let negotiation = market
        .start_negotiation(
            AgentId::new("a"),
            AgentId::new("b"),
            subject(10),
            offer(dec!(100)),
        )
        .await
        .unwrap();

    // Far apart: stays open
    let outcome = market
        .submit_counter_offer(negotiation.id, AgentId::new("b"), offer(dec!(60)))
        .await
        .unwrap();
    assert!(matches!(outcome, CounterOutcome::Countered { offers: 2 }));

    // Deadline passes without convergence
    tokio::time::sleep(Duration::from_millis(80)).await;
    let report = market.sweep_now();
    assert_eq!(report.expired_negotiations, vec![negotiation.id]);
    assert_eq!(
        market.negotiation(&negotiation.id).unwrap().status,
        NegotiationStatus::Expired
    );
}

/// The background clearing task sweeps without any request traffic
#[tokio::test]
async fn clearing_task_expires_bids_in_the_background() {
    let market = marketplace_with(MarketplaceConfig {
        clearing_interval: Duration::from_millis(25),
        ..MarketplaceConfig::default()
    });

    let mut short = bid("a", BidSide::Buy, 5, dec!(10));
    short.valid_until = Utc::now() + chrono::Duration::milliseconds(30);
    market.submit_bid(short).await.unwrap();

    market.start_clearing().await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    market.shutdown().await;

    assert_eq!(market.active_bid_count(), 0);
    assert_eq!(market.stats().total_bids_expired, 1);
}

/// Concurrent submissions against one resting bid produce exactly one match
#[tokio::test]
async fn concurrent_buyers_cannot_both_consume_one_resting_sell() {
    let market = marketplace_with(MarketplaceConfig::default());

    market
        .submit_bid(bid("seller", BidSide::Sell, 10, dec!(10)))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let market = market.clone();
        handles.push(tokio::spawn(async move {
            market
                .submit_bid(bid(&format!("buyer-{i}"), BidSide::Buy, 10, dec!(12)))
                .await
                .unwrap()
        }));
    }

    let mut total_matches = 0;
    for handle in handles {
        total_matches += handle.await.unwrap().matches.len();
    }

    assert_eq!(total_matches, 1, "a resting bid matched more than once");
    // The other seven buyers rest on the book
    assert_eq!(market.active_bid_count(), 7);
}
