//! Order-book snapshots and liquidity walks

use crate::config::LedgerConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::types::{now_ledger_time, BookOffer, Issue, LedgerAmount, DROPS_PER_XRP};
use crate::ledger::Ledger;

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which side of the currency/XRP book an offer sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Offers giving the currency for XRP
    Bid,
    /// Offers giving XRP for the currency
    Ask,
}

/// Aggregated tradable volume at one price. Prices are currency per XRP,
/// volume is in currency units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

/// Raw offers for both sides of a book
#[derive(Debug, Clone)]
pub struct RawBook {
    pub bids: Vec<BookOffer>,
    pub asks: Vec<BookOffer>,
    pub ledger: u32,
}

/// Normalized book, levels in best-to-worst order
#[derive(Debug, Clone, Default)]
pub struct BookSnapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub ledger: u32,
}

/// Amount a walk must accumulate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Needed {
    Units(Decimal),
    Drops(Decimal),
}

impl Needed {
    pub fn units(self) -> Decimal {
        match self {
            Needed::Units(units) => units,
            Needed::Drops(drops) => drops / Decimal::from(DROPS_PER_XRP),
        }
    }
}

/// Result of consuming price levels until a need is met
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiquidityWalk {
    pub liquidity: Decimal,
    pub needed: Decimal,
    pub first_price: Decimal,
    /// Execution price under market impact
    pub last_price: Decimal,
    pub slippage: Decimal,
    pub orders_crossed: usize,
    /// Whether the accumulated liquidity covers `needed`
    pub filled: bool,
}

/// Aggregate offers of one side into price levels.
///
/// Offers owned by `exclude_account` and offers expired at `now_ledger` are
/// dropped. Partially funded volume is preferred when the ledger reports it.
/// Levels keep the order in which their price first appears, which is the
/// ledger's best-first order.
pub fn normalize(
    offers: &[BookOffer],
    side: Side,
    exclude_account: &str,
    now_ledger: i64,
) -> Vec<PriceLevel> {
    let mut levels: Vec<PriceLevel> = Vec::new();
    let mut index: HashMap<Decimal, usize> = HashMap::new();

    for offer in offers {
        if offer.account == exclude_account {
            continue;
        }
        if offer.expiration.map_or(false, |exp| exp < now_ledger) {
            continue;
        }

        let (currency, native, funded) = match side {
            Side::Bid => (&offer.taker_gets, &offer.taker_pays, &offer.taker_pays_funded),
            Side::Ask => (&offer.taker_pays, &offer.taker_gets, &offer.taker_gets_funded),
        };

        let (currency_units, native_units) = match (currency.units(), native.units()) {
            (Some(c), Some(n)) if !n.is_zero() => (c, n),
            _ => {
                debug!("Skipping offer by {} without usable amounts", offer.account);
                continue;
            }
        };

        let price = (currency_units / native_units).normalize();
        let native_volume = funded
            .as_ref()
            .and_then(LedgerAmount::units)
            .filter(|v| *v > Decimal::ZERO)
            .unwrap_or(native_units);
        let volume = native_volume * price;

        match index.get(&price) {
            Some(&i) => levels[i].volume += volume,
            None => {
                index.insert(price, levels.len());
                levels.push(PriceLevel { price, volume });
            }
        }
    }

    levels
}

/// Consume levels in the order given until the cumulative volume meets `needed`.
///
/// Returns `None` when there are no levels.
pub fn walk_liquidity(levels: &[PriceLevel], needed: Needed) -> Option<LiquidityWalk> {
    let first_price = levels.first()?.price;
    let needed = needed.units();

    let mut liquidity = Decimal::ZERO;
    let mut last_price = first_price;
    let mut orders_crossed = 0;

    for level in levels {
        orders_crossed += 1;
        liquidity += level.volume;
        last_price = level.price;
        if liquidity >= needed {
            break;
        }
    }

    Some(LiquidityWalk {
        liquidity,
        needed,
        first_price,
        last_price,
        slippage: first_price - last_price,
        orders_crossed,
        filled: liquidity >= needed,
    })
}

/// Market data source for valuations
pub struct LiquidityOracle {
    ledger: Arc<dyn Ledger>,
    /// Taker for queries; its own offers are excluded
    account: String,
    book_limit: u32,
    max_network_errors: u32,
    network_errors: AtomicU32,
}

impl LiquidityOracle {
    pub fn new(ledger: Arc<dyn Ledger>, account: &str, config: &LedgerConfig) -> Self {
        Self {
            ledger,
            account: account.to_string(),
            book_limit: config.book_limit,
            max_network_errors: config.max_network_errors,
            network_errors: AtomicU32::new(0),
        }
    }

    /// Query both sides of the currency/XRP book in parallel
    pub async fn fetch_book(&self, currency: &str, issuer: &str) -> EngineResult<RawBook> {
        if self.network_errors.load(Ordering::Relaxed) >= self.max_network_errors {
            warn!(
                "{} consecutive ledger network errors, forcing reconnect",
                self.max_network_errors
            );
            if let Err(e) = self.ledger.reset().await {
                warn!("Ledger reset failed: {}", e);
            }
            self.network_errors.store(0, Ordering::Relaxed);
        }

        let token = Issue::token(currency, issuer);
        let (bids, asks) = tokio::join!(
            self.ledger
                .book_offers(&self.account, token.clone(), Issue::xrp(), self.book_limit),
            self.ledger
                .book_offers(&self.account, Issue::xrp(), token, self.book_limit),
        );

        let (bids, asks) = match (bids, asks) {
            (Ok(bids), Ok(asks)) => (bids, asks),
            (Err(e), _) | (_, Err(e)) => {
                if e.is_no_network() {
                    let count = self.network_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("Book fetch for {}/{} failed ({}): {}", currency, issuer, count, e);
                } else {
                    warn!("Book fetch for {}/{} failed: {}", currency, issuer, e);
                }
                crate::metrics::record_book_fetch_error();
                return Err(e);
            }
        };

        self.network_errors.store(0, Ordering::Relaxed);
        Ok(RawBook {
            ledger: bids.ledger(),
            bids: bids.offers,
            asks: asks.offers,
        })
    }

    /// Fetch and normalize a book
    pub async fn snapshot(&self, currency: &str, issuer: &str) -> EngineResult<BookSnapshot> {
        let raw = self.fetch_book(currency, issuer).await?;
        let now = now_ledger_time();

        Ok(BookSnapshot {
            bids: normalize(&raw.bids, Side::Bid, &self.account, now),
            asks: normalize(&raw.asks, Side::Ask, &self.account, now),
            ledger: raw.ledger,
        })
    }

    /// Collateral valuation rate (XRP per currency unit) for `amount`
    pub async fn current_rate(
        &self,
        amount: Decimal,
        currency: &str,
        issuer: &str,
    ) -> EngineResult<Decimal> {
        let snapshot = self.snapshot(currency, issuer).await?;
        let walk = walk_liquidity(&snapshot.asks, Needed::Units(amount))
            .filter(|w| !w.last_price.is_zero())
            .ok_or_else(|| EngineError::NotFound(format!("ask liquidity for {}/{}", currency, issuer)))?;

        debug!(
            "Rate for {} {}: last {} first {} over {} levels",
            amount, currency, walk.last_price, walk.first_price, walk.orders_crossed
        );
        Ok(Decimal::ONE / walk.last_price)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::ledger::{BookOffersResponse, MockLedger};
    use serde_json::json;

    fn level(price: i64, volume: i64) -> PriceLevel {
        PriceLevel {
            price: Decimal::from(price),
            volume: Decimal::from(volume),
        }
    }

    /// Bid giving `value` USD for `drops` XRP
    pub(crate) fn bid(account: &str, value: &str, drops: &str) -> BookOffer {
        serde_json::from_value(json!({
            "Account": account,
            "TakerGets": {"currency": "USD", "issuer": "rIssuer", "value": value},
            "TakerPays": drops,
        }))
        .unwrap()
    }

    /// Ask giving `drops` XRP for `value` USD
    pub(crate) fn ask(account: &str, drops: &str, value: &str) -> BookOffer {
        serde_json::from_value(json!({
            "Account": account,
            "TakerGets": drops,
            "TakerPays": {"currency": "USD", "issuer": "rIssuer", "value": value},
        }))
        .unwrap()
    }

    #[test]
    fn test_walk_stops_at_first_sufficient_prefix() {
        let levels = vec![level(5, 10), level(4, 10), level(3, 10), level(2, 10)];

        let walk = walk_liquidity(&levels, Needed::Units(Decimal::from(15))).unwrap();
        assert_eq!(walk.orders_crossed, 2);
        assert_eq!(walk.last_price, Decimal::from(4));
        assert_eq!(walk.slippage, Decimal::ONE);
        assert!(walk.filled);

        let walk = walk_liquidity(&levels, Needed::Units(Decimal::from(10))).unwrap();
        assert_eq!(walk.orders_crossed, 1);
        assert_eq!(walk.slippage, Decimal::ZERO);
    }

    #[test]
    fn test_walk_exhausts_levels() {
        let levels = vec![level(5, 10), level(4, 10)];
        let walk = walk_liquidity(&levels, Needed::Units(Decimal::from(100))).unwrap();
        assert_eq!(walk.orders_crossed, 2);
        assert_eq!(walk.liquidity, Decimal::from(20));
        assert!(!walk.filled);

        assert!(walk_liquidity(&[], Needed::Units(Decimal::ONE)).is_none());
    }

    #[test]
    fn test_walk_needed_in_drops() {
        let levels = vec![level(1, 2), level(1, 2)];
        let walk = walk_liquidity(&levels, Needed::Drops(Decimal::from(3_000_000))).unwrap();
        assert_eq!(walk.needed, Decimal::from(3));
        assert_eq!(walk.orders_crossed, 2);
    }

    #[test]
    fn test_normalize_filters_and_aggregates() {
        let mut expired = bid("rMaker", "10", "5000000");
        expired.expiration = Some(100);
        let mut funded = bid("rMaker", "3", "1000000");
        funded.taker_pays_funded = Some(LedgerAmount::Drops("500000".to_string()));

        let offers = vec![
            bid("rMaker", "6", "2000000"),
            bid("rCustody", "6", "2000000"),
            expired,
            funded,
            bid("rOther", "4", "2000000"),
        ];

        let levels = normalize(&offers, Side::Bid, "rCustody", 200);
        assert_eq!(levels.len(), 2);
        // 2 XRP + 0.5 funded XRP at 3 USD/XRP
        assert_eq!(levels[0].price, Decimal::from(3));
        assert_eq!(levels[0].volume, Decimal::new(75, 1));
        assert_eq!(levels[1].price, Decimal::from(2));
        assert_eq!(levels[1].volume, Decimal::from(4));
    }

    #[test]
    fn test_normalize_asks() {
        let offers = vec![ask("rMaker", "4000000", "2"), ask("rMaker", "1000000", "1")];
        let levels = normalize(&offers, Side::Ask, "rCustody", 0);
        assert_eq!(levels[0].price, Decimal::new(5, 1));
        assert_eq!(levels[0].volume, Decimal::from(2));
        assert_eq!(levels[1].price, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_current_rate_inverts_last_ask() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_book_offers()
            .times(2)
            .returning(|_, gets: Issue, _, _| {
                let offers = if gets.currency == "XRP" {
                    // asks at 0.5 then 2 USD/XRP, 2 USD each
                    vec![ask("rMaker", "4000000", "2"), ask("rMaker", "1000000", "2")]
                } else {
                    vec![]
                };
                Ok(BookOffersResponse {
                    offers,
                    ledger_current_index: Some(10),
                    ledger_index: None,
                })
            });

        let settings = sample_settings();
        let oracle = LiquidityOracle::new(Arc::new(ledger), "rCustody", &settings.ledger);
        let rate = oracle
            .current_rate(Decimal::from(3), "USD", "rIssuer")
            .await
            .unwrap();
        assert_eq!(rate, Decimal::new(5, 1));
    }

    #[tokio::test]
    async fn test_network_errors_force_reset() {
        let mut ledger = MockLedger::new();
        ledger.expect_book_offers().returning(|_, _, _, _| {
            Err(EngineError::Ledger {
                code: "noNetwork".to_string(),
                message: "not synced".to_string(),
            })
        });
        ledger.expect_reset().times(1).returning(|| Ok(()));

        let mut settings = sample_settings();
        settings.ledger.max_network_errors = 2;
        let oracle = LiquidityOracle::new(Arc::new(ledger), "rCustody", &settings.ledger);

        for _ in 0..2 {
            assert!(oracle.fetch_book("USD", "rIssuer").await.is_err());
        }
        assert!(oracle.fetch_book("USD", "rIssuer").await.is_err());
    }
}
