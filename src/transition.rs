//! Transition Engine (spec.md §4.6).
//!
//! Pure function over `(prev_keys, current_products)`; no I/O, no shared
//! state — easy to re-run and assert idempotence against, the way
//! `scrapers/polymarket.rs` separates "decide" from "act".

use std::collections::BTreeSet;

use chrono::Utc;

use crate::models::{EventKind, PriceSnapshot, Product, StockEvent};

pub struct ReconcileOutcome {
    pub events: Vec<StockEvent>,
    pub snapshots: Vec<PriceSnapshot>,
    pub new_in_stock_keys: BTreeSet<String>,
}

/// Compares the current scan's products to `prev_in_stock_keys` and emits
/// `new_in_stock` / `lost_stock` / `price_changed` events plus append-only
/// price snapshots. `is_first_scan` suppresses all events on a task's very
/// first successful run (spec.md §4.6: "this prevents a cold-start storm").
pub fn reconcile(
    task_id: i64,
    prev_in_stock_keys: &BTreeSet<String>,
    current_products: &[Product],
    last_listed_prices: impl Fn(&str) -> Option<f64>,
    price_change_threshold: f64,
    is_first_scan: bool,
) -> ReconcileOutcome {
    let curr_in_stock_keys: BTreeSet<String> = current_products
        .iter()
        .filter(|p| p.in_stock)
        .map(|p| p.canonical_key())
        .collect();

    let mut events = Vec::new();
    let mut snapshots = Vec::new();

    if !is_first_scan {
        for key in curr_in_stock_keys.difference(prev_in_stock_keys) {
            if let Some(p) = current_products.iter().find(|p| &p.canonical_key() == key) {
                events.push(new_event(EventKind::NewInStock, task_id, p));
            }
        }
        for key in prev_in_stock_keys.difference(&curr_in_stock_keys) {
            if let Some(p) = current_products.iter().find(|p| &p.canonical_key() == key) {
                events.push(new_event(EventKind::LostStock, task_id, p));
            } else {
                // the product disappeared from this scan entirely; still
                // informational, emit with what we know from the key alone.
                events.push(StockEvent {
                    kind: EventKind::LostStock,
                    retailer: String::new(),
                    product_key: key.clone(),
                    product_name: String::new(),
                    url: None,
                    price: None,
                    market_price: None,
                    delta_pct: None,
                    observed_at: Utc::now(),
                    source_task_id: task_id,
                });
            }
        }
        for key in curr_in_stock_keys.intersection(prev_in_stock_keys) {
            let Some(p) = current_products.iter().find(|p| &p.canonical_key() == key) else {
                continue;
            };
            let Some(current_price) = p.price else { continue };
            let Some(prior_price) = last_listed_prices(key) else { continue };
            if prior_price == 0.0 {
                continue;
            }
            let delta = (current_price - prior_price).abs() / prior_price;
            if delta >= price_change_threshold {
                events.push(new_event(EventKind::PriceChanged, task_id, p));
            }
        }
    }

    for p in current_products.iter().filter(|p| p.price.is_some()) {
        snapshots.push(PriceSnapshot::new(p.canonical_key(), p.price.unwrap(), None));
    }

    // Combined across all three kinds so a caller persisting or publishing
    // this cycle's events sees them in canonical-key order regardless of
    // which kind produced them (spec.md §4.6, reproducibility).
    events.sort_by(|a, b| a.product_key.cmp(&b.product_key));

    ReconcileOutcome {
        events,
        snapshots,
        new_in_stock_keys: curr_in_stock_keys,
    }
}

fn new_event(kind: EventKind, task_id: i64, p: &Product) -> StockEvent {
    StockEvent {
        kind,
        retailer: p.retailer.clone(),
        product_key: p.canonical_key(),
        product_name: p.name.clone(),
        url: p.url.clone(),
        price: p.price,
        market_price: None,
        delta_pct: None,
        observed_at: p.observed_at,
        source_task_id: task_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn product(name: &str, sku: &str, price: f64, in_stock: bool) -> Product {
        Product {
            retailer: "target".into(),
            set_name: String::new(),
            name: name.into(),
            sku: Some(sku.into()),
            url: None,
            price: Some(price),
            in_stock,
            stock_status_text: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn first_scan_emits_no_events_but_seeds_state() {
        let products = vec![product("Widget", "sku1", 9.99, true)];
        let outcome = reconcile(1, &BTreeSet::new(), &products, |_| None, 0.05, true);
        assert!(outcome.events.is_empty());
        assert_eq!(outcome.new_in_stock_keys.len(), 1);
        assert_eq!(outcome.snapshots.len(), 1);
    }

    #[test]
    fn new_in_stock_emitted_exactly_for_set_difference() {
        let prev: BTreeSet<String> = ["target|sku1".to_string()].into_iter().collect();
        let products = vec![
            product("Widget", "sku1", 9.99, true),
            product("Gadget", "sku2", 14.99, true),
        ];
        let outcome = reconcile(1, &prev, &products, |_| None, 0.05, false);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].kind, EventKind::NewInStock);
        assert_eq!(outcome.events[0].product_key, "target|sku2");
    }

    #[test]
    fn lost_stock_emitted_for_dropped_key() {
        let prev: BTreeSet<String> = ["target|sku1".to_string()].into_iter().collect();
        let products = vec![product("Widget", "sku1", 9.99, false)];
        let outcome = reconcile(1, &prev, &products, |_| None, 0.05, false);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].kind, EventKind::LostStock);
        assert!(outcome.new_in_stock_keys.is_empty());
    }

    #[test]
    fn price_changed_only_above_threshold() {
        let prev: BTreeSet<String> = ["target|sku1".to_string()].into_iter().collect();
        let products = vec![product("Widget", "sku1", 11.00, true)];
        let outcome = reconcile(1, &prev, &products, |_| Some(10.00), 0.05, false);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].kind, EventKind::PriceChanged);

        let products_small_move = vec![product("Widget", "sku1", 10.20, true)];
        let outcome2 = reconcile(1, &prev, &products_small_move, |_| Some(10.00), 0.05, false);
        assert!(outcome2.events.is_empty());
    }

    #[test]
    fn events_are_sorted_by_product_key_across_kinds() {
        // "target|sku-z" only drops out of stock (lost_stock); "target|sku-a"
        // is freshly in stock (new_in_stock); "target|sku-m" crosses the price
        // threshold (price_changed). Insertion order above would put them
        // new/lost/price, not key order.
        let prev: BTreeSet<String> = ["target|sku-z".to_string(), "target|sku-m".to_string()]
            .into_iter()
            .collect();
        let products = vec![
            product("Zeta", "sku-z", 9.99, false),
            product("Alpha", "sku-a", 4.99, true),
            product("Mid", "sku-m", 20.00, true),
        ];
        let outcome = reconcile(1, &prev, &products, |_| Some(10.00), 0.05, false);
        let keys: Vec<&str> = outcome.events.iter().map(|e| e.product_key.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys, vec!["target|sku-a", "target|sku-m", "target|sku-z"]);
    }

    #[test]
    fn reconcile_is_idempotent_for_same_inputs() {
        let prev: BTreeSet<String> = ["target|sku1".to_string()].into_iter().collect();
        let products = vec![product("Widget", "sku1", 9.99, true), product("Gadget", "sku2", 4.99, true)];
        let a = reconcile(1, &prev, &products, |_| None, 0.05, false);
        let b = reconcile(1, &prev, &products, |_| None, 0.05, false);
        assert_eq!(a.new_in_stock_keys, b.new_in_stock_keys);
        assert_eq!(a.events.len(), b.events.len());
    }
}
