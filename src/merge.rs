//! Anomaly & merge library: page payloads → one canonical, flagged row set.
//!
//! Everything here is pure. Functions take and return in-memory values only,
//! so the whole module is tested without storage or network.
//!
//! ```text
//! PageResult* ──▶ normalize_page ──▶ dedupe ──▶ sort_rows ──▶ flag_price_anomalies
//!                                                                   │
//!                          MergeResult ◀── histogram / text / structure
//! ```
//!
//! Merging is order-insensitive: the dedupe container is keyed, and the only
//! order-dependent rule is the confidence tie-break (first seen wins on equal
//! confidence). The orchestrator feeds pages in page order so reruns of the
//! same document produce the same result.

use crate::config::PipelineConfig;
use crate::model::{
    ConfidenceBuckets, ExtractionPayload, MergeResult, PageResult, StagingRow, StructuredCategory,
    StructuredItem, StructuredMenu, UNKNOWN_CURRENCY,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Label used for rows with no category in rendered outputs.
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Sort key substituted for a missing category so such rows sort last.
const NULL_CATEGORY_SORT_KEY: &str = "zzz";

/// A zero price at or below this confidence is the extraction prompt's
/// "no price printed" placeholder, not a free item.
pub const UNPRICED_CONFIDENCE: f64 = 0.5;

/// Tunables for one merge call.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOptions {
    /// Currency declared on the ingestion (or configured default).
    pub declared_currency: Option<String>,
    pub min_confidence: f64,
    pub price_ceiling_cents: i64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        let config = PipelineConfig::default();
        Self::new(&config, None)
    }
}

impl MergeOptions {
    /// Options for an ingestion; its declared currency wins over the
    /// configured default.
    pub fn new(config: &PipelineConfig, ingestion_currency: Option<&str>) -> Self {
        let declared_currency = ingestion_currency
            .and_then(normalize_currency)
            .or_else(|| config.default_currency.as_deref().and_then(normalize_currency));
        Self {
            declared_currency,
            min_confidence: config.min_confidence,
            price_ceiling_cents: config.price_ceiling_cents,
        }
    }
}

/// Merge every page of a document into a [`MergeResult`].
pub fn merge_pages(pages: &[PageResult], options: &MergeOptions) -> MergeResult {
    let candidates = pages.iter().flat_map(|p| {
        normalize_page(
            p.page,
            &p.payload,
            options.declared_currency.as_deref(),
            options.min_confidence,
        )
    });

    let mut rows = dedupe(candidates);
    sort_rows(&mut rows);
    let price_threshold_cents = flag_price_anomalies(&mut rows, options.price_ceiling_cents);

    let currency = resolve_currency(options.declared_currency.as_deref(), &rows, pages);
    let confidence = confidence_histogram(&rows);
    let raw_text = render_text(&rows);
    let structured = structure(&rows, &currency);
    let max_price_cents = rows.iter().filter_map(|r| r.price_cents).max();

    MergeResult {
        items_count: rows.len(),
        rows,
        raw_text,
        structured,
        confidence,
        max_price_cents,
        price_threshold_cents,
        currency,
    }
}

// ── Step 1: normalise ─────────────────────────────────────────────────────

/// Turn one page payload into staging rows.
///
/// Items without a usable name are skipped. Prices become integer minor
/// units (`round(price * 100)`); negative or non-finite prices count as
/// missing, and so does a zero price whose confidence is missing or at most
/// [`UNPRICED_CONFIDENCE`]. Currency falls back from the item to
/// `declared_currency`, then to the page-level currency, then to `XXX`.
pub fn normalize_page(
    page: u32,
    payload: &ExtractionPayload,
    declared_currency: Option<&str>,
    min_confidence: f64,
) -> Vec<StagingRow> {
    let page_currency = normalize_currency(&payload.currency)
        .filter(|c| c != UNKNOWN_CURRENCY);

    let mut rows = Vec::with_capacity(payload.item_count());
    for category in &payload.categories {
        let category_name = clean_text(category.name.as_deref());
        for item in &category.items {
            let Some(name) = clean_text(item.name.as_deref()) else {
                continue;
            };

            let currency = item
                .currency
                .as_deref()
                .and_then(normalize_currency)
                .filter(|c| c != UNKNOWN_CURRENCY)
                .or_else(|| declared_currency.map(str::to_string))
                .or_else(|| page_currency.clone())
                .unwrap_or_else(|| UNKNOWN_CURRENCY.to_string());

            let confidence = item
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0));

            let mut row = StagingRow {
                category: category_name.clone(),
                name,
                description: clean_text(item.description.as_deref()),
                price_cents: item
                    .price
                    .and_then(to_minor_units)
                    .filter(|&cents| {
                        cents != 0 || confidence.is_some_and(|c| c > UNPRICED_CONFIDENCE)
                    }),
                currency,
                allergens: clean_list(&item.allergens),
                tags: clean_list(&item.tags),
                is_alcohol: item.is_alcohol.unwrap_or(false),
                confidence,
                flags: Default::default(),
                source_pages: vec![page],
            };
            row.flags.low_confidence = matches!(confidence, Some(c) if c < min_confidence);
            rows.push(row);
        }
    }
    rows
}

/// Major units → integer minor units. `None` for negative or non-finite input.
pub fn to_minor_units(price: f64) -> Option<i64> {
    if !price.is_finite() || price < 0.0 {
        return None;
    }
    Some((price * 100.0).round() as i64)
}

/// Minor units → major units.
pub fn to_major_units(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// Upper-case a three-letter currency code; anything else is `None`.
pub fn normalize_currency(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}

fn clean_text(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn clean_list(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for v in values {
        let v = v.trim();
        if !v.is_empty() && !out.iter().any(|o| o.eq_ignore_ascii_case(v)) {
            out.push(v.to_string());
        }
    }
    out
}

// ── Step 2: dedupe ────────────────────────────────────────────────────────

/// `lowercased-trimmed-name::price-cents-or--1::currency`.
pub fn dedupe_key(row: &StagingRow) -> String {
    format!(
        "{}::{}::{}",
        row.name.trim().to_lowercase(),
        row.price_cents.unwrap_or(-1),
        row.currency
    )
}

/// Collapse rows sharing a dedupe key.
///
/// The row with the higher confidence (missing = 0) supplies every field
/// except flags and source pages, which are the union of all colliding rows.
/// On equal confidence the row seen first is kept.
pub fn dedupe(rows: impl IntoIterator<Item = StagingRow>) -> Vec<StagingRow> {
    let mut by_key: BTreeMap<String, StagingRow> = BTreeMap::new();

    for row in rows {
        let key = dedupe_key(&row);
        match by_key.remove(&key) {
            None => {
                by_key.insert(key, row);
            }
            Some(existing) => {
                let (mut winner, loser) =
                    if row.confidence.unwrap_or(0.0) > existing.confidence.unwrap_or(0.0) {
                        (row, existing)
                    } else {
                        (existing, row)
                    };
                winner.flags.union(&loser.flags);
                for page in loser.source_pages {
                    if !winner.source_pages.contains(&page) {
                        winner.source_pages.push(page);
                    }
                }
                winner.source_pages.sort_unstable();
                by_key.insert(key, winner);
            }
        }
    }

    by_key.into_values().collect()
}

// ── Step 3: sort ──────────────────────────────────────────────────────────

/// Sort by category (missing categories last) then item name.
pub fn sort_rows(rows: &mut [StagingRow]) {
    rows.sort_by(|a, b| {
        let ca = a.category.as_deref().unwrap_or(NULL_CATEGORY_SORT_KEY);
        let cb = b.category.as_deref().unwrap_or(NULL_CATEGORY_SORT_KEY);
        collate(ca, cb).then_with(|| collate(&a.name, &b.name))
    });
}

/// Dictionary-style comparison: letters compare case-insensitively first,
/// and only equal-ignoring-case strings are ordered by case (lower first).
pub fn collate(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| b.cmp(a))
}

// ── Step 4: price anomalies ───────────────────────────────────────────────

/// Threshold above which a price is considered anomalous:
/// `min(mean + 3·stddev, ceiling)` with the sample standard deviation.
/// `None` when `prices` is empty.
pub fn price_threshold(prices: &[i64], ceiling_cents: i64) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    let n = prices.len() as f64;
    let mean = prices.iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = if prices.len() > 1 {
        prices
            .iter()
            .map(|&p| (p as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0)
    } else {
        0.0
    };
    let statistical = mean + 3.0 * variance.sqrt();
    Some(statistical.min(ceiling_cents as f64))
}

/// Flag `high_price` and `missing_price` in place; returns the threshold used.
pub fn flag_price_anomalies(rows: &mut [StagingRow], ceiling_cents: i64) -> Option<f64> {
    let prices: Vec<i64> = rows.iter().filter_map(|r| r.price_cents).collect();
    let threshold = price_threshold(&prices, ceiling_cents);

    for row in rows.iter_mut() {
        match (row.price_cents, threshold) {
            (None, _) => row.flags.missing_price = true,
            (Some(price), Some(limit)) if price as f64 > limit => {
                row.flags.high_price = true;
                row.flags.price_threshold_cents = Some(limit);
            }
            _ => {}
        }
    }
    threshold
}

// ── Step 5: derived outputs ───────────────────────────────────────────────

pub fn confidence_histogram(rows: &[StagingRow]) -> ConfidenceBuckets {
    let mut buckets = ConfidenceBuckets::default();
    for row in rows {
        buckets.record(row.confidence);
    }
    buckets
}

/// One `category :: name :: price currency` line per row.
pub fn render_text(rows: &[StagingRow]) -> String {
    rows.iter()
        .map(|r| {
            let price = r
                .price_cents
                .map(|c| format!("{:.2}", to_major_units(c)))
                .unwrap_or_else(|| "n/a".to_string());
            format!(
                "{} :: {} :: {} {}",
                r.category.as_deref().unwrap_or(UNCATEGORIZED),
                r.name,
                price,
                r.currency
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Group sorted rows by category, keeping their order.
pub fn structure(rows: &[StagingRow], currency: &str) -> StructuredMenu {
    let mut categories: Vec<StructuredCategory> = Vec::new();

    for row in rows {
        let name = row.category.as_deref().unwrap_or(UNCATEGORIZED);
        let item = StructuredItem {
            name: row.name.clone(),
            description: row.description.clone(),
            price: row.price_cents.map(to_major_units),
            currency: row.currency.clone(),
            allergens: row.allergens.clone(),
            tags: row.tags.clone(),
            is_alcohol: row.is_alcohol,
            confidence: row.confidence,
            flags: row.flags.clone(),
        };
        match categories.last_mut() {
            Some(last) if last.name == name => last.items.push(item),
            _ => categories.push(StructuredCategory {
                name: name.to_string(),
                items: vec![item],
            }),
        }
    }

    StructuredMenu {
        currency: currency.to_string(),
        categories,
    }
}

/// Declared currency, else the most common row currency, else the first
/// page-level currency, else `XXX`.
fn resolve_currency(declared: Option<&str>, rows: &[StagingRow], pages: &[PageResult]) -> String {
    if let Some(code) = declared {
        return code.to_string();
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.currency != UNKNOWN_CURRENCY) {
        *counts.entry(row.currency.as_str()).or_default() += 1;
    }
    // max_by_key returns the last maximum; iterate in reverse so ties go to
    // the alphabetically first code.
    if let Some((code, _)) = counts.iter().rev().max_by_key(|(_, n)| **n) {
        return code.to_string();
    }

    pages
        .iter()
        .filter_map(|p| normalize_currency(&p.payload.currency))
        .find(|c| c != UNKNOWN_CURRENCY)
        .unwrap_or_else(|| UNKNOWN_CURRENCY.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExtractedCategory, ExtractedItem, RowFlags};

    fn item(name: &str, price: Option<f64>, confidence: Option<f64>) -> ExtractedItem {
        ExtractedItem {
            name: Some(name.to_string()),
            price,
            currency: Some("USD".into()),
            confidence,
            ..Default::default()
        }
    }

    fn page(page: u32, category: Option<&str>, items: Vec<ExtractedItem>) -> PageResult {
        PageResult::parsed(
            page,
            ExtractionPayload {
                currency: "USD".into(),
                categories: vec![ExtractedCategory {
                    name: category.map(str::to_string),
                    items,
                }],
            },
        )
    }

    fn row(category: Option<&str>, name: &str, price_cents: Option<i64>) -> StagingRow {
        StagingRow {
            category: category.map(str::to_string),
            name: name.to_string(),
            description: None,
            price_cents,
            currency: "USD".into(),
            allergens: vec![],
            tags: vec![],
            is_alcohol: false,
            confidence: None,
            flags: RowFlags::default(),
            source_pages: vec![1],
        }
    }

    #[test]
    fn normalize_skips_nameless_and_converts_price() {
        let payload = ExtractionPayload {
            currency: "usd".into(),
            categories: vec![ExtractedCategory {
                name: Some("  Starters ".into()),
                items: vec![
                    item("  Soup ", Some(6.499), Some(0.9)),
                    ExtractedItem {
                        name: Some("   ".into()),
                        price: Some(3.0),
                        ..Default::default()
                    },
                    ExtractedItem {
                        name: None,
                        ..Default::default()
                    },
                ],
            }],
        };
        let rows = normalize_page(2, &payload, None, 0.55);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Soup");
        assert_eq!(rows[0].category.as_deref(), Some("Starters"));
        assert_eq!(rows[0].price_cents, Some(650));
        assert_eq!(rows[0].source_pages, vec![2]);
        assert!(!rows[0].flags.low_confidence);
    }

    #[test]
    fn normalize_currency_fallback_chain() {
        let mut no_currency = item("Tea", Some(2.0), None);
        no_currency.currency = None;
        let payload = ExtractionPayload {
            currency: "GBP".into(),
            categories: vec![ExtractedCategory {
                name: None,
                items: vec![no_currency.clone()],
            }],
        };
        assert_eq!(normalize_page(1, &payload, Some("EUR"), 0.55)[0].currency, "EUR");
        assert_eq!(normalize_page(1, &payload, None, 0.55)[0].currency, "GBP");

        let unknown = ExtractionPayload {
            currency: "XXX".into(),
            categories: payload.categories.clone(),
        };
        assert_eq!(normalize_page(1, &unknown, None, 0.55)[0].currency, "XXX");
    }

    #[test]
    fn normalize_flags_low_confidence_only_when_present() {
        let payload = ExtractionPayload {
            currency: "USD".into(),
            categories: vec![ExtractedCategory {
                name: None,
                items: vec![item("A", Some(1.0), Some(0.5)), item("B", Some(1.0), None)],
            }],
        };
        let rows = normalize_page(1, &payload, None, 0.55);
        assert!(rows[0].flags.low_confidence);
        assert!(!rows[1].flags.low_confidence);
    }

    #[test]
    fn negative_price_is_missing() {
        assert_eq!(to_minor_units(-1.0), None);
        assert_eq!(to_minor_units(f64::NAN), None);
        assert_eq!(to_minor_units(0.0), Some(0));
        assert_eq!(to_minor_units(12.99), Some(1299));
    }

    #[test]
    fn zero_price_placeholder_becomes_missing() {
        let payload = page(
            1,
            Some("Specials"),
            vec![
                item("Market fish", Some(0.0), Some(0.4)),
                item("Soup of the day", Some(0.0), None),
                item("Tap water", Some(0.0), Some(0.95)),
            ],
        )
        .payload;
        let mut rows = normalize_page(1, &payload, None, 0.55);
        assert_eq!(rows[0].price_cents, None);
        assert_eq!(rows[1].price_cents, None);
        assert_eq!(rows[2].price_cents, Some(0));

        flag_price_anomalies(&mut rows, 150_000);
        assert!(rows[0].flags.missing_price);
        assert!(rows[1].flags.missing_price);
        assert!(!rows[2].flags.missing_price);
    }

    #[test]
    fn dedupe_unions_flags_of_equal_key_rows() {
        let mut a = row(Some("Mains"), "Pizza", Some(1000));
        a.flags.low_confidence = true;
        a.confidence = Some(0.4);
        let mut b = row(Some("Mains"), " PIZZA ", Some(1000));
        b.flags.high_price = true;
        b.confidence = Some(0.9);
        b.source_pages = vec![3];

        let out = dedupe(vec![a, b]);
        assert_eq!(out.len(), 1);
        let f = &out[0].flags;
        assert!(f.low_confidence && f.high_price);
        assert_eq!(out[0].source_pages, vec![1, 3]);
    }

    #[test]
    fn dedupe_higher_confidence_supplies_fields() {
        let mut strong = row(Some("Mains"), "Pizza", Some(1000));
        strong.confidence = Some(0.9);
        strong.description = Some("Wood fired".into());
        let mut weak = row(Some("Specials"), "pizza", Some(1000));
        weak.confidence = Some(0.4);
        weak.description = Some("blurry".into());

        for input in [vec![weak.clone(), strong.clone()], vec![strong.clone(), weak.clone()]] {
            let out = dedupe(input);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].name, "Pizza");
            assert_eq!(out[0].description.as_deref(), Some("Wood fired"));
            assert_eq!(out[0].category.as_deref(), Some("Mains"));
            assert_eq!(out[0].price_cents, Some(1000));
            assert_eq!(out[0].confidence, Some(0.9));
        }
    }

    #[test]
    fn dedupe_keeps_different_prices_and_currencies_apart() {
        let a = row(None, "Pizza", Some(1000));
        let b = row(None, "Pizza", Some(1200));
        let mut c = row(None, "Pizza", Some(1000));
        c.currency = "EUR".into();
        let d = row(None, "Pizza", None);
        assert_eq!(dedupe(vec![a, b, c, d]).len(), 4);
    }

    #[test]
    fn missing_confidence_loses_to_any_confidence() {
        let unscored = row(None, "Cola", Some(300));
        let mut scored = row(None, "cola", Some(300));
        scored.confidence = Some(0.1);
        let out = dedupe(vec![unscored, scored]);
        assert_eq!(out[0].name, "cola");
    }

    #[test]
    fn null_category_sorts_last() {
        let mut rows = vec![row(None, "Zed", Some(100)), row(Some("Drinks"), "Ale", Some(500))];
        sort_rows(&mut rows);
        assert_eq!(rows[0].category.as_deref(), Some("Drinks"));
        assert_eq!(rows[1].category, None);
    }

    #[test]
    fn sort_is_case_insensitive_first() {
        let mut rows = vec![
            row(Some("mains"), "burger", Some(1)),
            row(Some("Desserts"), "Tart", Some(1)),
            row(Some("Mains"), "Apple", Some(1)),
        ];
        sort_rows(&mut rows);
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Tart", "burger", "Apple"]);
    }

    #[test]
    fn threshold_uses_sample_stddev() {
        // mean 13250, sample stddev 24500 → 13250 + 73500
        let t = price_threshold(&[1000, 1000, 1000, 50000], 150_000).unwrap();
        assert_eq!(t, 86_750.0);
    }

    #[test]
    fn threshold_capped_by_ceiling() {
        let t = price_threshold(&[1000, 1000, 1000, 50000], 40_000).unwrap();
        assert_eq!(t, 40_000.0);
        assert_eq!(price_threshold(&[], 40_000), None);
        assert_eq!(price_threshold(&[700], 40_000), Some(700.0));
    }

    #[test]
    fn outlier_below_threshold_is_not_flagged() {
        let mut rows: Vec<StagingRow> = [1000, 1000, 1000, 50000]
            .iter()
            .enumerate()
            .map(|(i, p)| row(None, &format!("Item {i}"), Some(*p)))
            .collect();
        let t = flag_price_anomalies(&mut rows, 150_000);
        assert_eq!(t, Some(86_750.0));
        assert!(rows.iter().all(|r| !r.flags.high_price));
    }

    #[test]
    fn outlier_above_ceiling_is_flagged_with_threshold() {
        let mut rows: Vec<StagingRow> = [1000, 1000, 1000, 50000]
            .iter()
            .enumerate()
            .map(|(i, p)| row(None, &format!("Item {i}"), Some(*p)))
            .collect();
        flag_price_anomalies(&mut rows, 40_000);
        let flagged: Vec<&StagingRow> = rows.iter().filter(|r| r.flags.high_price).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].price_cents, Some(50000));
        assert_eq!(flagged[0].flags.price_threshold_cents, Some(40_000.0));
    }

    #[test]
    fn missing_price_flagged_and_excluded_from_stats() {
        let mut rows = vec![
            row(None, "A", Some(1000)),
            row(None, "B", Some(1000)),
            row(None, "C", None),
        ];
        let t = flag_price_anomalies(&mut rows, 150_000);
        assert_eq!(t, Some(1000.0));
        assert!(rows[2].flags.missing_price);
        assert!(!rows[2].flags.high_price);
        assert!(!rows[0].flags.missing_price);
    }

    #[test]
    fn text_rendering() {
        let rows = vec![row(Some("Drinks"), "Ale", Some(550)), row(None, "Zed", None)];
        assert_eq!(
            render_text(&rows),
            "Drinks :: Ale :: 5.50 USD\nUncategorized :: Zed :: n/a USD"
        );
    }

    #[test]
    fn structured_groups_in_order_and_round_trips_prices() {
        let mut rows = vec![
            row(Some("Drinks"), "Ale", Some(550)),
            row(Some("Drinks"), "Cider", Some(499)),
            row(Some("Mains"), "Pie", Some(1299)),
            row(None, "Bread", Some(1)),
        ];
        sort_rows(&mut rows);
        let s = structure(&rows, "USD");
        let names: Vec<&str> = s.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Drinks", "Mains", UNCATEGORIZED]);
        assert_eq!(s.categories[0].items.len(), 2);

        let structured_prices: Vec<i64> = s
            .categories
            .iter()
            .flat_map(|c| c.items.iter())
            .map(|i| (i.price.unwrap() * 100.0).round() as i64)
            .collect();
        let original: Vec<i64> = rows.iter().map(|r| r.price_cents.unwrap()).collect();
        assert_eq!(structured_prices, original);
    }

    #[test]
    fn two_pages_same_item_merge_once() {
        let pages = vec![
            page(1, Some("Pizza"), vec![item("Pizza", Some(10.0), Some(0.6))]),
            page(2, Some("Pizza"), vec![item("pizza", Some(10.0), Some(0.9))]),
        ];
        let result = merge_pages(&pages, &MergeOptions::default());
        assert_eq!(result.items_count, 1);
        assert_eq!(result.rows[0].confidence, Some(0.9));
        assert_eq!(result.confidence.ge_90, 1);
        assert_eq!(result.confidence.ge_75, 1);
        assert_eq!(result.confidence.total(), 1);
        assert_eq!(result.rows[0].source_pages, vec![1, 2]);
        assert_eq!(result.max_price_cents, Some(1000));
        assert_eq!(result.currency, "USD");
    }

    #[test]
    fn merge_of_nothing_is_empty() {
        let result = merge_pages(&[PageResult::degraded(1)], &MergeOptions::default());
        assert_eq!(result.items_count, 0);
        assert_eq!(result.raw_text, "");
        assert!(result.structured.categories.is_empty());
        assert_eq!(result.currency, UNKNOWN_CURRENCY);
        assert_eq!(result.price_threshold_cents, None);
    }

    #[test]
    fn merge_is_page_order_insensitive() {
        let p1 = page(1, Some("Mains"), vec![item("Pie", Some(12.0), Some(0.7))]);
        let p2 = page(2, Some("Drinks"), vec![item("Ale", Some(5.0), Some(0.95))]);
        let a = merge_pages(&[p1.clone(), p2.clone()], &MergeOptions::default());
        let mut b = merge_pages(&[p2, p1], &MergeOptions::default());
        for r in b.rows.iter_mut() {
            r.source_pages.sort_unstable();
        }
        assert_eq!(a.rows, b.rows);
        assert_eq!(a.raw_text, b.raw_text);
    }

    #[test]
    fn declared_currency_wins() {
        let config = PipelineConfig::builder().default_currency("CAD").build().unwrap();
        assert_eq!(
            MergeOptions::new(&config, Some("eur")).declared_currency.as_deref(),
            Some("EUR")
        );
        assert_eq!(
            MergeOptions::new(&config, None).declared_currency.as_deref(),
            Some("CAD")
        );
    }
}
