//! Outcome analysis for completed runs.
//!
//! Turns the runner's final offer into the numbers stored on a run: deal
//! value, per-dimension and per-product results. Also hosts the offer
//! convergence check used by analytics.

use super::model::{Scenario, UserRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Relative movement below which a dimension counts as converged.
pub const CONVERGENCE_THRESHOLD: f64 = 0.1;

/// Share of comparable dimensions that must converge.
pub const MIN_CONVERGENCE_RATIO: f64 = 0.5;

/// How a negotiated dimension landed relative to the user's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionResult {
    /// Dimension name.
    pub dimension: String,
    /// Value in the final offer.
    pub final_value: f64,
    /// User's target.
    pub target_value: f64,
    /// Lower bound of the acceptable range.
    pub min_value: f64,
    /// Upper bound of the acceptable range.
    pub max_value: f64,
    /// `min_value <= final_value <= max_value`.
    pub within_range: bool,
    /// Buyer: `final <= target`; seller: `final >= target`.
    pub achieved_target: bool,
}

/// How a product's unit price landed relative to the user's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductResult {
    /// Product name.
    pub product: String,
    /// Unit price in the final offer.
    pub agreed_price: f64,
    /// User's target unit price.
    pub target_price: f64,
    /// Expected volume.
    pub estimated_volume: f64,
    /// `agreed_price × estimated_volume`.
    pub subtotal: f64,
    /// Signed deviation from target in percent.
    pub price_vs_target_pct: f64,
}

/// Extract the `dimension_values` object from an offer.
///
/// Accepts both `{dimension_values: {...}}` and a bare map.
pub fn dimension_values(offer: &Value) -> Option<&serde_json::Map<String, Value>> {
    match offer.get("dimension_values") {
        Some(Value::Object(map)) => Some(map),
        Some(_) => None,
        None => offer.as_object(),
    }
}

/// Read a value as a number, accepting numeric strings like `"12.5"`.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Case-insensitive lookup of a numeric offer value.
fn lookup(values: &serde_json::Map<String, Value>, name: &str) -> Option<f64> {
    values
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| as_number(v))
}

/// Compare each scenario dimension with the final offer.
///
/// Dimensions missing from the offer, or with non-numeric values, are
/// skipped.
pub fn dimension_results(scenario: &Scenario, final_offer: &Value) -> Vec<DimensionResult> {
    let Some(values) = dimension_values(final_offer) else {
        return Vec::new();
    };

    scenario
        .dimensions
        .iter()
        .filter_map(|dim| {
            let final_value = lookup(values, &dim.name)?;
            let achieved_target = match scenario.user_role {
                UserRole::Buyer => final_value <= dim.target_value,
                UserRole::Seller => final_value >= dim.target_value,
            };
            Some(DimensionResult {
                dimension: dim.name.clone(),
                final_value,
                target_value: dim.target_value,
                min_value: dim.min_value,
                max_value: dim.max_value,
                within_range: final_value >= dim.min_value && final_value <= dim.max_value,
                achieved_target,
            })
        })
        .collect()
}

/// Compare each scenario product with the final offer.
pub fn product_results(scenario: &Scenario, final_offer: &Value) -> Vec<ProductResult> {
    let Some(values) = dimension_values(final_offer) else {
        return Vec::new();
    };

    scenario
        .products
        .iter()
        .filter_map(|product| {
            let agreed_price = lookup(values, &product.name)?;
            let price_vs_target_pct = if product.target_price == 0.0 {
                0.0
            } else {
                (agreed_price - product.target_price) / product.target_price * 100.0
            };
            Some(ProductResult {
                product: product.name.clone(),
                agreed_price,
                target_price: product.target_price,
                estimated_volume: product.estimated_volume,
                subtotal: agreed_price * product.estimated_volume,
                price_vs_target_pct,
            })
        })
        .collect()
}

/// Compute the deal value of a final offer.
///
/// With products: the sum of their subtotals. Without products: the
/// `price` dimension, multiplied by a `volume` dimension when present.
/// Returns `None` when nothing numeric matches.
pub fn deal_value(scenario: &Scenario, final_offer: &Value) -> Option<f64> {
    if !scenario.products.is_empty() {
        let products = product_results(scenario, final_offer);
        if products.is_empty() {
            return None;
        }
        return Some(products.iter().map(|p| p.subtotal).sum());
    }

    let values = dimension_values(final_offer)?;
    let price = lookup(values, "price")?;
    Some(match lookup(values, "volume") {
        Some(volume) => price * volume,
        None => price,
    })
}

/// Extra rounds granted per negotiated dimension, as a multiplier.
pub const COMPLEXITY_MULTIPLIER: f64 = 0.25;

/// Scale a base round limit by the number of dimensions, capped at `cap`.
///
/// Up to four dimensions keep the base; each further dimension adds a
/// quarter of it.
pub fn dynamic_max_rounds(base: u32, dimension_count: usize, cap: u32) -> u32 {
    let factor = (dimension_count as f64 * COMPLEXITY_MULTIPLIER).max(1.0);
    let scaled = (f64::from(base) * factor) as u32;
    scaled.min(cap)
}

/// Returns `true` if consecutive offers are converging.
///
/// A dimension converges when it moved less than
/// [`CONVERGENCE_THRESHOLD`] of its previous value; the offers converge
/// when at least [`MIN_CONVERGENCE_RATIO`] of the numeric dimensions
/// present in both did.
pub fn is_converging(current: &Value, previous: &Value) -> bool {
    let (Some(current), Some(previous)) = (dimension_values(current), dimension_values(previous))
    else {
        return false;
    };

    let mut comparable = 0usize;
    let mut converged = 0usize;
    for (name, value) in current {
        let (Some(now), Some(before)) = (as_number(value), previous.get(name).and_then(as_number))
        else {
            continue;
        };
        comparable += 1;
        if (now - before).abs() < (before * CONVERGENCE_THRESHOLD).abs() {
            converged += 1;
        }
    }

    if comparable == 0 {
        return false;
    }
    converged as f64 / comparable as f64 >= MIN_CONVERGENCE_RATIO
}
