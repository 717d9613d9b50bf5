//! Per-market margin (overround): `Σ(1/price) - 1`. Reported for
//! event-detail reads only — no fair-odds redistribution is computed
//! from it.

use crate::types::Outcome;

pub fn margin(outcomes: &[Outcome]) -> Option<f64> {
    if outcomes.is_empty() || outcomes.iter().any(|o| o.price <= 0.0) {
        return None;
    }
    let sum_inv: f64 = outcomes.iter().map(|o| 1.0 / o.price).sum();
    Some(sum_inv - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(price: f64) -> Outcome {
        Outcome { name: "x".into(), price, active: true }
    }

    #[test]
    fn margin_of_fair_book_is_zero() {
        // 1/2 + 1/2 = 1.0 -> margin 0
        let outcomes = vec![outcome(2.0), outcome(2.0)];
        assert!((margin(&outcomes).unwrap() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn margin_reflects_overround() {
        let outcomes = vec![outcome(1.9), outcome(1.9)];
        let m = margin(&outcomes).unwrap();
        assert!(m > 0.0);
    }

    #[test]
    fn zero_price_yields_no_margin() {
        let outcomes = vec![outcome(0.0), outcome(2.0)];
        assert!(margin(&outcomes).is_none());
    }
}
