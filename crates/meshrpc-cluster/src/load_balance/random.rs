use rand::Rng;
use std::sync::Arc;

use crate::invoker::InvokerRef;

/// Weighted random selection.
///
/// Picks uniformly when every weight is equal (or all are zero), otherwise
/// draws an offset in `[0, total)` and finds its owner among the cumulative
/// weights. Zero-weight endpoints are never picked while another endpoint
/// has weight.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRandom;

impl WeightedRandom {
    pub fn select(&self, invokers: &[InvokerRef]) -> Option<InvokerRef> {
        self.select_with(&mut rand::rng(), invokers)
    }

    pub fn select_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        invokers: &[InvokerRef],
    ) -> Option<InvokerRef> {
        let first = invokers.first()?;
        let first_weight = first.weight();

        let mut uniform = true;
        let mut total: u64 = 0;
        let mut cumulative = Vec::with_capacity(invokers.len());
        for invoker in invokers {
            let weight = invoker.weight();
            uniform &= weight == first_weight;
            total += u64::from(weight);
            cumulative.push(total);
        }

        let index = if uniform || total == 0 {
            rng.random_range(0..invokers.len())
        } else {
            let offset = rng.random_range(0..total);
            cumulative.partition_point(|&upper| upper <= offset)
        };
        invokers.get(index).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::weighted;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn histogram(invokers: &[InvokerRef], draws: usize) -> HashMap<String, usize> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = HashMap::new();
        for _ in 0..draws {
            let selected = WeightedRandom.select_with(&mut rng, invokers).unwrap();
            *counts.entry(selected.address().to_string()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_three_to_one_distribution() {
        let invokers = weighted(&[("a:1", 300), ("b:1", 100)]);
        let counts = histogram(&invokers, 40_000);

        let ratio = counts["a:1"] as f64 / counts["b:1"] as f64;
        assert!((2.7..3.3).contains(&ratio), "ratio was {}", ratio);
    }

    #[test]
    fn test_equal_weights_are_uniform() {
        let invokers = weighted(&[("a:1", 100), ("b:1", 100), ("c:1", 100)]);
        let counts = histogram(&invokers, 30_000);
        for address in ["a:1", "b:1", "c:1"] {
            let share = counts[address] as f64 / 30_000.0;
            assert!((0.30..0.37).contains(&share), "{} got {}", address, share);
        }
    }

    #[test]
    fn test_zero_weight_is_never_picked() {
        let invokers = weighted(&[("a:1", 0), ("b:1", 5), ("c:1", 0)]);
        let counts = histogram(&invokers, 1_000);
        assert_eq!(counts.get("b:1"), Some(&1_000));
    }

    #[test]
    fn test_all_zero_weights_fall_back_to_uniform() {
        let invokers = weighted(&[("a:1", 0), ("b:1", 0)]);
        let counts = histogram(&invokers, 1_000);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_empty_selects_nothing() {
        assert!(WeightedRandom.select(&[]).is_none());
    }
}
