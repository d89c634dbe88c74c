use rand::{Rng, SeedableRng, rngs::StdRng};

/// Draws initial parameter values uniformly from `[-r, r]` with `r = value / fan_in^exponent`.
#[derive(Debug, Clone)]
pub struct Initializer {
    value: f32,
    exponent: f32,
    rng: StdRng,
}

impl Default for Initializer {
    fn default() -> Self {
        Self::new(1.0, 0.5)
    }
}

impl Initializer {
    pub fn new(value: f32, exponent: f32) -> Self {
        Self {
            value,
            exponent,
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }

    /// Reproducible initializer.
    pub fn seeded(value: f32, exponent: f32, seed: u64) -> Self {
        Self {
            value,
            exponent,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn exponent(&self) -> f32 {
        self.exponent
    }

    /// Half-width of the sampling interval for a unit with `fan_in` inputs.
    pub fn range(&self, fan_in: usize) -> f32 {
        self.value / (fan_in.max(1) as f32).powf(self.exponent)
    }

    pub fn fill(&mut self, fan_in: usize, params: &mut [f32]) {
        let r = self.range(fan_in);
        for p in params {
            *p = self.rng.random_range(-r..=r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_in_range() {
        let mut init = Initializer::seeded(1.0, 0.5, 7);
        let mut params = [0.0f32; 64];
        init.fill(16, &mut params);
        assert_eq!(init.range(16), 0.25);
        assert!(params.iter().all(|p| p.abs() <= 0.25));
        assert!(params.iter().any(|&p| p != 0.0));
    }

    #[test]
    fn same_seed_same_values() {
        let mut a = [0.0f32; 8];
        let mut b = [0.0f32; 8];
        Initializer::seeded(0.5, 1.0, 3).fill(4, &mut a);
        Initializer::seeded(0.5, 1.0, 3).fill(4, &mut b);
        assert_eq!(a, b);
    }
}
