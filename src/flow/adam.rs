//! Adam optimizer for the parameters of density transforms.
//!
//! Keeps exponentially decaying estimates of the first and second moments of
//! the gradient for every parameter and scales each update by their bias
//! corrected ratio.

/// Settings for the Adam optimizer
#[derive(Debug, Clone, Copy)]
pub struct AdamOptions {
    /// First moment decay rate (default: 0.9)
    pub beta1: f64,
    /// Second moment decay rate (default: 0.999)
    pub beta2: f64,
    /// Small constant for numerical stability (default: 1e-8)
    pub epsilon: f64,
    /// Learning rate (default: 0.01)
    pub learning_rate: f64,
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            learning_rate: 0.01,
        }
    }
}

/// Adam optimizer over a flat parameter vector.
#[derive(Clone, Debug)]
pub struct Adam {
    /// First moment estimate
    m: Vec<f64>,
    /// Second moment estimate
    v: Vec<f64>,
    /// Iteration counter
    t: u64,
    settings: AdamOptions,
}

impl Adam {
    pub fn new(settings: AdamOptions, num_params: usize) -> Self {
        Self {
            m: vec![0.; num_params],
            v: vec![0.; num_params],
            t: 0,
            settings,
        }
    }

    /// Take one descent step on `params` for the loss gradient `gradient`.
    pub fn step(&mut self, params: &mut [f64], gradient: &[f64]) {
        assert!(params.len() == self.m.len());
        assert!(gradient.len() == self.m.len());

        self.t += 1;
        let AdamOptions {
            beta1,
            beta2,
            epsilon,
            learning_rate,
        } = self.settings;
        let correction1 = 1.0 - beta1.powi(self.t as i32);
        let correction2 = 1.0 - beta2.powi(self.t as i32);

        itertools::izip!(
            params.iter_mut(),
            gradient.iter(),
            self.m.iter_mut(),
            self.v.iter_mut()
        )
        .for_each(|(param, &grad, m, v)| {
            *m = beta1 * *m + (1.0 - beta1) * grad;
            *v = beta2 * *v + (1.0 - beta2) * grad * grad;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *param -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
        });
    }

    pub fn num_steps(&self) -> u64 {
        self.t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(AdamOptions::default(), 2);
        let mut params = vec![1., -1.];
        adam.step(&mut params, &[3., -0.5]);
        assert_abs_diff_eq!(params[0], 1. - 0.01, epsilon = 1e-6);
        assert_abs_diff_eq!(params[1], -1. + 0.01, epsilon = 1e-6);
        assert_eq!(adam.num_steps(), 1);
    }

    #[test]
    fn minimizes_quadratic() {
        let options = AdamOptions {
            learning_rate: 0.1,
            ..Default::default()
        };
        let mut adam = Adam::new(options, 3);
        let target = [1., -2., 0.5];
        let mut params = vec![0.; 3];
        for _ in 0..2000 {
            let grad: Vec<f64> = params
                .iter()
                .zip(target.iter())
                .map(|(p, t)| 2. * (p - t))
                .collect();
            adam.step(&mut params, &grad);
        }
        for (p, t) in params.iter().zip(target.iter()) {
            assert_abs_diff_eq!(*p, *t, epsilon = 1e-2);
        }
    }
}
