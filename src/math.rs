use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// Numerically stable `ln(sum(exp(values)))`.
///
/// Returns `-inf` for an empty slice and propagates NaN.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    let mut max = f64::NEG_INFINITY;
    for &val in values {
        if val.is_nan() {
            return f64::NAN;
        }
        if val > max {
            max = val;
        }
    }
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&val| (val - max).exp()).sum();
    max + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn check_logaddexp(x in -10f64..10f64, y in -10f64..10f64) {
            let a = (x.exp() + y.exp()).ln();
            let b = logaddexp(x, y);
            let neginf = f64::NEG_INFINITY;
            let nan = f64::NAN;
            prop_assert!((a - b).abs() < 1e-10);
            prop_assert_eq!(b, logaddexp(y, x));
            prop_assert_eq!(x, logaddexp(x, neginf));
            prop_assert_eq!(logaddexp(neginf, neginf), neginf);
            prop_assert!(logaddexp(nan, x).is_nan());
        }

        #[test]
        fn check_logsumexp(values in prop::collection::vec(-30f64..30f64, 1..50)) {
            let naive = values.iter().map(|x| x.exp()).sum::<f64>().ln();
            let stable = logsumexp(&values);
            prop_assert!((naive - stable).abs() < 1e-9);
            let folded = values.iter().fold(f64::NEG_INFINITY, |acc, &x| logaddexp(acc, x));
            prop_assert!((folded - stable).abs() < 1e-9);
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
    }

    #[test]
    fn logsumexp_edge_cases() {
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
        assert_eq!(logsumexp(&[f64::NEG_INFINITY; 3]), f64::NEG_INFINITY);
        assert!(logsumexp(&[1., f64::NAN]).is_nan());
        // would overflow a naive exp/ln
        let big = logsumexp(&[1000., 1000.]);
        assert!((big - (1000. + 2f64.ln())).abs() < 1e-12);
    }
}
