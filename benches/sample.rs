use std::convert::Infallible;

use anyhow::Result;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use ndarray::{Array1, ArrayD, IxDyn};
use nfns_rs::{
    AffineFlow, DensityTransform, EvaluationContext, FlowSettings, KernelDensity, LikelihoodOracle,
    LogDensities, Model, NestedSettings, Point, Population,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

struct NormalModel {
    dim: usize,
    mu: f64,
}

impl LikelihoodOracle for NormalModel {
    type Err = Infallible;

    fn dim(&self) -> usize {
        self.dim
    }

    fn evaluate(&self, position: &[f64]) -> std::result::Result<LogDensities, Infallible> {
        let prior = position.iter().map(|x| -0.5 * x * x).sum();
        let likelihood = position.iter().map(|x| -0.5 * (x - self.mu).powi(2)).sum();
        Ok(LogDensities::new(prior, likelihood))
    }
}

impl Model for NormalModel {
    type Oracle<'model> = &'model NormalModel;

    fn oracle(&self) -> Result<Self::Oracle<'_>> {
        Ok(self)
    }

    fn initial_point(&self) -> Result<Point> {
        Ok(Point::new().with("x", ArrayD::zeros(IxDyn(&[self.dim]))))
    }

    fn sample_prior<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        draws: usize,
        _var_names: &[&str],
    ) -> Result<Vec<Point>> {
        Ok((0..draws)
            .map(|_| {
                let x: Array1<f64> = (0..self.dim)
                    .map(|_| rng.sample::<f64, _>(StandardNormal))
                    .collect();
                Point::new().with("x", x.into_dyn())
            })
            .collect())
    }
}

fn normal_batch(dim: usize, n: usize) -> Vec<Box<[f64]>> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.sample(StandardNormal)).collect())
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let settings = FlowSettings::default();

    for dim in [10, 100] {
        let batch = normal_batch(dim, 500);
        c.bench_function(&format!("fit affine {}", dim), |b| {
            b.iter_batched(
                || ChaCha8Rng::seed_from_u64(42),
                |mut rng| {
                    let mut flow = AffineFlow::new();
                    flow.fit(&mut rng, black_box(&batch), &settings).unwrap();
                    flow
                },
                BatchSize::SmallInput,
            )
        });

        let mut flow = AffineFlow::new();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        flow.fit(&mut rng, &batch, &settings).unwrap();
        c.bench_function(&format!("sample affine {}", dim), |b| {
            b.iter(|| flow.sample(&mut rng, black_box(500)).unwrap())
        });

        let mut kde = KernelDensity::new(1.);
        kde.fit(&mut rng, &batch, &settings).unwrap();
        c.bench_function(&format!("log_prob kde {}", dim), |b| {
            b.iter(|| kde.log_prob(black_box(&batch)).unwrap())
        });

        let model = NormalModel { dim, mu: 1. };
        for parallel in [false, true] {
            c.bench_function(&format!("evaluate {} parallel={}", dim, parallel), |b| {
                b.iter_batched(
                    || batch.clone(),
                    |positions| {
                        let context = EvaluationContext::initialization(0);
                        Population::evaluate(&model, positions, parallel, context).unwrap()
                    },
                    BatchSize::SmallInput,
                )
            });
        }
    }

    let model = NormalModel { dim: 10, mu: 1. };
    let nested = NestedSettings {
        draws: 500,
        n_steps: 1,
        random_seed: Some(42),
        ..Default::default()
    };
    c.bench_function("nested step normal 10", |b| {
        b.iter_batched(
            || nested.new_chain(&model, AffineFlow::new(), 0, 42).unwrap(),
            |mut chain| chain.step().unwrap(),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
