//! Reusable library routines.
//!
//! Every routine carries WGSL source for device backends and a native
//! implementation for the host. Routines over fixed-length rows take the row
//! length at construction since it is baked into the device source.

use crate::random::{RandomStream, SEED_WORDS};
use anyhow::{bail, Result};
use parafit_ir::{input, output, ElementType, FunctionBuilder, FunctionDescriptor, Precision};
use std::sync::Arc;

/// Name of the seed-row parameter consumed by random routines.
pub const RNG_STATE: &str = "_rng_state";

const RAND123_SOURCE: &str = r#"struct Rand123State {
  counter: vec4<u32>,
  key: vec2<u32>,
  block: u32,
}

fn rand123_init(words: array<u32, 6>) -> Rand123State {
  return Rand123State(vec4<u32>(words[0], words[1], words[2], words[3]), vec2<u32>(words[4], words[5]), 0u);
}

fn rand123_mulhilo(a: u32, b: u32) -> vec2<u32> {
  let a_lo = a & 0xffffu;
  let a_hi = a >> 16u;
  let b_lo = b & 0xffffu;
  let b_hi = b >> 16u;
  let lo_lo = a_lo * b_lo;
  let hi_lo = a_hi * b_lo;
  let lo_hi = a_lo * b_hi;
  let cross = (lo_lo >> 16u) + (hi_lo & 0xffffu) + lo_hi;
  let hi = a_hi * b_hi + (hi_lo >> 16u) + (cross >> 16u);
  let lo = (cross << 16u) | (lo_lo & 0xffffu);
  return vec2<u32>(hi, lo);
}

fn rand123_round(ctr: vec4<u32>, key: vec2<u32>) -> vec4<u32> {
  let p0 = rand123_mulhilo(0xD2511F53u, ctr.x);
  let p1 = rand123_mulhilo(0xCD9E8D57u, ctr.z);
  return vec4<u32>(p1.x ^ ctr.y ^ key.x, p1.y, p0.x ^ ctr.w ^ key.y, p0.y);
}

fn rand123_philox(counter: vec4<u32>, seed: vec2<u32>) -> vec4<u32> {
  var ctr = rand123_round(counter, seed);
  var key = seed;
  for (var r: u32 = 1u; r < 10u; r = r + 1u) {
    key = key + vec2<u32>(0x9E3779B9u, 0xBB67AE85u);
    ctr = rand123_round(ctr, key);
  }
  return ctr;
}

fn rand123_next(state: ptr<function, Rand123State>) -> vec4<u32> {
  let base = (*state).counter;
  let x = base.x + (*state).block;
  var carry = select(0u, 1u, x < base.x);
  let y = base.y + carry;
  carry = select(0u, 1u, carry == 1u && y == 0u);
  let z = base.z + carry;
  carry = select(0u, 1u, carry == 1u && z == 0u);
  let w = base.w + carry;
  (*state).block = (*state).block + 1u;
  return rand123_philox(vec4<u32>(x, y, z, w), (*state).key);
}

fn rand123_unit(word: u32) -> f32 {
  return f32(word >> 8u) * (1.0 / 16777216.0);
}

fn rand123_uniform(state: ptr<function, Rand123State>) -> f32 {
  return rand123_unit(rand123_next(state).x);
}

fn rand123_normal(state: ptr<function, Rand123State>) -> f32 {
  let words = rand123_next(state);
  let u1 = 1.0 - rand123_unit(words.x);
  let u2 = rand123_unit(words.y);
  return sqrt(-2.0 * log(u1)) * cos(6.283185307179586 * u2);
}"#;

/// Philox helpers shared by the samplers; not dispatchable on its own.
pub fn rand123() -> Result<Arc<FunctionDescriptor>> {
    FunctionBuilder::new("rand123").source(RAND123_SOURCE).build()
}

/// Fills each instance's `samples` row with draws from `U(min_val, max_val)`.
pub fn uniform_sampler(samples: usize) -> Result<Arc<FunctionDescriptor>> {
    sampler(
        "uniform_sampler",
        ["min_val", "max_val"],
        "a + rand123_uniform(&state) * (b - a)",
        samples,
        |stream, single, lo, hi| {
            if single {
                let (lo, hi) = (lo as f32, hi as f32);
                f64::from(lo + stream.uniform_f32() * (hi - lo))
            } else {
                lo + stream.uniform() * (hi - lo)
            }
        },
    )
}

/// Fills each instance's `samples` row with draws from `N(mean, std^2)`.
pub fn gaussian_sampler(samples: usize) -> Result<Arc<FunctionDescriptor>> {
    sampler(
        "gaussian_sampler",
        ["mean", "std"],
        "a + b * rand123_normal(&state)",
        samples,
        |stream, single, mean, std| {
            if single {
                f64::from(mean as f32 + std as f32 * stream.normal_f32())
            } else {
                mean + std * stream.normal()
            }
        },
    )
}

fn sampler<F>(
    name: &str,
    [first, second]: [&str; 2],
    device_draw: &str,
    samples: usize,
    draw: F,
) -> Result<Arc<FunctionDescriptor>>
where
    F: Fn(&mut RandomStream, bool, f64, f64) -> f64 + Send + Sync + 'static,
{
    if samples == 0 {
        bail!("{name} requires at least one sample per instance");
    }
    let source = format!(
        "fn {name}(first: ptr<function, {first}_record>, second: ptr<function, {second}_record>, samples: ptr<function, samples_record>, rng_state: ptr<function, {RNG_STATE}_record>) {{\n  var state = rand123_init(*rng_state);\n  let a = (*first)[0];\n  let b = (*second)[0];\n  for (var i: u32 = 0u; i < {samples}u; i = i + 1u) {{\n    (*samples)[i] = {device_draw};\n  }}\n}}"
    );

    FunctionBuilder::new(name)
        .param(input(first, ElementType::Float))
        .param(input(second, ElementType::Float))
        .param(output("samples", ElementType::Float))
        .param(input(RNG_STATE, ElementType::U32))
        .source(source)
        .depends_on(rand123()?)
        .native(move |record| {
            let lo = record.scalar(0)?;
            let hi = record.scalar(1)?;
            let single = record.precision() == Precision::Single;
            let words = record.words(3)?;
            if words.len() != SEED_WORDS {
                bail!("rng state row holds {} words", words.len());
            }
            let mut stream = RandomStream::from_seed_row(words)?;
            for value in record.floats_mut(2)? {
                *value = draw(&mut stream, single, lo, hi);
            }
            Ok(None)
        })
        .build()
}

/// Euclidean norm of a row of `length` values.
pub fn euclidean_norm(length: usize) -> Result<Arc<FunctionDescriptor>> {
    FunctionBuilder::new("euclidean_norm")
        .returns(ElementType::Float)
        .param(input("values", ElementType::Float))
        .source(format!(
            "fn euclidean_norm(values: ptr<function, values_record>) -> f32 {{\n  var sum = 0.0;\n  for (var i: u32 = 0u; i < {length}u; i = i + 1u) {{\n    sum = sum + (*values)[i] * (*values)[i];\n  }}\n  return sqrt(sum);\n}}"
        ))
        .native(|record| {
            let norm = record.floats(0)?.iter().map(|v| v * v).sum::<f64>().sqrt();
            Ok(Some(record.round(norm)))
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use parafit_ir::{compose, InstanceRecord, Slot};

    fn run(function: &FunctionDescriptor, record: &mut InstanceRecord) -> Option<f64> {
        let native = function.native().expect("native routine");
        native(record).expect("routine succeeds")
    }

    #[test]
    fn samplers_compose_after_philox_helpers() {
        let sampler = uniform_sampler(8).unwrap();
        let composed = compose(&sampler).unwrap();
        assert_eq!(composed.order, vec!["rand123", "uniform_sampler"]);
        assert!(composed.text.contains("i < 8u"));
        assert!(uniform_sampler(0).is_err());
    }

    #[test]
    fn uniform_sampler_is_a_function_of_the_seed_row() {
        let sampler = uniform_sampler(16).unwrap();
        let record = || {
            InstanceRecord::new(
                0,
                Precision::Double,
                vec![
                    Slot::Floats(vec![-2.0]),
                    Slot::Floats(vec![3.0]),
                    Slot::Floats(vec![0.0; 16]),
                    Slot::Words(vec![11, 12, 13, 14, 15, 16]),
                ],
            )
        };
        let mut first = record();
        let mut second = record();
        run(&sampler, &mut first);
        run(&sampler, &mut second);
        let draws = first.floats(2).unwrap();
        assert_eq!(draws, second.floats(2).unwrap());
        assert!(draws.iter().all(|v| (-2.0..3.0).contains(v)));

        let mut stream = RandomStream::from_seed_row(&[11, 12, 13, 14, 15, 16]).unwrap();
        assert_abs_diff_eq!(draws[0], -2.0 + 5.0 * stream.uniform());
    }

    #[test]
    fn single_precision_draws_are_representable_as_f32() {
        let sampler = gaussian_sampler(4).unwrap();
        let mut record = InstanceRecord::new(
            0,
            Precision::Single,
            vec![
                Slot::Floats(vec![1.0]),
                Slot::Floats(vec![0.5]),
                Slot::Floats(vec![0.0; 4]),
                Slot::Words(vec![1, 2, 3, 4, 5, 6]),
            ],
        );
        run(&sampler, &mut record);
        for value in record.floats(2).unwrap() {
            assert_eq!(*value, *value as f32 as f64);
        }
    }

    #[test]
    fn euclidean_norm_returns_scalar() {
        let norm = euclidean_norm(2).unwrap();
        let mut record =
            InstanceRecord::new(0, Precision::Double, vec![Slot::Floats(vec![3.0, 4.0])]);
        assert_eq!(run(&norm, &mut record), Some(5.0));
    }
}
