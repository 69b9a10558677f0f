//! Twisted Edwards curve arithmetic over the BN254 scalar field
//!
//! ## Overview
//! Everything the key-exchange protocol needs from the curve lives here:
//! affine points, the complete addition law, double-and-add scalar
//! multiplication, the on-curve membership test, and unbiased scalar
//! sampling. The curve itself is **configuration, not code**: all operations
//! are methods on [`CurveParams`], and the default parameter set is Baby
//! Jubjub (EIP-2494), whose coordinates live in `ark_bn254::Fr` (`F`).
//!
//! ## Invariants
//! - The affine identity is `(0, 1)`; `is_on_curve` accepts it.
//! - `a·x² + y² = 1 + d·x²·y²` holds for every point handed to or returned
//!   from this module; callers reject peer points that fail the test before
//!   any arithmetic touches them.
//! - Scalars are plain big-endian integers in `[1, order)`. Sampling rejects
//!   draws below `2^256 mod order` and reduces, so the result is uniform with
//!   no modulo bias; zero is resampled.

#![forbid(unsafe_code)]

use ark_ff::{BigInteger, Field, MontFp, One, PrimeField, Zero};
use num_bigint::BigUint;
use rand::{CryptoRng, RngCore};

use crate::F;

/// Baby Jubjub generator, x coordinate (EIP-2494).
const BJJ_GEN_X: F =
    MontFp!("995203441582195749578291179787384436505546430278305826713579947235728471134");
/// Baby Jubjub generator, y coordinate (EIP-2494).
const BJJ_GEN_Y: F =
    MontFp!("5472060717959818805561601436314318772137091100104008585924551046643952123905");
/// Baby Jubjub group order `n = 8·l` (EIP-2494), as a decimal string.
const BJJ_ORDER: &str =
    "21888242871839275222246405745257275088614511777268538073601725287587578984328";

/// Errors surfaced by curve arithmetic.
#[derive(Debug, thiserror::Error)]
pub enum CurveError {
    /// A point failed the curve membership test.
    #[error("point ({x}, {y}) is not on the curve")]
    InvalidPoint {
        /// Affine x coordinate, decimal.
        x: String,
        /// Affine y coordinate, decimal.
        y: String,
    },
    /// A denominator of the addition law vanished; inputs were not valid
    /// curve points for these parameters.
    #[error("degenerate denominator in point addition")]
    DegenerateSum,
}

/// An affine point `(x, y)` with coordinates in `F`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Point {
    /// Affine x coordinate.
    pub x: F,
    /// Affine y coordinate.
    pub y: F,
}

impl Point {
    /// Construct a point from raw coordinates (no curve check).
    #[inline]
    pub fn new(x: F, y: F) -> Self {
        Self { x, y }
    }

    /// The twisted Edwards identity element `(0, 1)`.
    #[inline]
    pub fn identity() -> Self {
        Self { x: F::zero(), y: F::one() }
    }

    /// Whether this point is the identity.
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.x.is_zero() && self.y.is_one()
    }
}

/// Immutable curve description: `a·x² + y² = 1 + d·x²·y²` over `F`, plus the
/// generator used for key generation and the group order used for scalar
/// sampling.
///
/// Passing a different `CurveParams` value is how a protocol revision swaps
/// curves; nothing in this crate hardcodes Baby Jubjub outside
/// [`CurveParams::baby_jubjub`].
#[derive(Clone, Debug)]
pub struct CurveParams {
    /// Twisted Edwards coefficient `a`.
    pub a: F,
    /// Twisted Edwards coefficient `d`.
    pub d: F,
    /// Fixed generator for keypair derivation.
    pub generator: Point,
    /// Order of the group generated by `generator`.
    pub order: BigUint,
}

impl CurveParams {
    /// Baby Jubjub (EIP-2494): `a = 168700`, `d = 168696`, generator and
    /// group order from the EIP.
    pub fn baby_jubjub() -> Self {
        Self {
            a: F::from(168700u64),
            d: F::from(168696u64),
            generator: Point::new(BJJ_GEN_X, BJJ_GEN_Y),
            order: BigUint::parse_bytes(BJJ_ORDER.as_bytes(), 10)
                .expect("curve order constant is a valid decimal literal"),
        }
    }

    /// Membership test: `a·x² + y² == 1 + d·x²·y²`.
    pub fn is_on_curve(&self, p: &Point) -> bool {
        let x2 = p.x.square();
        let y2 = p.y.square();
        self.a * x2 + y2 == F::one() + self.d * x2 * y2
    }

    /// Complete twisted Edwards addition:
    ///
    /// ```text
    /// x3 = (x1·y2 + y1·x2) / (1 + d·x1·x2·y1·y2)
    /// y3 = (y1·y2 − a·x1·x2) / (1 − d·x1·x2·y1·y2)
    /// ```
    ///
    /// The denominators are non-zero for all points on the curve with the
    /// Baby Jubjub parameters; a vanishing denominator therefore means an
    /// input was not a valid point and is reported as an error rather than
    /// silently mapped to the identity.
    pub fn add(&self, p: &Point, q: &Point) -> Result<Point, CurveError> {
        let xx = p.x * q.x;
        let yy = p.y * q.y;
        let cross = self.d * xx * yy;

        let x_den = (F::one() + cross).inverse().ok_or(CurveError::DegenerateSum)?;
        let y_den = (F::one() - cross).inverse().ok_or(CurveError::DegenerateSum)?;

        let x3 = (p.x * q.y + p.y * q.x) * x_den;
        let y3 = (yy - self.a * xx) * y_den;
        Ok(Point::new(x3, y3))
    }

    /// Scalar multiplication `k·p`, MSB-first double-and-add. The addition
    /// law is complete, so doubling reuses [`CurveParams::add`].
    pub fn scalar_mul(&self, k: &BigUint, p: &Point) -> Result<Point, CurveError> {
        let mut acc = Point::identity();
        for byte in k.to_bytes_be() {
            for shift in (0..8u8).rev() {
                acc = self.add(&acc, &acc)?;
                if (byte >> shift) & 1 == 1 {
                    acc = self.add(&acc, p)?;
                }
            }
        }
        Ok(acc)
    }

    /// Sample a scalar uniform over `[1, order)`.
    ///
    /// Draws 32 random bytes, rejects anything below `2^256 mod order`, and
    /// reduces. The surviving span is an exact multiple of `order`, so the
    /// reduction carries no bias; zero is resampled.
    pub fn sample_scalar<R: RngCore + CryptoRng>(&self, rng: &mut R) -> BigUint {
        let min_val = (BigUint::from(1u8) << 256usize) % &self.order;
        let zero = BigUint::from(0u8);
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            let draw = BigUint::from_bytes_be(&bytes);
            if draw < min_val {
                continue;
            }
            let scalar = draw % &self.order;
            if scalar != zero {
                return scalar;
            }
        }
    }
}

/// Fixed-width big-endian encoding of a field element (32 bytes).
pub fn fe_to_bytes_be(f: &F) -> [u8; 32] {
    let bytes = f.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Decimal rendering of a field element, as consumed by the circuit
/// toolchain.
pub fn fe_to_decimal(f: &F) -> String {
    BigUint::from(f.into_bigint()).to_str_radix(10)
}

/// Parse a decimal string into a field element. Fails on non-digit input and
/// on values at or above the field modulus (no silent reduction).
pub fn fe_from_decimal(s: &str) -> Option<F> {
    let value = BigUint::parse_bytes(s.as_bytes(), 10)?;
    if value >= BigUint::from(F::MODULUS) {
        return None;
    }
    Some(F::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generator_is_on_curve() {
        let curve = CurveParams::baby_jubjub();
        assert!(curve.is_on_curve(&curve.generator));
        assert!(curve.is_on_curve(&Point::identity()));
    }

    #[test]
    fn identity_is_neutral() {
        let curve = CurveParams::baby_jubjub();
        let g = curve.generator;
        let sum = curve.add(&g, &Point::identity()).unwrap();
        assert_eq!(sum, g);
        let sum = curve.add(&Point::identity(), &g).unwrap();
        assert_eq!(sum, g);
    }

    #[test]
    fn scalar_mul_matches_repeated_addition() {
        let curve = CurveParams::baby_jubjub();
        let g = curve.generator;

        // 5·G by double-and-add vs. G+G+G+G+G.
        let five_g = curve.scalar_mul(&BigUint::from(5u8), &g).unwrap();
        let mut acc = g;
        for _ in 0..4 {
            acc = curve.add(&acc, &g).unwrap();
        }
        assert_eq!(five_g, acc);
        assert!(curve.is_on_curve(&five_g));
    }

    #[test]
    fn scalar_mul_small_cases() {
        let curve = CurveParams::baby_jubjub();
        let g = curve.generator;

        let zero_g = curve.scalar_mul(&BigUint::from(0u8), &g).unwrap();
        assert!(zero_g.is_identity());

        let one_g = curve.scalar_mul(&BigUint::from(1u8), &g).unwrap();
        assert_eq!(one_g, g);

        let two_g = curve.scalar_mul(&BigUint::from(2u8), &g).unwrap();
        assert_eq!(two_g, curve.add(&g, &g).unwrap());
    }

    #[test]
    fn scalar_mul_is_deterministic() {
        // Same scalar, same point: byte-identical result across calls.
        let curve = CurveParams::baby_jubjub();
        let k = BigUint::from(5u8);
        let p1 = curve.scalar_mul(&k, &curve.generator).unwrap();
        let p2 = curve.scalar_mul(&k, &curve.generator).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn off_curve_point_is_rejected() {
        let curve = CurveParams::baby_jubjub();
        let bogus = Point::new(F::from(3u64), F::from(4u64));
        assert!(!curve.is_on_curve(&bogus));
    }

    #[test]
    fn sampled_scalars_are_in_range_and_vary() {
        let curve = CurveParams::baby_jubjub();
        let mut rng = StdRng::seed_from_u64(42);
        let zero = BigUint::from(0u8);

        let mut previous = None;
        for _ in 0..16 {
            let s = curve.sample_scalar(&mut rng);
            assert!(s > zero);
            assert!(s < curve.order);
            if let Some(prev) = previous.replace(s.clone()) {
                assert_ne!(prev, s, "consecutive draws should differ");
            }
        }
    }

    #[test]
    fn field_element_round_trips_through_decimal() {
        let f = F::from(123_456_789u64);
        let dec = fe_to_decimal(&f);
        assert_eq!(dec, "123456789");
        assert_eq!(fe_from_decimal(&dec), Some(f));

        // Values at or past the modulus are refused.
        let modulus = BigUint::from(F::MODULUS).to_str_radix(10);
        assert_eq!(fe_from_decimal(&modulus), None);
        assert_eq!(fe_from_decimal("not a number"), None);
    }

    #[test]
    fn byte_encoding_is_fixed_width() {
        let bytes = fe_to_bytes_be(&F::from(1u64));
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[31], 1);
        assert!(bytes[..31].iter().all(|&b| b == 0));
    }
}
