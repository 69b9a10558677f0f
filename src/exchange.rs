//! Oblivious key transfer between seller and buyer
//!
//! ## Protocol
//! Both parties hold a keypair on the shared curve. Each side multiplies the
//! peer's public point by its own private scalar; by commutativity the two
//! products coincide, and that shared point is expanded into a pad of 256-bit
//! keys with Keccak-256. The seller XORs the image master keys against the
//! pad before publishing them in the proof witness; the buyer reverses the
//! XOR with the same pad. Nobody else learns the pad without one of the two
//! private scalars.
//!
//! ## Pad layout
//! Pad entry `i` is `keccak256(x ‖ y ‖ i)` where `x` and `y` are the shared
//! point's coordinates and `i` the entry index, each serialized as a 32-byte
//! big-endian integer. The pad is deterministic in the shared point, so both
//! sides derive it independently.
//!
//! ## Peer input hygiene
//! A peer-supplied public point is untrusted until it passes the curve
//! membership test; every operation here checks before multiplying.

#![forbid(unsafe_code)]

use num_bigint::BigUint;
use rand::{CryptoRng, RngCore};
use sha3::{Digest, Keccak256};

use crate::curve::{fe_to_bytes_be, CurveError, CurveParams, Point};
use crate::F;

/// Errors surfaced by the key-transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Underlying curve arithmetic rejected an input.
    #[error(transparent)]
    Curve(#[from] CurveError),
    /// The derived pad has fewer entries than the keys to (un)wrap.
    #[error("pad holds {pad} keys but {needed} are required")]
    PadTooShort {
        /// Number of pad entries available.
        pad: usize,
        /// Number of keys that need wrapping.
        needed: usize,
    },
    /// An unwrapped key does not fit the scalar field, so it cannot be the
    /// image of a wrapped field element under the same pad.
    #[error("unwrapped key {0} does not encode a field element")]
    KeyOutOfField(String),
}

/// A 256-bit symmetric key, the unit of the wrapping pad.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Key256(pub [u8; 32]);

impl Key256 {
    /// Big-endian bytes of the key.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fixed-width encoding of a field element as key material.
    pub fn from_field(f: &F) -> Self {
        Self(fe_to_bytes_be(f))
    }

    /// Reinterpret the key as a field element. `None` when the 256-bit value
    /// is at or above the field modulus; reduction would silently change the
    /// key, so the caller decides how to fail.
    pub fn to_field(&self) -> Option<F> {
        crate::curve::fe_from_decimal(&self.to_decimal())
    }

    /// Decimal rendering of the key as a 256-bit big-endian integer, the form
    /// the circuit toolchain consumes.
    pub fn to_decimal(&self) -> String {
        BigUint::from_bytes_be(&self.0).to_str_radix(10)
    }

    /// Parse the decimal rendering back into a key. `None` when the text is
    /// not a decimal integer or the value needs more than 256 bits.
    pub fn from_decimal(text: &str) -> Option<Self> {
        let value = BigUint::parse_bytes(text.trim().as_bytes(), 10)?;
        let bytes = value.to_bytes_be();
        if bytes.len() > 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        Some(Self(out))
    }

    /// Bytewise XOR. Self-inverse: `k.xor(p).xor(p) == k`.
    pub fn xor(&self, other: &Key256) -> Key256 {
        let mut out = [0u8; 32];
        for (slot, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *slot = a ^ b;
        }
        Key256(out)
    }
}

impl std::fmt::Debug for Key256 {
    // Keys are secrets; render a short fingerprint rather than the value.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key256({}..)", hex::encode(&self.0[..4]))
    }
}

/// A private scalar and the matching public point.
#[derive(Clone, Debug)]
pub struct KeyPair {
    /// Public point `private · G`.
    pub public: Point,
    /// Private scalar in `[1, order)`.
    pub private: BigUint,
}

impl KeyPair {
    /// Sample a fresh keypair on `curve`.
    pub fn generate<R: RngCore + CryptoRng>(
        curve: &CurveParams,
        rng: &mut R,
    ) -> Result<Self, ExchangeError> {
        let private = curve.sample_scalar(rng);
        let public = curve.scalar_mul(&private, &curve.generator)?;
        if !curve.is_on_curve(&public) {
            return Err(CurveError::InvalidPoint {
                x: public.x.to_string(),
                y: public.y.to_string(),
            }
            .into());
        }
        Ok(Self { public, private })
    }
}

/// Diffie-Hellman shared point: `private · peer_public`.
///
/// The peer point is validated against the curve equation first; an off-curve
/// point is rejected before any arithmetic uses it.
pub fn shared_secret(
    curve: &CurveParams,
    private: &BigUint,
    peer_public: &Point,
) -> Result<Point, ExchangeError> {
    if !curve.is_on_curve(peer_public) {
        return Err(CurveError::InvalidPoint {
            x: peer_public.x.to_string(),
            y: peer_public.y.to_string(),
        }
        .into());
    }
    Ok(curve.scalar_mul(private, peer_public)?)
}

/// Expand a shared point into `count` pad keys.
///
/// Entry `i` is `keccak256(x ‖ y ‖ i)` with all three operands as 32-byte
/// big-endian integers. Extending `count` later reproduces the earlier
/// entries unchanged.
pub fn derive_keys(secret: &Point, count: usize) -> Vec<Key256> {
    let x = fe_to_bytes_be(&secret.x);
    let y = fe_to_bytes_be(&secret.y);
    (0..count)
        .map(|i| {
            let mut index = [0u8; 32];
            index[24..].copy_from_slice(&(i as u64).to_be_bytes());

            let mut hasher = Keccak256::new();
            hasher.update(x);
            hasher.update(y);
            hasher.update(index);
            Key256(hasher.finalize().into())
        })
        .collect()
}

/// Wrap field-element master keys under a pad, one pad entry per key.
pub fn wrap_keys(keys: &[F], pad: &[Key256]) -> Result<Vec<Key256>, ExchangeError> {
    if pad.len() < keys.len() {
        return Err(ExchangeError::PadTooShort { pad: pad.len(), needed: keys.len() });
    }
    Ok(keys
        .iter()
        .zip(pad.iter())
        .map(|(key, mask)| Key256::from_field(key).xor(mask))
        .collect())
}

/// Reverse [`wrap_keys`] with the same pad, recovering the field elements.
///
/// Fails when the pad is shorter than the wrapped list or when an XOR result
/// does not fit the field, which means pad and ciphertext do not belong
/// together.
pub fn unwrap_keys(wrapped: &[Key256], pad: &[Key256]) -> Result<Vec<F>, ExchangeError> {
    if pad.len() < wrapped.len() {
        return Err(ExchangeError::PadTooShort { pad: pad.len(), needed: wrapped.len() });
    }
    wrapped
        .iter()
        .zip(pad.iter())
        .map(|(key, mask)| {
            let clear = key.xor(mask);
            clear
                .to_field()
                .ok_or_else(|| ExchangeError::KeyOutOfField(clear.to_decimal()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use sha3::{Digest, Keccak256};

    fn curve() -> CurveParams {
        CurveParams::baby_jubjub()
    }

    #[test]
    fn shared_secret_is_symmetric() {
        let curve = curve();
        let mut rng = StdRng::seed_from_u64(1);
        let seller = KeyPair::generate(&curve, &mut rng).unwrap();
        let buyer = KeyPair::generate(&curve, &mut rng).unwrap();

        let s1 = shared_secret(&curve, &seller.private, &buyer.public).unwrap();
        let s2 = shared_secret(&curve, &buyer.private, &seller.public).unwrap();
        assert_eq!(s1, s2);
        assert!(curve.is_on_curve(&s1));
    }

    #[test]
    fn off_curve_peer_is_rejected_before_use() {
        let curve = curve();
        let mut rng = StdRng::seed_from_u64(2);
        let seller = KeyPair::generate(&curve, &mut rng).unwrap();

        let bogus = Point::new(F::from(3u64), F::from(4u64));
        let err = shared_secret(&curve, &seller.private, &bogus).unwrap_err();
        assert!(matches!(err, ExchangeError::Curve(CurveError::InvalidPoint { .. })));
    }

    #[test]
    fn pad_derivation_is_deterministic_and_prefix_stable() {
        let curve = curve();
        let mut rng = StdRng::seed_from_u64(3);
        let pair = KeyPair::generate(&curve, &mut rng).unwrap();
        let secret = shared_secret(&curve, &pair.private, &pair.public).unwrap();

        let short = derive_keys(&secret, 3);
        let long = derive_keys(&secret, 7);
        assert_eq!(short.len(), 3);
        assert_eq!(long.len(), 7);
        // Growing the pad never rewrites earlier entries.
        assert_eq!(&long[..3], &short[..]);

        // Entries differ from one another.
        assert_ne!(short[0], short[1]);
        assert_ne!(short[1], short[2]);
    }

    #[test]
    fn pad_entry_matches_documented_layout() {
        let curve = curve();
        let mut rng = StdRng::seed_from_u64(4);
        let pair = KeyPair::generate(&curve, &mut rng).unwrap();
        let secret = shared_secret(&curve, &pair.private, &pair.public).unwrap();

        let keys = derive_keys(&secret, 2);

        // Recompute entry 1 from the documented preimage.
        let mut hasher = Keccak256::new();
        hasher.update(fe_to_bytes_be(&secret.x));
        hasher.update(fe_to_bytes_be(&secret.y));
        let mut index = [0u8; 32];
        index[31] = 1;
        hasher.update(index);
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(keys[1].as_bytes(), &expected);
    }

    #[test]
    fn wrap_then_unwrap_recovers_masters() {
        let curve = curve();
        let mut rng = StdRng::seed_from_u64(5);
        let seller = KeyPair::generate(&curve, &mut rng).unwrap();
        let buyer = KeyPair::generate(&curve, &mut rng).unwrap();

        let masters = vec![F::from(987_654_321u64), F::from(123_456_789u64)];

        let seller_secret = shared_secret(&curve, &seller.private, &buyer.public).unwrap();
        let wrapped = wrap_keys(&masters, &derive_keys(&seller_secret, 3)).unwrap();

        let buyer_secret = shared_secret(&curve, &buyer.private, &seller.public).unwrap();
        let recovered = unwrap_keys(&wrapped, &derive_keys(&buyer_secret, 3)).unwrap();
        assert_eq!(recovered, masters);
    }

    #[test]
    fn wrong_pad_does_not_unwrap() {
        let curve = curve();
        let mut rng = StdRng::seed_from_u64(6);
        let seller = KeyPair::generate(&curve, &mut rng).unwrap();
        let buyer = KeyPair::generate(&curve, &mut rng).unwrap();
        let stranger = KeyPair::generate(&curve, &mut rng).unwrap();

        let masters = vec![F::from(42u64)];
        let secret = shared_secret(&curve, &seller.private, &buyer.public).unwrap();
        let wrapped = wrap_keys(&masters, &derive_keys(&secret, 1)).unwrap();

        let wrong = shared_secret(&curve, &stranger.private, &seller.public).unwrap();
        match unwrap_keys(&wrapped, &derive_keys(&wrong, 1)) {
            // Either the stray XOR leaves the field...
            Err(ExchangeError::KeyOutOfField(_)) => {}
            // ...or it lands on some field element that is not the master.
            Ok(recovered) => assert_ne!(recovered, masters),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn short_pad_is_reported() {
        let masters = vec![F::from(1u64), F::from(2u64), F::from(3u64)];
        let pad = vec![Key256([0u8; 32]); 2];
        let err = wrap_keys(&masters, &pad).unwrap_err();
        assert!(matches!(err, ExchangeError::PadTooShort { pad: 2, needed: 3 }));
    }

    #[test]
    fn decimal_round_trips_and_rejects_oversize() {
        let key = Key256([0x1Bu8; 32]);
        assert_eq!(Key256::from_decimal(&key.to_decimal()), Some(key));

        // Leading zeroes pad back to the full width.
        assert_eq!(Key256::from_decimal("0"), Some(Key256([0u8; 32])));
        assert_eq!(Key256::from_decimal("255").unwrap().as_bytes()[31], 0xFF);

        // 2^256 needs 33 bytes; garbage is not a number at all.
        let too_big = (BigUint::from(1u8) << 256u32).to_str_radix(10);
        assert_eq!(Key256::from_decimal(&too_big), None);
        assert_eq!(Key256::from_decimal("not-a-key"), None);
    }

    #[test]
    fn xor_is_self_inverse() {
        let a = Key256([0xAAu8; 32]);
        let b = Key256([0x5Fu8; 32]);
        assert_eq!(a.xor(&b).xor(&b), a);
    }
}
