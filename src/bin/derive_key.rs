//! CLI key derivation: the buyer-side half of the oblivious key transfer
//!
//! Multiplies the peer's public point by the caller's private scalar and
//! expands the shared point into the session key pad. With `--unwrap` it
//! additionally reverses the seller's XOR wrapping and prints the recovered
//! master keys; without it the pad entries themselves are printed, which is
//! what the seller needs to wrap with in the first place.
//!
//! All scalars, coordinates, and keys go in and out as decimal integers,
//! the same form the circuit toolchain consumes.

#![forbid(unsafe_code)]

use std::env;

use num_bigint::BigUint;
use zktile::curve::{fe_from_decimal, Point};
use zktile::exchange::{derive_keys, shared_secret, unwrap_keys};
use zktile::{CurveParams, Key256, DEFAULT_KEY_COUNT};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "zktile=info".into()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = env::args().collect();

    let private = parse_flag(&args, "--private")
        .ok_or_else(|| anyhow::anyhow!("--private is required (decimal scalar)"))?;
    let private = BigUint::parse_bytes(private.trim().as_bytes(), 10)
        .ok_or_else(|| anyhow::anyhow!("--private is not a decimal integer"))?;

    let peer_x = parse_flag(&args, "--peer-x")
        .ok_or_else(|| anyhow::anyhow!("--peer-x is required (decimal coordinate)"))?;
    let peer_y = parse_flag(&args, "--peer-y")
        .ok_or_else(|| anyhow::anyhow!("--peer-y is required (decimal coordinate)"))?;
    let peer = Point::new(
        fe_from_decimal(&peer_x)
            .ok_or_else(|| anyhow::anyhow!("--peer-x does not encode a field element"))?,
        fe_from_decimal(&peer_y)
            .ok_or_else(|| anyhow::anyhow!("--peer-y does not encode a field element"))?,
    );

    let count: usize = match parse_flag(&args, "--count") {
        Some(n) => n.parse().map_err(|_| anyhow::anyhow!("--count must be a number"))?,
        None => DEFAULT_KEY_COUNT,
    };

    let curve = CurveParams::baby_jubjub();
    // Rejects an off-curve peer point before any arithmetic touches it.
    let secret = shared_secret(&curve, &private, &peer)?;
    let pad = derive_keys(&secret, count);

    match parse_flag(&args, "--unwrap") {
        Some(list) => {
            let wrapped: Vec<Key256> = list
                .split(',')
                .map(|s| {
                    Key256::from_decimal(s).ok_or_else(|| {
                        anyhow::anyhow!("wrapped key {s:?} is not a 256-bit decimal integer")
                    })
                })
                .collect::<Result<_, _>>()?;
            let masters = unwrap_keys(&wrapped, &pad)?;
            for (i, master) in masters.iter().enumerate() {
                println!("master_key{i} = {}", zktile::curve::fe_to_decimal(master));
            }
        }
        None => {
            for (i, key) in pad.iter().enumerate() {
                println!("key[{i}] = {}", key.to_decimal());
            }
        }
    }
    Ok(())
}
