use std::sync::Arc;
use std::thread;
use wssec::{
    derive_key, DerivationAlgorithm, DerivationLimits, DerivedKeyCache, DerivedKeyParams,
    SecurityToken, DEFAULT_LABEL,
};

fn params(nonce: &[u8], length: usize) -> DerivedKeyParams {
    DerivedKeyParams {
        generation: None,
        offset: None,
        length,
        label: DEFAULT_LABEL.to_vec(),
        nonce: nonce.to_vec(),
        algorithm: DerivationAlgorithm::Psha1,
    }
}

#[test]
fn derivation_is_deterministic_across_cache_instances() {
    let token = Arc::new(SecurityToken::symmetric("sess", vec![0x11u8; 32]));
    let cache_a = DerivedKeyCache::with_defaults();
    let cache_b = DerivedKeyCache::with_defaults();

    let a = cache_a.derive(&token, params(b"nonce", 32)).unwrap();
    let b = cache_b.derive(&token, params(b"nonce", 32)).unwrap();
    assert_eq!(a.as_slice(), b.as_slice());

    // and matches the bare derivation function
    let direct = derive_key(
        &[0x11u8; 32],
        &params(b"nonce", 32),
        &DerivationLimits::default(),
    )
    .unwrap();
    assert_eq!(a.as_slice(), direct.as_slice());
}

#[test]
fn concurrent_lookups_resolve_the_prf_once() {
    let cache = Arc::new(DerivedKeyCache::with_defaults());
    let token = Arc::new(SecurityToken::symmetric("sess", vec![0x22u8; 32]));

    // warm the slot so every thread hits the same entry
    let expected = cache.derive(&token, params(b"shared", 32)).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let token = Arc::clone(&token);
            thread::spawn(move || {
                cache
                    .derive(&token, params(b"shared", 32))
                    .unwrap()
                    .as_slice()
                    .to_vec()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected.as_slice());
    }
    assert_eq!(cache.derivation_count(), 1);
}

#[test]
fn ring_eviction_makes_oldest_entry_unreachable() {
    let capacity = 4;
    let cache = DerivedKeyCache::new(capacity, DerivationLimits::default());
    let token = Arc::new(SecurityToken::symmetric("sess", vec![0x33u8; 32]));
    let key = vec![0x33u8; 32];

    for i in 0..capacity as u8 {
        cache.derive(&token, params(&[i], 32)).unwrap();
    }
    assert!(cache.contains(&key, &params(&[0], 32)));

    cache.derive(&token, params(&[capacity as u8], 32)).unwrap();
    assert!(!cache.contains(&key, &params(&[0], 32)));

    // re-deriving the evicted parameters recomputes the PRF
    let before = cache.derivation_count();
    cache.derive(&token, params(&[0], 32)).unwrap();
    assert_eq!(cache.derivation_count(), before + 1);
}

#[test]
fn oversized_parameters_are_rejected_before_any_work() {
    let cache = DerivedKeyCache::with_defaults();
    let token = Arc::new(SecurityToken::symmetric("sess", vec![0x44u8; 32]));

    let mut oversized = params(b"n", 32);
    oversized.offset = Some(1_000_000);
    let err = cache.derive(&token, oversized).unwrap_err();
    assert!(err.is_limit_error());
    assert_eq!(cache.derivation_count(), 0);

    let mut oversized = params(&vec![0u8; 4096], 32);
    oversized.offset = None;
    let err = cache.derive(&token, oversized).unwrap_err();
    assert!(err.is_limit_error());
    assert_eq!(cache.derivation_count(), 0);
}
