//! Property-based round trips through full chains.

use crate::harness::*;
use objstore_transform::{CompressionMode, Metadata, TransformChain};
use proptest::prelude::*;

/// Generates random byte vectors up to `max_size` bytes.
pub fn arb_data(max_size: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..max_size)
}

/// Generates caller metadata outside the reserved namespaces.
pub fn arb_metadata() -> impl Strategy<Value = Metadata> {
    prop::collection::hash_map("[a-z][a-z0-9-]{0,12}", "[ -~]{0,24}", 0..4)
        .prop_filter("reserved namespace", |md| {
            md.keys().all(|k| !k.starts_with("x-emc-"))
        })
}

fn arb_mode() -> impl Strategy<Value = CompressionMode> {
    prop_oneof![Just(CompressionMode::Deflate), Just(CompressionMode::Lzma)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_chain_roundtrip(
        data in arb_data(40_000),
        md in arb_metadata(),
        mode in arb_mode(),
        level in 0u32..=9,
        chunk in 1usize..5000,
    ) {
        let chain = TransformChain::new()
            .with(compression(mode, level))
            .unwrap()
            .with(encryption(key_a()))
            .unwrap();
        let stored = store(&chain, &data, &md, chunk).unwrap();
        let (out, decoded_md) = load(&chain, &stored).unwrap();
        prop_assert_eq!(out, data);
        prop_assert_eq!(decoded_md, md);
    }

    #[test]
    fn prop_ciphertext_is_block_aligned(data in arb_data(5000)) {
        let chain = TransformChain::new().with(encryption(key_a())).unwrap();
        let stored = store(&chain, &data, &Metadata::new(), 333).unwrap();
        prop_assert_eq!(stored.data.len() % 16, 0);
        prop_assert!(stored.data.len() > data.len());
    }
}
