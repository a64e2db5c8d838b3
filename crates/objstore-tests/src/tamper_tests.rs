//! Tamper detection: any change to signed envelope fields or stored bytes is an integrity
//! failure, never silently wrong data.

use crate::harness::*;
use objstore_transform::metadata::{
    COMP_UNCOMPRESSED_SHA1, ENC_IV, ENC_KEY_ID, ENC_OBJECT_KEY, ENC_SIGNATURE, ENC_UNENCRYPTED_SHA1,
    ENC_UNENCRYPTED_SIZE, TRANSFORM_MODE,
};
use objstore_transform::{CompressionMode, Metadata, TransformChain, TransformError};
use std::io::{Cursor, Read};

fn enc_chain() -> TransformChain {
    TransformChain::new()
        .with(encryption(key_a()))
        .unwrap()
        .with(compression(CompressionMode::Deflate, 6))
        .unwrap()
}

fn decode_err(chain: &TransformChain, object: &StoredObject) -> TransformError {
    match chain.decode(Box::new(Cursor::new(object.data.clone())), &object.metadata) {
        Err(e) => e,
        Ok(mut decoded) => {
            let mut out = Vec::new();
            let err = decoded
                .reader
                .read_to_end(&mut out)
                .expect_err("tampered object decoded cleanly");
            TransformError::from_io(err)
        }
    }
}

/// Replace the first base64 character with a different valid one.
fn flip_base64(value: &str) -> String {
    let mut chars: Vec<char> = value.chars().collect();
    chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
    chars.into_iter().collect()
}

fn stored_object() -> StoredObject {
    store(&enc_chain(), &payload(50_000), &Metadata::new(), 4096).unwrap()
}

#[test]
fn test_tampered_envelope_fields_are_integrity_errors() {
    init_test_tracing();
    let chain = enc_chain();
    let original = stored_object();
    for key in [ENC_IV, ENC_OBJECT_KEY, ENC_SIGNATURE] {
        let mut object = original.clone();
        let value = flip_base64(&object.metadata[key]);
        object.metadata.insert(key.to_string(), value);
        let err = decode_err(&chain, &object);
        assert!(err.is_integrity(), "{key}: {err}");
    }

    let mut object = original.clone();
    object
        .metadata
        .insert(ENC_UNENCRYPTED_SHA1.to_string(), sha1_hex(b"something else"));
    assert!(decode_err(&chain, &object).is_integrity());

    let mut object = original;
    let size: u64 = object.metadata[ENC_UNENCRYPTED_SIZE].parse().unwrap();
    object
        .metadata
        .insert(ENC_UNENCRYPTED_SIZE.to_string(), (size + 1).to_string());
    assert!(decode_err(&chain, &object).is_integrity());
}

#[test]
fn test_missing_envelope_field_is_integrity_error() {
    let chain = enc_chain();
    for key in [ENC_IV, ENC_OBJECT_KEY, ENC_SIGNATURE, ENC_UNENCRYPTED_SHA1] {
        let mut object = stored_object();
        object.metadata.remove(key);
        assert!(decode_err(&chain, &object).is_integrity(), "{key}");
    }
}

#[test]
fn test_flipped_ciphertext_bit_is_detected() {
    init_test_tracing();
    let chain = TransformChain::new().with(encryption(key_a())).unwrap();
    let data = payload(10_000);
    let mut object = store(&chain, &data, &Metadata::new(), 1000).unwrap();
    object.data[5000] ^= 0x01;
    assert!(decode_err(&chain, &object).is_integrity());
}

#[test]
fn test_truncated_ciphertext_is_detected() {
    let chain = TransformChain::new().with(encryption(key_a())).unwrap();
    let mut object = store(&chain, &payload(1000), &Metadata::new(), 1000).unwrap();
    object.data.truncate(object.data.len() - 16);
    assert!(decode_err(&chain, &object).is_integrity());
}

#[test]
fn test_tampered_compression_digest_is_detected() {
    let chain = TransformChain::new()
        .with(compression(CompressionMode::Lzma, 2))
        .unwrap();
    let mut object = store(&chain, &payload(20_000), &Metadata::new(), 999).unwrap();
    object
        .metadata
        .insert(COMP_UNCOMPRESSED_SHA1.to_string(), sha1_hex(b"nope"));
    assert!(decode_err(&chain, &object).is_integrity());
}

#[test]
fn test_unknown_key_id_is_key_not_found() {
    let mut object = stored_object();
    object
        .metadata
        .insert(ENC_KEY_ID.to_string(), "00".repeat(20));
    assert!(matches!(
        decode_err(&enc_chain(), &object),
        TransformError::KeyNotFound { .. }
    ));
}

#[test]
fn test_object_from_unknown_master_key_is_key_not_found() {
    let object = store(
        &TransformChain::new().with(encryption(key_b())).unwrap(),
        b"written elsewhere",
        &Metadata::new(),
        16,
    )
    .unwrap();
    match decode_err(&enc_chain(), &object) {
        TransformError::KeyNotFound { key_id } => assert_eq!(key_id, KEY_B_FINGERPRINT),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_unsupported_transform_in_record() {
    let mut object = stored_object();
    object.metadata.insert(
        TRANSFORM_MODE.to_string(),
        "COMP:Deflate/6|ENC:DES/ECB/NoPadding".to_string(),
    );
    assert!(matches!(
        decode_err(&enc_chain(), &object),
        TransformError::UnsupportedTransform(_)
    ));

    object
        .metadata
        .insert(TRANSFORM_MODE.to_string(), "SNAPPY:1".to_string());
    assert!(matches!(
        decode_err(&enc_chain(), &object),
        TransformError::UnsupportedTransform(_)
    ));
}

#[test]
fn test_removed_transform_list_is_integrity_error() {
    init_test_tracing();
    let mut object = stored_object();
    object.metadata.remove(TRANSFORM_MODE);
    let err = decode_err(&enc_chain(), &object);
    assert!(err.is_integrity(), "{err}");
}

#[test]
fn test_transform_list_missing_a_class_is_integrity_error() {
    let chain = enc_chain();
    let original = stored_object();

    let mut object = original.clone();
    object.metadata.insert(
        TRANSFORM_MODE.to_string(),
        "ENC:AES/CBC/PKCS5Padding".to_string(),
    );
    assert!(decode_err(&chain, &object).is_integrity());

    let mut object = original;
    object
        .metadata
        .insert(TRANSFORM_MODE.to_string(), "COMP:Deflate/6".to_string());
    assert!(decode_err(&chain, &object).is_integrity());
}

#[test]
fn test_plain_object_without_transform_fields_passes_through() {
    let object = StoredObject {
        data: b"never transformed".to_vec(),
        metadata: Metadata::from([("content-type".to_string(), "text/plain".to_string())]),
    };
    let (out, md) = load(&enc_chain(), &object).unwrap();
    assert_eq!(out, object.data);
    assert_eq!(md, object.metadata);
}
