#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use ed25519_dalek::{Signer, SigningKey};
    use x25519_dalek::{PublicKey, StaticSecret};

    use crate::cipher::{open, seal, IV_LEN};
    use crate::codes::pairing_code;
    use crate::hash::sha256;
    use crate::identity::{verify_signature, Identity};
    use crate::keys::{encode_public_key, to_spki, KeyKind};

    proptest! {
        // Round-trip under any key and plaintext
        #[test]
        fn test_cipher_round_trip(
            key in any::<[u8; 32]>(),
            plaintext in any::<Vec<u8>>()
        ) {
            let sealed = seal(&key, &plaintext).unwrap();
            prop_assert_eq!(open(&key, &sealed).unwrap(), plaintext);
        }

        // Any single bit flip in IV, ciphertext or tag is detected
        #[test]
        fn test_cipher_tamper_detection(
            key in any::<[u8; 32]>(),
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8
        ) {
            let mut sealed = seal(&key, &plaintext).unwrap();
            let i = index.index(sealed.len());
            sealed[i] ^= 1 << bit;
            prop_assert!(open(&key, &sealed).is_err());
        }

        // Flipping an IV bit specifically
        #[test]
        fn test_cipher_iv_tamper(
            key in any::<[u8; 32]>(),
            iv_index in 0..IV_LEN,
        ) {
            let mut sealed = seal(&key, b"command").unwrap();
            sealed[iv_index] ^= 0x80;
            prop_assert!(open(&key, &sealed).is_err());
        }

        // Verification accepts the raw and the SPKI form of the same key
        #[test]
        fn test_signature_key_format_tolerance(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>()
        ) {
            let sign_key = SigningKey::from_bytes(&seed);
            let raw = sign_key.verifying_key().to_bytes();
            let sig = sign_key.sign(&message).to_bytes();

            prop_assert!(verify_signature(&raw, &message, &sig).is_ok());
            let spki = to_spki(KeyKind::Ed25519, &raw);
            prop_assert!(verify_signature(&spki, &message, &sig).is_ok());
        }

        // Both sides of the agreement derive the same key
        #[test]
        fn test_shared_secret_symmetry(
            a_seed in any::<[u8; 32]>(),
            b_seed in any::<[u8; 32]>(),
        ) {
            let a = Identity::from_bytes(&a_seed, &a_seed);
            let b = Identity::from_bytes(&b_seed, &b_seed);

            let ab = a.derive_shared_secret(&b.kex_pub()).unwrap();
            let ba = b.derive_shared_secret(&a.kex_pub()).unwrap();
            prop_assert_eq!(ab, ba);

            let raw = StaticSecret::from(a_seed).diffie_hellman(&PublicKey::from(b.kex_pub()));
            prop_assert_eq!(ab, sha256(raw.as_bytes()));
        }

        // Same keys always give the same code
        #[test]
        fn test_pairing_code_determinism(
            peer in any::<[u8; 32]>(),
            navigator in any::<[u8; 32]>(),
        ) {
            let peer_b64 = encode_public_key(&peer);
            let nav_b64 = encode_public_key(&navigator);

            let first = pairing_code(&peer_b64, &nav_b64);
            prop_assert_eq!(&first, &pairing_code(&peer_b64, &nav_b64));
            prop_assert_eq!(first.len(), 6);
        }
    }

    #[test]
    fn test_pairing_code_distinguishes_peers() {
        let navigator = Identity::generate();
        let nav_b64 = navigator.sign_pub_b64();

        let codes: std::collections::HashSet<String> = (0..64)
            .map(|_| pairing_code(&Identity::generate().sign_pub_b64(), &nav_b64))
            .collect();
        // 64 draws from 10^6 values; a handful of collisions at most
        assert!(codes.len() > 60);
    }
}
