//! Secret-hash and device password-verifier helpers for the identity provider.
//!
//! The verifier is the SRP-6a value the provider stores for a remembered
//! device, computed over the 3072-bit MODP group of RFC 3526 with `g = 2`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

const N_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64",
    "ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B",
    "F12FFA06D98A0864D87602733EC86A64521F2B18177B200C",
    "BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31",
    "43DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF",
);
const GENERATOR: u32 = 2;
const SALT_BYTES: usize = 16;
const DEVICE_PASSWORD_LEN: usize = 16;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()_+-=[]{}|;:,.<>?";

/// Verifier and salt, base64 encoded as `ConfirmDevice` expects them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceVerifier {
    pub password_verifier: String,
    pub salt: String,
}

/// `base64(HMAC-SHA256(client_secret, username ‖ client_id))`
pub fn secret_hash(username: &str, client_id: &str, client_secret: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(client_secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac key length is unrestricted"));
    mac.update(username.as_bytes());
    mac.update(client_id.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Random device password with at least one letter, digit and symbol
pub fn random_device_password() -> String {
    let mut rng = rand::thread_rng();
    let all: Vec<u8> = [LETTERS, DIGITS, SYMBOLS].concat();

    let mut password = vec![
        LETTERS[rng.gen_range(0..LETTERS.len())],
        DIGITS[rng.gen_range(0..DIGITS.len())],
        SYMBOLS[rng.gen_range(0..SYMBOLS.len())],
    ];
    password.extend((3..DEVICE_PASSWORD_LEN).map(|_| all[rng.gen_range(0..all.len())]));
    password.shuffle(&mut rng);

    password.into_iter().map(char::from).collect()
}

/// Builds a fresh verifier for `device_password` under a random salt
pub fn device_verifier(
    device_group_key: &str,
    device_key: &str,
    device_password: &str,
) -> Result<DeviceVerifier, AuthError> {
    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    device_verifier_with_salt(device_group_key, device_key, device_password, &salt)
}

pub(crate) fn device_verifier_with_salt(
    device_group_key: &str,
    device_key: &str,
    device_password: &str,
    salt: &[u8],
) -> Result<DeviceVerifier, AuthError> {
    let n = modulus();
    let salt_hex = pad_hex(&BigUint::from_bytes_be(salt));

    let identity_hash = hex::encode(Sha256::digest(
        format!("{device_group_key}{device_key}:{device_password}").as_bytes(),
    ));
    let x_input = hex::decode(format!("{salt_hex}{identity_hash}"))
        .map_err(|e| AuthError::Verifier(e.to_string()))?;
    let x = BigUint::from_bytes_be(&Sha256::digest(&x_input));

    let verifier_hex = pad_hex(&BigUint::from(GENERATOR).modpow(&x, &n));

    Ok(DeviceVerifier {
        password_verifier: BASE64.encode(
            hex::decode(&verifier_hex).map_err(|e| AuthError::Verifier(e.to_string()))?,
        ),
        salt: BASE64.encode(hex::decode(&salt_hex).map_err(|e| AuthError::Verifier(e.to_string()))?),
    })
}

fn modulus() -> BigUint {
    BigUint::parse_bytes(N_HEX.as_bytes(), 16)
        .unwrap_or_else(|| unreachable!("group modulus is a valid hex literal"))
}

/// Hex of `value` padded to whole bytes, with a leading zero byte when the
/// high bit is set so the value stays positive as a signed big-endian number.
fn pad_hex(value: &BigUint) -> String {
    let hex = value.to_str_radix(16);
    if hex.len() % 2 == 1 {
        format!("0{hex}")
    } else if hex.starts_with(['8', '9', 'a', 'b', 'c', 'd', 'e', 'f']) {
        format!("00{hex}")
    } else {
        hex
    }
}
