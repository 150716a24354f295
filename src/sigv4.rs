//! AWS Signature V4 query presigning for the broker's MQTT-over-websocket endpoint.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::identity_provider::BrokerKeys;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "iotdevicegateway";
const PATH: &str = "/mqtt";

/// Returns `wss://{host}/mqtt?...` signed with `keys` at `now`.
///
/// The session token is appended after the signature; the gateway does not
/// include it in the signed query.
pub fn presign_websocket_url(
    host: &str,
    region: &str,
    keys: &BrokerKeys,
    now: DateTime<Utc>,
) -> String {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");

    let query = format!(
        "X-Amz-Algorithm={ALGORITHM}&X-Amz-Credential={}&X-Amz-Date={amz_date}&X-Amz-SignedHeaders=host",
        uri_encode(&format!("{}/{scope}", keys.access_key)),
    );
    let canonical_request = format!(
        "GET\n{PATH}\n{query}\nhost:{host}\n\nhost\n{}",
        hex::encode(Sha256::digest(b""))
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&keys.secret_key, &date_stamp, region, SERVICE);
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    format!(
        "wss://{host}{PATH}?{query}&X-Amz-Signature={signature}&X-Amz-Security-Token={}",
        uri_encode(&keys.session_token)
    )
}

fn signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("hmac key length is unrestricted"));
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encodes everything outside the RFC 3986 unreserved set
fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn keys() -> BrokerKeys {
        BrokerKeys {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: "tok/en+with=chars".to_string(),
        }
    }

    #[test]
    fn test_signing_key_reference_vector() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("AKID/20240101/eu-west-1"), "AKID%2F20240101%2Feu-west-1");
        assert_eq!(uri_encode("a+b=c d~"), "a%2Bb%3Dc%20d~");
    }

    #[test]
    fn test_presigned_url_layout() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let url = presign_websocket_url("example-ats.iot.eu-west-1.amazonaws.com", "eu-west-1", &keys(), now);

        assert!(url.starts_with(
            "wss://example-ats.iot.eu-west-1.amazonaws.com/mqtt?X-Amz-Algorithm=AWS4-HMAC-SHA256&"
        ));
        assert!(url.contains(
            "X-Amz-Credential=AKIDEXAMPLE%2F20240309%2Feu-west-1%2Fiotdevicegateway%2Faws4_request"
        ));
        assert!(url.contains("X-Amz-Date=20240309T070501Z&X-Amz-SignedHeaders=host"));
        assert!(url.ends_with("&X-Amz-Security-Token=tok%2Fen%2Bwith%3Dchars"));

        let signature = url
            .split("X-Amz-Signature=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_depends_on_time_and_secret() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        let host = "example-ats.iot.eu-west-1.amazonaws.com";

        let a = presign_websocket_url(host, "eu-west-1", &keys(), now);
        let b = presign_websocket_url(host, "eu-west-1", &keys(), now);
        let c = presign_websocket_url(host, "eu-west-1", &keys(), later);
        let mut other = keys();
        other.secret_key = "different".to_string();
        let d = presign_websocket_url(host, "eu-west-1", &other, now);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
