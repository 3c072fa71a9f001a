//! Client-facing reader names.
//!
//! Network readers are reported upstream as `/<ip>@<slot>` and shown to
//! clients as `Foxy NET <ip>-<slot>`; everything else becomes
//! `Foxy USB <name>`. Clients may send either form, optionally base64 encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const NET_PREFIX: &str = "Foxy NET ";
const USB_PREFIX: &str = "Foxy USB ";

pub fn encode_reader(reader: &str) -> String {
    if let Some(rest) = reader.strip_prefix('/') {
        if let Some((ip, slot)) = rest.split_once('@') {
            return format!("{NET_PREFIX}{ip}-{slot}");
        }
    }
    format!("{USB_PREFIX}{reader}")
}

pub fn decode_reader(name: &str) -> String {
    let name = name.trim();
    let decoded = STANDARD
        .decode(name)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .filter(|text| !text.is_empty() && !text.chars().any(char::is_control));
    let name = decoded.as_deref().unwrap_or(name);

    if let Some(rest) = name.strip_prefix(NET_PREFIX) {
        if let Some((ip, slot)) = rest.rsplit_once('-') {
            return format!("/{ip}@{slot}");
        }
        return rest.to_string();
    }
    if let Some(rest) = name.strip_prefix(USB_PREFIX) {
        return rest.to_string();
    }
    name.to_string()
}

/// Base64 of the decorated reader name, as listed by `LIST` and `ENUM`.
pub fn encode_reader_b64(reader: &str) -> String {
    STANDARD.encode(encode_reader(reader))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_reader_roundtrip() {
        let encoded = encode_reader("/10.0.0.7@2");
        assert_eq!(encoded, "Foxy NET 10.0.0.7-2");
        assert_eq!(decode_reader(&encoded), "/10.0.0.7@2");
    }

    #[test]
    fn usb_reader_roundtrip() {
        let encoded = encode_reader("Gemalto PC Twin Reader 00");
        assert_eq!(encoded, "Foxy USB Gemalto PC Twin Reader 00");
        assert_eq!(decode_reader(&encoded), "Gemalto PC Twin Reader 00");
    }

    #[test]
    fn base64_names_are_decoded_first() {
        let b64 = encode_reader_b64("/192.168.1.5@1");
        assert_eq!(decode_reader(&b64), "/192.168.1.5@1");
    }

    #[test]
    fn plain_token_ids_pass_through() {
        assert_eq!(decode_reader("T1"), "T1");
        assert_eq!(decode_reader(" T2 "), "T2");
    }
}
