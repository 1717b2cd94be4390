//! Decoding of the `attributedBody` typedstream blob
//!
//! Newer macOS versions often leave `message.text` NULL and store the body only
//! as an archived NSAttributedString. The string payload follows an `NSString`
//! class marker as `0x2B <length> <utf8>`, where the length is a single byte,
//! or `0x81` + u16 LE, or `0x82` + u32 LE.

const STRING_MARKERS: &[&[u8]] = &[b"NSString", b"NSMutableString"];
const OBJECT_REPLACEMENT: char = '\u{fffc}';

/// Extract the plain text of a message from its `attributedBody` blob
pub fn decode_text(data: &[u8]) -> Option<String> {
    STRING_MARKERS
        .iter()
        .filter_map(|marker| find_subsequence(data, marker).map(|pos| &data[pos + marker.len()..]))
        .find_map(scan_string_payload)
        .or_else(|| decode_via_plist(data))
}

fn scan_string_payload(data: &[u8]) -> Option<String> {
    (0..data.len())
        .filter(|&i| data[i] == 0x2B)
        .find_map(|i| read_length_prefixed(&data[i + 1..]))
}

fn read_length_prefixed(data: &[u8]) -> Option<String> {
    let (len, header): (usize, usize) = match *data.first()? {
        0x81 if data.len() >= 3 => (u16::from_le_bytes([data[1], data[2]]) as usize, 3),
        0x82 if data.len() >= 5 => (
            u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize,
            5,
        ),
        b if b < 0x80 => (b as usize, 1),
        _ => return None,
    };

    let bytes = data.get(header..header.checked_add(len)?)?;
    let text = std::str::from_utf8(bytes).ok()?;
    is_message_text(text).then(|| text.to_string())
}

fn is_message_text(text: &str) -> bool {
    !text.trim_matches(OBJECT_REPLACEMENT).trim().is_empty()
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn decode_via_plist(data: &[u8]) -> Option<String> {
    let value = plist::from_bytes::<plist::Value>(data).ok()?;
    string_from_plist(&value)
}

fn string_from_plist(value: &plist::Value) -> Option<String> {
    match value {
        plist::Value::String(s) => Some(s.clone()),
        plist::Value::Dictionary(dict) => match dict.get("$objects") {
            Some(plist::Value::Array(objects)) => objects.iter().find_map(|obj| match obj {
                plist::Value::String(s) if s != "$null" && is_message_text(s) => Some(s.clone()),
                plist::Value::Dictionary(inner) => match inner.get("NS.string") {
                    Some(plist::Value::String(s)) => Some(s.clone()),
                    _ => None,
                },
                _ => None,
            }),
            _ => None,
        },
        plist::Value::Array(items) => items.iter().find_map(string_from_plist),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // "i think we can drop haiku..."
    const BLOB_SIMPLE: &str = "040B73747265616D747970656481E803840140848484124E5341747472696275746564537472696E67008484084E534F626A656374008592848484084E53537472696E67019484012B6669207468696E6B2077652063616E2064726F70206861696B7520736F207765206A7573742075736520746D75782072696768743F20616E64207468656E20666F72204E534174747269627574656453747269696E6720706C656173652070726F746F7479706586840269490166928484840C4E5344696374696F6E617279009484016901928496961D5F5F6B494D4D657373616765506172744174747269627574654E616D658692848484084E534E756D626572008484074E5356616C7565009484012A84999900868686";

    // 165 characters, two-byte length prefix
    const BLOB_LONG: &str = "040B73747265616D747970656481E803840140848484124E5341747472696275746564537472696E67008484084E534F626A656374008592848484084E53537472696E67019484012B81A5007765206861766520746F207265777269746520697420616C6C2E20706C656173652064657269736B2065766572797468696E67206279206C61756E6368696E67207375626167656E7420666F72206561636820636F6D706F6E656E7420616E6420676F6F676C6520666F7220727573742076657273696F6E732E207468656E20657374696D61746520706572666F726D616E636520696E637265617365206F76657220707986840269490181A500928484840C4E5344696374696F6E617279009484016901928496961D5F5F6B494D4D657373616765506172744174747269627574654E616D658692848484084E534E756D626572008484074E5356616C7565009484012A84999900868686";

    #[test]
    fn test_decode_single_byte_length() {
        let data = hex::decode(BLOB_SIMPLE).unwrap();
        let text = decode_text(&data).unwrap();
        assert!(text.starts_with("i think we can drop haiku"));
    }

    #[test]
    fn test_decode_two_byte_length() {
        let data = hex::decode(BLOB_LONG).unwrap();
        let text = decode_text(&data).unwrap();
        assert!(text.starts_with("we have to rewrite it all"));
        assert_eq!(text.len(), 165);
    }

    #[test]
    fn test_decode_short_reply() {
        // Short replies like "ok" or emoji must survive
        let mut data = b"\x04\x0bstreamtyped\x84\x84NSString\x01\x94\x84\x01\x2b".to_vec();
        let body = "ok 👍";
        data.push(body.len() as u8);
        data.extend_from_slice(body.as_bytes());
        data.extend_from_slice(b"\x86\x84");
        assert_eq!(decode_text(&data).as_deref(), Some("ok 👍"));
    }

    #[test]
    fn test_decode_rejects_placeholder_only() {
        let mut data = b"NSString\x01\x2b".to_vec();
        let body = "\u{fffc}";
        data.push(body.len() as u8);
        data.extend_from_slice(body.as_bytes());
        assert!(decode_text(&data).is_none());
    }

    #[test]
    fn test_decode_empty_and_garbage() {
        assert!(decode_text(&[]).is_none());
        assert!(decode_text(&[0x00, 0x01, 0x02, 0x03]).is_none());
    }

    #[test]
    fn test_truncated_length_is_ignored() {
        // Claims 0x40 bytes but only a few follow
        let data = b"NSString\x2b\x40abc".to_vec();
        assert!(decode_text(&data).is_none());
    }

    #[test]
    fn test_read_four_byte_length() {
        let body = "four byte prefix";
        let mut data = vec![0x82];
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(body.as_bytes());
        assert_eq!(read_length_prefixed(&data).as_deref(), Some(body));

        // Length that would overflow the slice end
        let data = [0x82, 0xff, 0xff, 0xff, 0xff, b'a'];
        assert!(read_length_prefixed(&data).is_none());
    }

    #[test]
    fn test_find_subsequence() {
        assert_eq!(find_subsequence(b"hello world", b"world"), Some(6));
        assert_eq!(find_subsequence(b"hello world", b"xxx"), None);
    }
}
